//! Typed synchronization channel between controller and init process.
//!
//! One duplex channel exists per container-creation attempt, established
//! before the init process is spawned so both ends share access at process
//! creation. Messages are newline-delimited JSON frames over a Unix stream
//! socket pair; the strict request/acknowledge alternation of the bootstrap
//! handshake is carried by two tagged unions, one per direction, so an
//! out-of-order message is a type-level mismatch rather than a framing
//! accident.
//!
//! Both descriptors are close-on-exec. The controller therefore observes
//! the exec transition itself: its read returns end-of-stream exactly when
//! the init process has exec'd or died, and nothing else can produce one
//! once the init process has closed its inherited copy of the controller
//! end.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use capstan_common::error::{CapstanError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A step-boundary message sent by the init process.
///
/// Each request names the out-of-process work the controller must perform
/// before the init process can continue; `Failed` reports a terminal step
/// failure instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitRequest {
    /// Namespaces are joined and a new user namespace awaits its UID/GID
    /// maps.
    MappingsRequested,
    /// Ready to be placed into the container cgroup.
    CgroupRequested,
    /// Rootfs is prepared but not yet pivoted; pre-start hooks may run
    /// while the host view is still reachable.
    HooksRequested,
    /// The seccomp filter is installed.
    FilterLoaded,
    /// Bootstrap is complete; blocked awaiting the run order.
    ExecReady,
    /// A bootstrap step failed terminally.
    Failed {
        /// Name of the failing step.
        step: String,
        /// Description of the failure.
        message: String,
    },
}

/// An acknowledgement sent by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerAck {
    /// UID/GID maps are written; the init process may assume its mapped
    /// identity.
    MappingsWritten,
    /// The init process is a cgroup member and limits are in force.
    CgroupConfigured,
    /// Pre-start hooks finished successfully.
    HooksDone,
    /// Filter installation is acknowledged.
    FilterAcked,
    /// Proceed to exec.
    Run,
    /// Abandon the bootstrap and exit.
    Abort {
        /// Why the controller is aborting.
        reason: String,
    },
}

/// What the controller observed on a channel read.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The init process sent a request.
    Request(InitRequest),
    /// End of stream: the init process released its descriptors by exec
    /// or exit.
    Closed,
}

/// Line-framed JSON transport over one stream endpoint.
#[derive(Debug)]
struct Framed {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Framed {
    fn new(stream: UnixStream) -> Result<Self> {
        let writer = stream.try_clone().map_err(|e| CapstanError::Protocol {
            message: format!("duplicating channel descriptor failed: {e}"),
        })?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut frame = serde_json::to_string(message)?;
        frame.push('\n');
        self.writer
            .write_all(frame.as_bytes())
            .map_err(|e| CapstanError::Protocol {
                message: format!("channel write failed: {e}"),
            })
    }

    /// Reads one frame; `Ok(None)` is an orderly end of stream, which is
    /// a different outcome from a malformed frame.
    fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(|e| {
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                CapstanError::Protocol {
                    message: "handshake step deadline exceeded".into(),
                }
            } else {
                CapstanError::Protocol {
                    message: format!("channel read failed: {e}"),
                }
            }
        })?;
        if read == 0 {
            return Ok(None);
        }
        let message =
            serde_json::from_str(line.trim_end()).map_err(|e| CapstanError::Protocol {
                message: format!("malformed frame: {e}"),
            })?;
        Ok(Some(message))
    }

    fn set_read_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        self.reader
            .get_ref()
            .set_read_timeout(deadline)
            .map_err(|e| CapstanError::Protocol {
                message: format!("setting channel deadline failed: {e}"),
            })
    }

    fn raw_fds(&self) -> [RawFd; 2] {
        [self.reader.get_ref().as_raw_fd(), self.writer.as_raw_fd()]
    }
}

/// The controller's end of the channel.
#[derive(Debug)]
pub struct ControllerChannel {
    inner: Framed,
}

impl ControllerChannel {
    /// Receives the next init-side request, or observes the close.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a read failure, a tripped deadline, or
    /// a malformed frame.
    pub fn recv(&mut self) -> Result<ChannelEvent> {
        Ok(match self.inner.recv()? {
            Some(request) => ChannelEvent::Request(request),
            None => ChannelEvent::Closed,
        })
    }

    /// Sends an acknowledgement to the init process.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the write fails, including the broken
    /// pipe left by an init process that already exited.
    pub fn send(&mut self, ack: &ControllerAck) -> Result<()> {
        self.inner.send(ack)
    }

    /// Applies a per-read deadline to this end.
    ///
    /// The protocol itself has no built-in deadline; the engine layers one
    /// on every controller-side read so a wedged init process cannot hang
    /// the handshake indefinitely.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the socket option cannot be set.
    pub fn set_step_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    /// The raw descriptors backing this end.
    ///
    /// The init process closes its inherited copies of these immediately
    /// after the spawn.
    #[must_use]
    pub fn raw_fds(&self) -> [RawFd; 2] {
        self.inner.raw_fds()
    }
}

/// The init process's end of the channel.
#[derive(Debug)]
pub struct InitChannel {
    inner: Framed,
}

impl InitChannel {
    /// Sends a step-boundary request to the controller.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the write fails.
    pub fn send(&mut self, request: &InitRequest) -> Result<()> {
        self.inner.send(request)
    }

    /// Receives the next acknowledgement.
    ///
    /// # Errors
    ///
    /// A channel closed before the bootstrap finished is a fatal abort on
    /// this side, surfaced as a protocol error.
    pub fn recv(&mut self) -> Result<ControllerAck> {
        match self.inner.recv()? {
            Some(ack) => Ok(ack),
            None => Err(CapstanError::Protocol {
                message: "channel closed by controller during bootstrap".into(),
            }),
        }
    }

    /// Waits for one specific acknowledgement.
    ///
    /// # Errors
    ///
    /// An `Abort` surfaces its reason; any other unexpected acknowledgement
    /// is a protocol violation.
    pub fn await_ack(&mut self, expected: &ControllerAck) -> Result<()> {
        let ack = self.recv()?;
        if ack == *expected {
            return Ok(());
        }
        match ack {
            ControllerAck::Abort { reason } => Err(CapstanError::Protocol {
                message: format!("controller aborted the bootstrap: {reason}"),
            }),
            other => Err(CapstanError::Protocol {
                message: format!("expected {expected:?}, controller sent {other:?}"),
            }),
        }
    }
}

/// Creates a connected channel pair for one creation attempt.
///
/// # Errors
///
/// Returns a protocol error if the socket pair cannot be created.
pub fn pair() -> Result<(ControllerChannel, InitChannel)> {
    let (controller, init) = UnixStream::pair().map_err(|e| CapstanError::Protocol {
        message: format!("creating channel pair failed: {e}"),
    })?;
    Ok((
        ControllerChannel {
            inner: Framed::new(controller)?,
        },
        InitChannel {
            inner: Framed::new(init)?,
        },
    ))
}

/// Closes raw descriptors inherited across process creation.
///
/// The init process calls this on the controller end's descriptors right
/// after the spawn, so that end-of-stream on the controller side can only
/// be produced by the init process's own exec or exit.
pub fn close_inherited(fds: &[RawFd]) {
    for fd in fds {
        // SAFETY: these are this process's inherited copies of the peer
        // end, closed exactly once and never used afterwards.
        let _ = unsafe { libc::close(*fd) };
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn request_and_ack_cross_the_pair() {
        let (mut controller, mut init) = pair().expect("pair");
        init.send(&InitRequest::CgroupRequested).expect("send");
        let event = controller.recv().expect("recv");
        assert!(matches!(
            event,
            ChannelEvent::Request(InitRequest::CgroupRequested)
        ));
        controller
            .send(&ControllerAck::CgroupConfigured)
            .expect("ack");
        init.await_ack(&ControllerAck::CgroupConfigured)
            .expect("await ack");
    }

    #[test]
    fn failed_request_carries_its_report() {
        let (mut controller, mut init) = pair().expect("pair");
        init.send(&InitRequest::Failed {
            step: "MountsApplied".into(),
            message: "mount failed".into(),
        })
        .expect("send");

        let mut seen = false;
        if let ChannelEvent::Request(InitRequest::Failed { step, message }) =
            controller.recv().expect("recv")
        {
            assert_eq!(step, "MountsApplied");
            assert!(message.contains("mount"));
            seen = true;
        }
        assert!(seen, "expected the failed request");
    }

    #[test]
    fn end_of_stream_is_distinct_from_a_malformed_frame() {
        let (mut controller, init) = pair().expect("pair");
        drop(init);
        assert!(matches!(controller.recv().expect("recv"), ChannelEvent::Closed));

        let (ours, mut peer) = UnixStream::pair().expect("raw pair");
        let mut controller = ControllerChannel {
            inner: Framed::new(ours).expect("framed"),
        };
        peer.write_all(b"not json\n").expect("write junk");
        let err = controller.recv().expect_err("malformed frame must error");
        assert!(err.to_string().contains("malformed frame"));
    }

    #[test]
    fn premature_close_is_fatal_on_the_init_side() {
        let (controller, mut init) = pair().expect("pair");
        drop(controller);
        let err = init.recv().expect_err("close must be fatal");
        assert!(err.to_string().contains("closed by controller"));
    }

    #[test]
    fn read_deadline_trips_as_a_protocol_error() {
        let (mut controller, _init) = pair().expect("pair");
        controller
            .set_step_deadline(Some(Duration::from_millis(40)))
            .expect("deadline");
        let err = controller.recv().expect_err("deadline must trip");
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn abort_surfaces_its_reason() {
        let (mut controller, mut init) = pair().expect("pair");
        controller
            .send(&ControllerAck::Abort {
                reason: "operator cancel".into(),
            })
            .expect("send");
        let err = init
            .await_ack(&ControllerAck::Run)
            .expect_err("abort must error");
        assert!(err.to_string().contains("operator cancel"));
    }
}
