//! Spawning and supervising the init process.
//!
//! [`spawn`] clones the init process with the namespace flags from the
//! plan and returns a [`Handshake`]: the controller's end of the sync
//! channel plus the child's pid. The handshake is driven to the ready
//! state by answering each init request in protocol order, then released
//! with the run order or aborted with a reason.
//!
//! Request order is enforced here. The init side is trusted code, but it
//! runs inside namespaces with an attacker-influenced filesystem, so a
//! request arriving out of sequence is treated as divergence and ends the
//! creation attempt.

use std::time::Duration;

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::ContainerSpec;
use capstan_common::types::ExitStatus;
use capstan_core::namespace::NamespacePlan;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::sync::{ChannelEvent, ControllerAck, ControllerChannel, InitRequest};

#[cfg(target_os = "linux")]
use crate::init::BootstrapContext;
#[cfg(target_os = "linux")]
use crate::sync;

/// Stack for the cloned init process. The bootstrap itself is shallow;
/// the workload gets a fresh stack from exec.
#[cfg(target_os = "linux")]
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Controller-side work performed at the init process's request.
///
/// The lifecycle layer implements this against the real mapping writer,
/// cgroup driver, and hook runner; the handshake driver only sequences
/// the calls.
pub trait BootstrapOps {
    /// Writes the UID/GID maps for the given init pid.
    fn write_mappings(&mut self, pid: i32) -> Result<()>;

    /// Creates the cgroup, applies limits, and adds the init pid.
    fn configure_cgroup(&mut self, pid: i32) -> Result<()>;

    /// Runs pre-start hooks against the host view of the init pid.
    fn run_pre_start(&mut self, pid: i32) -> Result<()>;
}

/// The next request the protocol permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    Mappings,
    Cgroup,
    Hooks,
    Filter,
    Exec,
}

impl Expected {
    fn first(maps_user: bool) -> Self {
        if maps_user { Self::Mappings } else { Self::Cgroup }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Mappings => Some(Self::Cgroup),
            Self::Cgroup => Some(Self::Hooks),
            Self::Hooks => Some(Self::Filter),
            Self::Filter => Some(Self::Exec),
            Self::Exec => None,
        }
    }

    fn matches(self, request: &InitRequest) -> bool {
        matches!(
            (self, request),
            (Self::Mappings, InitRequest::MappingsRequested)
                | (Self::Cgroup, InitRequest::CgroupRequested)
                | (Self::Hooks, InitRequest::HooksRequested)
                | (Self::Filter, InitRequest::FilterLoaded)
                | (Self::Exec, InitRequest::ExecReady)
        )
    }

    fn name(self) -> &'static str {
        match self {
            Self::Mappings => "mappings_requested",
            Self::Cgroup => "cgroup_requested",
            Self::Hooks => "hooks_requested",
            Self::Filter => "filter_loaded",
            Self::Exec => "exec_ready",
        }
    }
}

/// A spawned init process mid-bootstrap, driven from the controller side.
#[derive(Debug)]
pub struct Handshake {
    channel: ControllerChannel,
    pid: i32,
    expected: Expected,
}

impl Handshake {
    /// The init process's pid in the controller's pid namespace.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Answers init requests until the process reports it is ready to
    /// exec.
    ///
    /// # Errors
    ///
    /// Returns the init side's own failure report as a bootstrap error,
    /// a protocol error for an out-of-order request, a closed channel,
    /// or an exceeded step deadline, and any error from `ops`. In every
    /// error case the caller owns teardown via [`Handshake::abort`].
    pub fn drive_to_ready<O: BootstrapOps>(&mut self, ops: &mut O) -> Result<()> {
        loop {
            let request = match self.channel.recv()? {
                ChannelEvent::Request(request) => request,
                ChannelEvent::Closed => {
                    return Err(CapstanError::Protocol {
                        message: "channel closed before the init process was ready".into(),
                    });
                }
            };

            match request {
                InitRequest::Failed { step, message } => {
                    return Err(CapstanError::Bootstrap { step, message });
                }
                other if !self.expected.matches(&other) => {
                    return Err(CapstanError::Protocol {
                        message: format!(
                            "expected {}, init sent {other:?}",
                            self.expected.name()
                        ),
                    });
                }
                InitRequest::MappingsRequested => {
                    ops.write_mappings(self.pid)?;
                    self.channel.send(&ControllerAck::MappingsWritten)?;
                }
                InitRequest::CgroupRequested => {
                    ops.configure_cgroup(self.pid)?;
                    self.channel.send(&ControllerAck::CgroupConfigured)?;
                }
                InitRequest::HooksRequested => {
                    ops.run_pre_start(self.pid)?;
                    self.channel.send(&ControllerAck::HooksDone)?;
                }
                InitRequest::FilterLoaded => {
                    self.channel.send(&ControllerAck::FilterAcked)?;
                }
                InitRequest::ExecReady => return Ok(()),
            }

            if let Some(next) = self.expected.next() {
                self.expected = next;
            }
        }
    }

    /// Sends the run order; the init process execs the workload.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the order cannot be written, which
    /// means the init process died between ready and release.
    pub fn release(mut self) -> Result<()> {
        self.channel.send(&ControllerAck::Run)
    }

    /// Aborts the bootstrap and reaps the init process.
    ///
    /// The abort message is best-effort; the kill is not. Returns the
    /// reaped status when one could be collected.
    pub fn abort(mut self, reason: &str) -> Option<ExitStatus> {
        let _ = self.channel.send(&ControllerAck::Abort {
            reason: reason.to_owned(),
        });
        // The init process may be wedged in a syscall rather than parked
        // at a sync point, so the kill comes unconditionally before the
        // blocking reap.
        let _ = signal::kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        match reap(self.pid) {
            Ok(status) => {
                tracing::debug!(pid = self.pid, %status, reason, "bootstrap aborted");
                Some(status)
            }
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "could not reap aborted init process");
                None
            }
        }
    }
}

/// Clones the init process and starts the bootstrap.
///
/// The child closes its inherited copies of the controller channel end
/// immediately, then walks the bootstrap sequence; the parent gets the
/// controller end with the step deadline armed.
///
/// # Errors
///
/// Returns a bootstrap error for the `Spawned` step when the clone
/// itself fails, or a protocol error when the channel cannot be set up.
#[cfg(target_os = "linux")]
pub fn spawn(
    spec: ContainerSpec,
    plan: NamespacePlan,
    step_deadline: Option<Duration>,
) -> Result<Handshake> {
    let flags = plan.clone_flags();
    let maps_user = plan.creates_user();

    let (controller, init_channel) = sync::pair()?;
    controller.set_step_deadline(step_deadline)?;
    let controller_fds = controller.raw_fds();

    let ctx = BootstrapContext::new(spec, plan);
    let mut payload = Some((ctx, init_channel));
    let callback = Box::new(move || -> isize {
        // First thing in the child: drop the inherited copies of the
        // controller end so EOF on it tracks the controller alone.
        sync::close_inherited(&controller_fds);
        match payload.take() {
            Some((ctx, mut channel)) => crate::init::run(ctx, &mut channel),
            None => 1,
        }
    });

    let mut stack = vec![0_u8; CHILD_STACK_SIZE];
    // SAFETY: no CLONE_VM, so the child runs on a copy-on-write image of
    // this address space and the stack slice only needs to outlive the
    // call in the parent. The callback owns everything it touches.
    let pid = unsafe { nix::sched::clone(callback, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| CapstanError::bootstrap("Spawned", format!("clone: {e}")))?;

    tracing::debug!(pid = pid.as_raw(), ?flags, "init process spawned");
    Ok(Handshake {
        channel: controller,
        pid: pid.as_raw(),
        expected: Expected::first(maps_user),
    })
}

/// Stub for platforms without Linux namespaces.
///
/// # Errors
///
/// Always returns [`CapstanError::Unsupported`].
#[cfg(not(target_os = "linux"))]
pub fn spawn(
    _spec: ContainerSpec,
    _plan: NamespacePlan,
    _step_deadline: Option<Duration>,
) -> Result<Handshake> {
    Err(CapstanError::Unsupported {
        operation: "container bootstrap",
    })
}

/// Blocks until the process exits and collects its status.
///
/// A process already collected elsewhere reports an unknown status
/// instead of an error, so teardown paths stay idempotent.
///
/// # Errors
///
/// Returns a protocol error for wait failures other than `ECHILD`.
pub fn reap(pid: i32) -> Result<ExitStatus> {
    match waitpid(Pid::from_raw(pid), None) {
        Ok(status) => Ok(exit_status_from(status).unwrap_or(ExitStatus {
            code: None,
            signal: None,
        })),
        Err(Errno::ECHILD) => Ok(ExitStatus {
            code: None,
            signal: None,
        }),
        Err(e) => Err(CapstanError::Protocol {
            message: format!("waitpid({pid}): {e}"),
        }),
    }
}

/// Collects the exit status without blocking.
///
/// Returns `None` while the process is still running.
///
/// # Errors
///
/// Returns a protocol error for wait failures other than `ECHILD`.
pub fn try_reap(pid: i32) -> Result<Option<ExitStatus>> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(None),
        Ok(status) => Ok(exit_status_from(status)),
        Err(Errno::ECHILD) => Ok(Some(ExitStatus {
            code: None,
            signal: None,
        })),
        Err(e) => Err(CapstanError::Protocol {
            message: format!("waitpid({pid}): {e}"),
        }),
    }
}

/// Sends SIGKILL, ignoring every failure.
///
/// Used when tearing down a group whose members may already be exiting;
/// a pid that vanished between listing and kill is not an error.
pub fn force_kill(pid: i32) {
    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
        if e != Errno::ESRCH {
            tracing::debug!(pid, error = %e, "kill failed");
        }
    }
}

/// Delivers a signal to the init process.
///
/// # Errors
///
/// Returns a config error for an unknown signal number, a state error
/// when the process is already gone, and a protocol error otherwise.
pub fn deliver_signal(pid: i32, signal: i32) -> Result<()> {
    let sig = Signal::try_from(signal).map_err(|_| CapstanError::Config {
        message: format!("unknown signal number {signal}"),
    })?;
    signal::kill(Pid::from_raw(pid), sig).map_err(|e| match e {
        Errno::ESRCH => CapstanError::State {
            operation: "signal",
            current: "stopped".to_owned(),
        },
        other => CapstanError::Protocol {
            message: format!("kill({pid}, {sig}): {other}"),
        },
    })
}

fn exit_status_from(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::signaled(signal as i32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::thread;

    use super::*;
    use crate::sync::{InitChannel, pair};

    /// Records the ops calls the handshake driver makes, in order.
    #[derive(Default)]
    struct RecordingOps {
        calls: Vec<&'static str>,
        fail_on: Option<&'static str>,
    }

    impl RecordingOps {
        fn record(&mut self, call: &'static str) -> Result<()> {
            self.calls.push(call);
            if self.fail_on == Some(call) {
                return Err(CapstanError::Resource {
                    message: format!("{call} refused"),
                });
            }
            Ok(())
        }
    }

    impl BootstrapOps for RecordingOps {
        fn write_mappings(&mut self, _pid: i32) -> Result<()> {
            self.record("mappings")
        }

        fn configure_cgroup(&mut self, _pid: i32) -> Result<()> {
            self.record("cgroup")
        }

        fn run_pre_start(&mut self, _pid: i32) -> Result<()> {
            self.record("hooks")
        }
    }

    fn handshake_over(channel: ControllerChannel, maps_user: bool) -> Handshake {
        Handshake {
            channel,
            pid: 4242,
            expected: Expected::first(maps_user),
        }
    }

    /// Plays the init side of a full, well-ordered handshake.
    fn well_behaved_init(mut channel: InitChannel, maps_user: bool) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            if maps_user {
                channel
                    .send(&InitRequest::MappingsRequested)
                    .expect("send mappings request");
                channel
                    .await_ack(&ControllerAck::MappingsWritten)
                    .expect("mappings ack");
            }
            channel
                .send(&InitRequest::CgroupRequested)
                .expect("send cgroup request");
            channel
                .await_ack(&ControllerAck::CgroupConfigured)
                .expect("cgroup ack");
            channel
                .send(&InitRequest::HooksRequested)
                .expect("send hooks request");
            channel
                .await_ack(&ControllerAck::HooksDone)
                .expect("hooks ack");
            channel
                .send(&InitRequest::FilterLoaded)
                .expect("send filter notice");
            channel
                .await_ack(&ControllerAck::FilterAcked)
                .expect("filter ack");
            channel
                .send(&InitRequest::ExecReady)
                .expect("send ready");
            channel.await_ack(&ControllerAck::Run).expect("run order");
        })
    }

    #[test]
    fn drives_full_handshake_in_order() {
        let (controller, init_channel) = pair().expect("channel pair");
        let init = well_behaved_init(init_channel, true);

        let mut handshake = handshake_over(controller, true);
        let mut ops = RecordingOps::default();
        handshake.drive_to_ready(&mut ops).expect("handshake drives to ready");
        assert_eq!(ops.calls, vec!["mappings", "cgroup", "hooks"]);

        handshake.release().expect("release sends run order");
        init.join().expect("init side completed");
    }

    #[test]
    fn skips_mapping_exchange_without_user_namespace() {
        let (controller, init_channel) = pair().expect("channel pair");
        let init = well_behaved_init(init_channel, false);

        let mut handshake = handshake_over(controller, false);
        let mut ops = RecordingOps::default();
        handshake.drive_to_ready(&mut ops).expect("handshake drives to ready");
        assert_eq!(ops.calls, vec!["cgroup", "hooks"]);

        handshake.release().expect("release sends run order");
        init.join().expect("init side completed");
    }

    #[test]
    fn out_of_order_request_is_a_protocol_violation() {
        let (controller, init_channel) = pair().expect("channel pair");
        let init = thread::spawn(move || {
            let mut channel = init_channel;
            // Mapping exchange is expected first; jump straight to cgroups.
            channel
                .send(&InitRequest::CgroupRequested)
                .expect("send out-of-order request");
            // The controller hangs up instead of acking.
            assert!(channel.recv().is_err());
        });

        let mut handshake = handshake_over(controller, true);
        let mut ops = RecordingOps::default();
        let err = handshake
            .drive_to_ready(&mut ops)
            .expect_err("out-of-order request must fail");
        assert!(matches!(err, CapstanError::Protocol { .. }));
        assert!(err.to_string().contains("mappings_requested"), "{err}");
        assert!(ops.calls.is_empty(), "no ops may run after divergence");

        drop(handshake);
        init.join().expect("init side completed");
    }

    #[test]
    fn failure_report_surfaces_as_bootstrap_error() {
        let (controller, init_channel) = pair().expect("channel pair");
        let init = thread::spawn(move || {
            let mut channel = init_channel;
            channel
                .send(&InitRequest::Failed {
                    step: "CgroupJoined".into(),
                    message: "cgroup.procs write refused".into(),
                })
                .expect("send failure report");
        });

        let mut handshake = handshake_over(controller, false);
        let mut ops = RecordingOps::default();
        let err = handshake
            .drive_to_ready(&mut ops)
            .expect_err("failure report must surface");
        assert!(
            matches!(
                &err,
                CapstanError::Bootstrap { step, message }
                    if step == "CgroupJoined" && message == "cgroup.procs write refused"
            ),
            "unexpected error: {err}"
        );
        init.join().expect("init side completed");
    }

    #[test]
    fn closed_channel_before_ready_is_a_protocol_violation() {
        let (controller, init_channel) = pair().expect("channel pair");
        drop(init_channel);

        let mut handshake = handshake_over(controller, false);
        let mut ops = RecordingOps::default();
        let err = handshake
            .drive_to_ready(&mut ops)
            .expect_err("EOF before ready must fail");
        assert!(err.to_string().contains("closed"), "{err}");
    }

    #[test]
    fn ops_error_stops_the_handshake() {
        let (controller, init_channel) = pair().expect("channel pair");
        let init = thread::spawn(move || {
            let mut channel = init_channel;
            channel
                .send(&InitRequest::CgroupRequested)
                .expect("send cgroup request");
            // Controller fails before acking, then hangs up.
            assert!(channel.recv().is_err());
        });

        let mut handshake = handshake_over(controller, false);
        let mut ops = RecordingOps {
            fail_on: Some("cgroup"),
            ..RecordingOps::default()
        };
        let err = handshake
            .drive_to_ready(&mut ops)
            .expect_err("ops error must surface");
        assert!(matches!(err, CapstanError::Resource { .. }));

        drop(handshake);
        init.join().expect("init side completed");
    }

    #[test]
    fn abort_kills_and_reaps_a_real_process() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleeper");
        let pid = i32::try_from(child.id()).expect("pid fits i32");

        let (controller, init_channel) = pair().expect("channel pair");
        drop(init_channel);
        let handshake = Handshake {
            channel: controller,
            pid,
            expected: Expected::Cgroup,
        };

        let status = handshake
            .abort("test abort")
            .expect("aborted child yields a status");
        assert_eq!(status, ExitStatus::signaled(libc::SIGKILL));
    }

    #[test]
    fn try_reap_reports_running_then_exit() {
        let child = std::process::Command::new("true")
            .spawn()
            .expect("spawn short-lived child");
        let pid = i32::try_from(child.id()).expect("pid fits i32");

        // The child exits on its own; poll until the status arrives.
        let mut status = None;
        for _ in 0..200 {
            status = try_reap(pid).expect("try_reap");
            if status.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(status, Some(ExitStatus::exited(0)));
    }

    #[test]
    fn deliver_signal_rejects_unknown_numbers() {
        let err = deliver_signal(1, 9999).expect_err("bogus signal number");
        assert!(matches!(err, CapstanError::Config { .. }));
    }

    #[test]
    fn expected_sequence_starts_at_the_right_step() {
        assert_eq!(Expected::first(true), Expected::Mappings);
        assert_eq!(Expected::first(false), Expected::Cgroup);
        assert_eq!(Expected::Exec.next(), None);
    }
}
