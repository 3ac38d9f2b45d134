//! One container's lifecycle, from the end of bootstrap to destruction.
//!
//! A [`Container`] owns its [`ProcessRecord`], its cgroup handle, and —
//! until started — the handshake gate holding the init process before
//! exec. Lifecycle transitions are checked against the reconciled state,
//! not the cached record alone: every query consults the kernel first
//! (signal-0 plus start-tick comparison, freezer state for a recorded
//! pause) so a controller restart or an exited workload can never be
//! masked by stale state.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::{HookSet, HookSpec, IdMapping, ResourceLimits};
use capstan_common::types::{ContainerId, ContainerStatus, ExitStatus};
use capstan_core::cgroup::{CgroupDriver, CgroupHandle};

use crate::hooks::{self, HookRunner};
use crate::process::{self, BootstrapOps, Handshake};
use crate::state::{self, ProcessRecord, StateStore};

/// How often a non-child init process is polled while waiting for exit.
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// Controller-side collaborators answering one bootstrap's requests.
///
/// The handshake driver calls these in protocol order; everything here
/// borrows from the engine for the duration of one creation attempt.
pub(crate) struct CreateOps<'a> {
    pub id: &'a ContainerId,
    pub driver: &'a dyn CgroupDriver,
    pub cgroup: &'a CgroupHandle,
    pub limits: &'a ResourceLimits,
    pub uid_mappings: &'a [IdMapping],
    pub gid_mappings: &'a [IdMapping],
    pub runner: &'a HookRunner,
    pub pre_start: &'a [HookSpec],
}

impl BootstrapOps for CreateOps<'_> {
    fn write_mappings(&mut self, pid: i32) -> Result<()> {
        capstan_core::namespace::user::write_id_mappings(
            checked_pid(pid)?,
            self.uid_mappings,
            self.gid_mappings,
        )
    }

    fn configure_cgroup(&mut self, pid: i32) -> Result<()> {
        self.driver.add_process(self.cgroup, checked_pid(pid)?)?;
        // An entirely unlimited spec makes no limit writes at all.
        if !self.limits.is_unlimited() {
            self.driver.apply_limits(self.cgroup, self.limits)?;
        }
        Ok(())
    }

    fn run_pre_start(&mut self, pid: i32) -> Result<()> {
        let payload = hooks::payload(self.id, pid, ContainerStatus::Creating);
        self.runner.run_pre_start(self.pre_start, &payload)
    }
}

fn checked_pid(pid: i32) -> Result<u32> {
    u32::try_from(pid).map_err(|_| CapstanError::Protocol {
        message: format!("negative init pid {pid}"),
    })
}

/// A created container and the resources the engine assigned to it.
#[derive(Debug)]
pub struct Container {
    pub(crate) record: ProcessRecord,
    pub(crate) hooks: HookSet,
    pub(crate) driver: Arc<dyn CgroupDriver>,
    pub(crate) cgroup: CgroupHandle,
    pub(crate) store: StateStore,
    pub(crate) runner: HookRunner,
    /// The pre-exec gate. `Some` between bootstrap completion and
    /// [`Container::start`]; recovered containers never have one.
    pub(crate) gate: Option<Handshake>,
    /// True when the init process is not this process's child, so exits
    /// must be observed by polling rather than `waitpid`.
    pub(crate) reparented: bool,
}

impl Container {
    /// The container's identifier.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.record.id
    }

    /// The init process's pid.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.record.pid
    }

    /// The exit status, once one has been observed.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.record.exit_status
    }

    /// The lifecycle state, reconciled against the kernel.
    ///
    /// # Errors
    ///
    /// Returns an error when a corrected record cannot be persisted.
    pub fn state(&mut self) -> Result<ContainerStatus> {
        self.refresh_liveness()?;
        Ok(self.record.status)
    }

    /// Releases the init process to exec the workload.
    ///
    /// Legal only in `Created`; ends in `Running` and runs post-start
    /// hooks.
    ///
    /// # Errors
    ///
    /// Returns a state error outside `Created` or on a recovered
    /// container, and a protocol error when the init process died
    /// between ready and release (the exit is recorded first).
    pub fn start(&mut self) -> Result<()> {
        if self.record.status != ContainerStatus::Created {
            return Err(self.state_error("start"));
        }
        let Some(gate) = self.gate.take() else {
            return Err(CapstanError::State {
                operation: "start",
                current: "created (recovered)".to_owned(),
            });
        };

        if let Err(e) = gate.release() {
            // The init process died while parked at the gate.
            let exit = process::reap(self.record.pid).ok();
            self.record.status = ContainerStatus::Stopped;
            self.record.exit_status = exit;
            if let Err(save) = self.store.save(&self.record) {
                tracing::warn!(id = %self.record.id, error = %save, "could not record early exit");
            }
            return Err(e);
        }

        self.record.status = ContainerStatus::Running;
        self.store.save(&self.record)?;
        tracing::info!(id = %self.record.id, pid = self.record.pid, "container started");

        let payload = hooks::payload(&self.record.id, self.record.pid, ContainerStatus::Running);
        self.runner
            .run_best_effort("post-start", &self.hooks.post_start, &payload);
        Ok(())
    }

    /// Freezes the container's cgroup. Legal only in `Running`.
    ///
    /// # Errors
    ///
    /// Returns a state error outside `Running` or the driver's freeze
    /// failure.
    pub fn pause(&mut self) -> Result<()> {
        self.refresh_liveness()?;
        if self.record.status != ContainerStatus::Running {
            return Err(self.state_error("pause"));
        }
        self.driver.freeze(&self.cgroup)?;
        self.record.status = ContainerStatus::Paused;
        self.store.save(&self.record)?;
        tracing::info!(id = %self.record.id, "container paused");
        Ok(())
    }

    /// Thaws a paused container back to `Running`.
    ///
    /// # Errors
    ///
    /// Returns a state error outside `Paused` or the driver's thaw
    /// failure.
    pub fn resume(&mut self) -> Result<()> {
        self.refresh_liveness()?;
        if self.record.status != ContainerStatus::Paused {
            return Err(self.state_error("resume"));
        }
        self.driver.thaw(&self.cgroup)?;
        self.record.status = ContainerStatus::Running;
        self.store.save(&self.record)?;
        tracing::info!(id = %self.record.id, "container resumed");
        Ok(())
    }

    /// Delivers a signal to the init process.
    ///
    /// Legal in `Running` and `Paused`. A signal delivered to a frozen
    /// process may be queued by the kernel until the thaw.
    ///
    /// # Errors
    ///
    /// Returns a state error outside `Running`/`Paused` or the delivery
    /// failure.
    pub fn signal(&mut self, signum: i32) -> Result<()> {
        self.refresh_liveness()?;
        if !matches!(
            self.record.status,
            ContainerStatus::Running | ContainerStatus::Paused
        ) {
            return Err(self.state_error("signal"));
        }
        process::deliver_signal(self.record.pid, signum)?;
        tracing::debug!(id = %self.record.id, signum, "signal delivered");
        Ok(())
    }

    /// Blocks until the init process exits and records its status.
    ///
    /// Idempotent once stopped: returns the recorded status. For a
    /// recovered container the exit is observed by polling, and the
    /// status itself is unknowable.
    ///
    /// # Errors
    ///
    /// Returns a state error in `Created` (the gate would never open)
    /// and persistence or wait failures.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.refresh_liveness()?;
        if self.record.status == ContainerStatus::Stopped {
            return Ok(self.record.exit_status.unwrap_or(ExitStatus {
                code: None,
                signal: None,
            }));
        }
        if self.record.status == ContainerStatus::Created {
            return Err(self.state_error("wait"));
        }

        let status = self.observe_exit()?;
        self.record.status = ContainerStatus::Stopped;
        self.record.exit_status = Some(status);
        self.store.save(&self.record)?;
        tracing::info!(id = %self.record.id, %status, "container stopped");
        Ok(status)
    }

    /// Destroys the container: cgroup removal, post-stop hooks, record
    /// deletion, in that order.
    ///
    /// Without `force` this is legal only in `Stopped`. With `force` a
    /// live container is stopped first: the cgroup is frozen, every
    /// member is SIGKILLed, the group is thawed, and the exit is awaited
    /// before any resource is released.
    ///
    /// # Errors
    ///
    /// Returns a state error for an unforced destroy outside `Stopped`,
    /// or the first teardown failure.
    pub fn destroy(&mut self, force: bool) -> Result<()> {
        self.refresh_liveness()?;
        if self.record.status != ContainerStatus::Stopped {
            if !force {
                return Err(self.state_error("destroy"));
            }
            self.kill_group()?;
        }

        self.driver.destroy(&self.cgroup)?;
        let payload = hooks::payload(&self.record.id, self.record.pid, ContainerStatus::Stopped);
        self.runner
            .run_best_effort("post-stop", &self.hooks.post_stop, &payload);
        self.store.remove(&self.record.id)?;
        tracing::info!(id = %self.record.id, "container destroyed");
        Ok(())
    }

    /// Stops every process in the container for a forced destroy.
    fn kill_group(&mut self) -> Result<()> {
        if let Some(gate) = self.gate.take() {
            self.record.exit_status = gate.abort("container destroyed");
        }

        // Freeze first so nothing can fork between the listing and the
        // kills; both freezer calls are best-effort since the group may
        // already be empty or gone.
        if let Err(e) = self.driver.freeze(&self.cgroup) {
            tracing::debug!(id = %self.record.id, error = %e, "freeze before kill failed");
        }
        let members = self.driver.member_pids(&self.cgroup).unwrap_or_default();
        for pid in &members {
            if let Ok(pid) = i32::try_from(*pid) {
                process::force_kill(pid);
            }
        }
        if let Err(e) = self.driver.thaw(&self.cgroup) {
            tracing::debug!(id = %self.record.id, error = %e, "thaw after kill failed");
        }

        let status = self.observe_exit()?;
        self.record.status = ContainerStatus::Stopped;
        self.record.exit_status = self.record.exit_status.or(Some(status));
        self.store.save(&self.record)?;
        tracing::info!(id = %self.record.id, members = members.len(), "container force-stopped");
        Ok(())
    }

    /// Blocks until the init process is gone and returns what is known
    /// of its exit.
    fn observe_exit(&self) -> Result<ExitStatus> {
        if self.reparented {
            while state::init_alive(self.record.pid, self.record.start_time) {
                thread::sleep(LIVENESS_POLL);
            }
            return Ok(ExitStatus {
                code: None,
                signal: None,
            });
        }
        process::reap(self.record.pid)
    }

    /// Reconciles the record against the kernel.
    ///
    /// The signal-0 and start-tick check on the process is the sole
    /// source of truth for liveness; a recorded pause is additionally
    /// cross-checked against the freezer.
    fn refresh_liveness(&mut self) -> Result<()> {
        if !self.record.status.is_live() {
            return Ok(());
        }

        if state::init_alive(self.record.pid, self.record.start_time) {
            if self.record.status == ContainerStatus::Paused {
                match self.driver.is_frozen(&self.cgroup) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            id = %self.record.id,
                            "recorded paused but the freezer is thawed; correcting"
                        );
                        self.record.status = ContainerStatus::Running;
                        self.store.save(&self.record)?;
                    }
                    Err(e) => {
                        tracing::warn!(id = %self.record.id, error = %e, "freezer state unreadable");
                    }
                }
            }
            return Ok(());
        }

        // The init process is gone (or its pid was recycled).
        let exit = if self.reparented {
            None
        } else {
            process::try_reap(self.record.pid)?
        };
        self.record.status = ContainerStatus::Stopped;
        self.record.exit_status = self.record.exit_status.or(exit);
        self.store.save(&self.record)?;
        tracing::info!(id = %self.record.id, pid = self.record.pid, "init process exited");
        Ok(())
    }

    fn state_error(&self, operation: &'static str) -> CapstanError {
        CapstanError::State {
            operation,
            current: self.record.status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Records every call; freeze state is tracked for `is_frozen`.
    #[derive(Debug, Default)]
    struct FakeDriver {
        calls: Mutex<Vec<String>>,
        frozen: AtomicBool,
    }

    impl FakeDriver {
        fn push(&self, call: impl Into<String>) {
            self.calls.lock().expect("calls lock").push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl CgroupDriver for FakeDriver {
        fn create(&self, id: &ContainerId) -> Result<CgroupHandle> {
            self.push(format!("create {id}"));
            Ok(CgroupHandle::new(PathBuf::from("capstan").join(id.as_str())))
        }

        fn add_process(&self, _handle: &CgroupHandle, pid: u32) -> Result<()> {
            self.push(format!("add_process {pid}"));
            Ok(())
        }

        fn apply_limits(&self, _handle: &CgroupHandle, _limits: &ResourceLimits) -> Result<()> {
            self.push("apply_limits");
            Ok(())
        }

        fn freeze(&self, _handle: &CgroupHandle) -> Result<()> {
            self.push("freeze");
            self.frozen.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn thaw(&self, _handle: &CgroupHandle) -> Result<()> {
            self.push("thaw");
            self.frozen.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_frozen(&self, _handle: &CgroupHandle) -> Result<bool> {
            Ok(self.frozen.load(Ordering::SeqCst))
        }

        fn member_pids(&self, _handle: &CgroupHandle) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }

        fn destroy(&self, _handle: &CgroupHandle) -> Result<()> {
            self.push("destroy");
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: Arc<FakeDriver>,
        store: StateStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("state root");
        Fixture {
            store: StateStore::new(dir.path()),
            _dir: dir,
            driver: Arc::new(FakeDriver::default()),
        }
    }

    /// A container whose record points at this test process, so the
    /// liveness check sees it alive with a matching start tick.
    fn live_container(fx: &Fixture, status: ContainerStatus) -> Container {
        let pid = i32::try_from(std::process::id()).expect("pid fits i32");
        let start_time = state::read_start_tick(pid).unwrap_or_default();
        container_with(fx, status, pid, start_time)
    }

    fn container_with(
        fx: &Fixture,
        status: ContainerStatus,
        pid: i32,
        start_time: u64,
    ) -> Container {
        let mut record = ProcessRecord::new(ContainerId::new("test"), pid, start_time);
        record.status = status;
        fx.store.save(&record).expect("seed record");
        Container {
            record,
            hooks: HookSet::default(),
            driver: fx.driver.clone(),
            cgroup: CgroupHandle::new(PathBuf::from("capstan/test")),
            store: fx.store.clone(),
            runner: HookRunner::new(Duration::from_secs(5)),
            gate: None,
            reparented: true,
        }
    }

    // ── CreateOps ───────────────────────────────────────────────────────

    #[test]
    fn unlimited_specs_make_no_limit_writes() {
        let fx = fixture();
        let id = ContainerId::new("c1");
        let cgroup = fx.driver.create(&id).expect("cgroup");
        let limits = ResourceLimits::default();
        let runner = HookRunner::new(Duration::from_secs(5));
        let mut ops = CreateOps {
            id: &id,
            driver: &*fx.driver,
            cgroup: &cgroup,
            limits: &limits,
            uid_mappings: &[],
            gid_mappings: &[],
            runner: &runner,
            pre_start: &[],
        };

        ops.configure_cgroup(4242).expect("configure");
        assert_eq!(
            fx.driver.calls(),
            vec!["create c1".to_owned(), "add_process 4242".to_owned()]
        );
    }

    #[test]
    fn limited_specs_apply_limits_after_membership() {
        let fx = fixture();
        let id = ContainerId::new("c1");
        let cgroup = fx.driver.create(&id).expect("cgroup");
        let limits = ResourceLimits {
            pids_max: Some(16),
            ..ResourceLimits::default()
        };
        let runner = HookRunner::new(Duration::from_secs(5));
        let mut ops = CreateOps {
            id: &id,
            driver: &*fx.driver,
            cgroup: &cgroup,
            limits: &limits,
            uid_mappings: &[],
            gid_mappings: &[],
            runner: &runner,
            pre_start: &[],
        };

        ops.configure_cgroup(4242).expect("configure");
        assert_eq!(
            fx.driver.calls(),
            vec![
                "create c1".to_owned(),
                "add_process 4242".to_owned(),
                "apply_limits".to_owned()
            ]
        );
    }

    #[test]
    fn negative_pid_is_rejected() {
        assert!(matches!(
            checked_pid(-1),
            Err(CapstanError::Protocol { .. })
        ));
    }

    // ── Transition rejections ───────────────────────────────────────────

    #[cfg(target_os = "linux")]
    #[test]
    fn pause_is_rejected_unless_running() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Created);
        let err = container.pause().expect_err("pause from created");
        assert!(matches!(err, CapstanError::State { operation: "pause", .. }));
        assert!(fx.driver.calls().is_empty(), "no driver call on rejection");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resume_is_rejected_unless_paused() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Running);
        let err = container.resume().expect_err("resume from running");
        assert!(matches!(err, CapstanError::State { operation: "resume", .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unforced_destroy_is_rejected_while_running() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Running);
        let err = container.destroy(false).expect_err("destroy while running");
        assert!(matches!(err, CapstanError::State { operation: "destroy", .. }));
        assert!(
            !fx.driver.calls().contains(&"destroy".to_owned()),
            "cgroup must survive a rejected destroy"
        );
        assert!(fx.store.load(container.id()).is_ok(), "record must survive");
    }

    #[test]
    fn signal_is_rejected_once_stopped() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Stopped);
        let err = container.signal(15).expect_err("signal a stopped container");
        assert!(matches!(err, CapstanError::State { operation: "signal", .. }));
    }

    #[test]
    fn start_is_rejected_on_a_recovered_container() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Created);
        let err = container.start().expect_err("no gate to open");
        assert!(matches!(err, CapstanError::State { operation: "start", .. }));
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    #[test]
    fn recycled_pid_reconciles_to_stopped() {
        let fx = fixture();
        let pid = i32::try_from(std::process::id()).expect("pid fits i32");
        let wrong_tick = state::read_start_tick(pid).unwrap_or_default().wrapping_add(1);
        let mut container = container_with(&fx, ContainerStatus::Running, pid, wrong_tick);

        assert_eq!(container.state().expect("state"), ContainerStatus::Stopped);
        let persisted = fx.store.load(container.id()).expect("reload");
        assert_eq!(persisted.status, ContainerStatus::Stopped);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn thawed_freezer_corrects_a_paused_record() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Paused);
        // FakeDriver starts thawed, so the recorded pause is stale.
        assert_eq!(container.state().expect("state"), ContainerStatus::Running);
        let persisted = fx.store.load(container.id()).expect("reload");
        assert_eq!(persisted.status, ContainerStatus::Running);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn consistent_pause_is_left_alone() {
        let fx = fixture();
        fx.driver.frozen.store(true, Ordering::SeqCst);
        let mut container = live_container(&fx, ContainerStatus::Paused);
        assert_eq!(container.state().expect("state"), ContainerStatus::Paused);
    }

    // ── Stop and destroy ────────────────────────────────────────────────

    #[test]
    fn wait_once_stopped_returns_the_recorded_status() {
        let fx = fixture();
        let mut container = live_container(&fx, ContainerStatus::Stopped);
        container.record.exit_status = Some(ExitStatus::exited(3));
        assert_eq!(container.wait().expect("wait"), ExitStatus::exited(3));
    }

    #[test]
    fn destroy_from_stopped_tears_down_in_order() {
        let fx = fixture();
        let dir = tempfile::tempdir().expect("hook dir");
        let marker = dir.path().join("post-stop-ran");

        let mut container = live_container(&fx, ContainerStatus::Stopped);
        container.hooks.post_stop = vec![HookSpec {
            program: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                "touch \"$MARKER\"".into(),
            ],
            env: vec![
                "PATH=/usr/bin:/bin".to_owned(),
                format!("MARKER={}", marker.display()),
            ],
            timeout_secs: None,
        }];

        container.destroy(false).expect("destroy");
        assert!(fx.driver.calls().contains(&"destroy".to_owned()));
        assert!(marker.exists(), "post-stop hooks must run on destroy");
        assert!(
            matches!(
                fx.store.load(container.id()),
                Err(CapstanError::NotFound { .. })
            ),
            "record directory must be gone"
        );
    }

    #[test]
    fn forced_destroy_of_a_dead_container_cleans_up() {
        let fx = fixture();
        let pid = i32::try_from(std::process::id()).expect("pid fits i32");
        let wrong_tick = state::read_start_tick(pid).unwrap_or_default().wrapping_add(1);
        let mut container = container_with(&fx, ContainerStatus::Running, pid, wrong_tick);

        container.destroy(true).expect("forced destroy");
        assert!(fx.driver.calls().contains(&"destroy".to_owned()));
        assert!(matches!(
            fx.store.load(container.id()),
            Err(CapstanError::NotFound { .. })
        ));
    }
}
