//! The bootstrap state machine walked by the init process.
//!
//! The sequence is linear with no cycles; every step is terminal on error.
//! Each transition has its own function so the order is auditable in one
//! place, and the pure sequencing lives in [`Step::next`] where tests can
//! drive it without a process. The conditional step is user-namespace
//! mapping, skipped exactly when the plan creates no user namespace.
//!
//! Restrictive ordering is load-bearing: the cgroup membership precedes
//! anything that could consume resources, capability reduction happens
//! after every privileged setup step, and the seccomp filter is installed
//! last so it cannot interfere with the bootstrap's own syscalls.

use std::fmt;

use capstan_common::spec::ContainerSpec;
use capstan_core::filesystem::mount::StagedMount;
use capstan_core::namespace::NamespacePlan;

#[cfg(target_os = "linux")]
use capstan_common::error::{CapstanError, Result};
#[cfg(target_os = "linux")]
use crate::sync::{ControllerAck, InitChannel, InitRequest};

/// One state of the bootstrap sequence.
///
/// `Spawned` is where the init process begins; `ReadyToExec` is the last
/// state before the process image is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The init process exists with its new namespaces.
    Spawned,
    /// Existing namespaces are joined (user first) and the time namespace
    /// is unshared.
    NamespacesJoined,
    /// UID/GID maps are written and the mapped root identity assumed.
    /// Entered only when a new user namespace was created.
    UserMappingApplied,
    /// The process is a member of its cgroup with limits in force.
    CgroupJoined,
    /// The root filesystem is prepared and pivoted.
    RootfsPrepared,
    /// Configured mounts are attached inside the new root.
    MountsApplied,
    /// Every capability set is reduced to the configured set.
    CapabilitiesDropped,
    /// The syscall filter is installed.
    SeccompLoaded,
    /// Blocked on the controller's run order.
    ReadyToExec,
}

impl Step {
    /// The step's name, used in failure reports and log fields.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Spawned => "Spawned",
            Self::NamespacesJoined => "NamespacesJoined",
            Self::UserMappingApplied => "UserMappingApplied",
            Self::CgroupJoined => "CgroupJoined",
            Self::RootfsPrepared => "RootfsPrepared",
            Self::MountsApplied => "MountsApplied",
            Self::CapabilitiesDropped => "CapabilitiesDropped",
            Self::SeccompLoaded => "SeccompLoaded",
            Self::ReadyToExec => "ReadyToExec",
        }
    }

    /// The state after this one.
    ///
    /// `maps_user` selects whether the mapping step exists; it must be
    /// true exactly when the namespace plan creates a user namespace.
    /// Returns `None` after `ReadyToExec`: the transition out of it is
    /// the exec itself.
    #[must_use]
    pub fn next(self, maps_user: bool) -> Option<Self> {
        match (self, maps_user) {
            (Self::Spawned, _) => Some(Self::NamespacesJoined),
            (Self::NamespacesJoined, true) => Some(Self::UserMappingApplied),
            (Self::NamespacesJoined, false) | (Self::UserMappingApplied, _) => {
                Some(Self::CgroupJoined)
            }
            (Self::CgroupJoined, _) => Some(Self::RootfsPrepared),
            (Self::RootfsPrepared, _) => Some(Self::MountsApplied),
            (Self::MountsApplied, _) => Some(Self::CapabilitiesDropped),
            (Self::CapabilitiesDropped, _) => Some(Self::SeccompLoaded),
            (Self::SeccompLoaded, _) => Some(Self::ReadyToExec),
            (Self::ReadyToExec, _) => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything the init process needs, assembled before the spawn.
///
/// The namespace plan carries the descriptors opened at resolution time;
/// they survive into the child and are consumed by the join step.
#[derive(Debug)]
pub struct BootstrapContext {
    spec: ContainerSpec,
    plan: NamespacePlan,
    staged: Vec<StagedMount>,
}

impl BootstrapContext {
    /// Builds the context handed to the spawned init process.
    #[must_use]
    pub fn new(spec: ContainerSpec, plan: NamespacePlan) -> Self {
        Self {
            spec,
            plan,
            staged: Vec::new(),
        }
    }

    /// Whether the mapping step exists for this bootstrap.
    #[must_use]
    pub fn maps_user(&self) -> bool {
        self.plan.creates_user()
    }
}

/// Runs the full bootstrap in the init process and execs the workload.
///
/// Returns only on failure, with the child's exit code; on success the
/// process image has been replaced. Failures are reported on the channel
/// while it is still open, then the process exits without unwinding into
/// the controller's cloned stack frames.
#[cfg(target_os = "linux")]
pub fn run(mut ctx: BootstrapContext, channel: &mut InitChannel) -> isize {
    let maps_user = ctx.maps_user();
    let mut step = Step::Spawned;
    while let Some(next) = step.next(maps_user) {
        if let Err(e) = advance(next, &mut ctx, channel) {
            let (step_name, message) = failure_report(next, &e);
            tracing::error!(step = %step_name, %message, "bootstrap step failed");
            let _ = channel.send(&InitRequest::Failed {
                step: step_name,
                message,
            });
            return 1;
        }
        step = next;
    }

    match exec_workload(&ctx.spec) {
        Ok(never) => match never {},
        Err(e) => {
            let _ = channel.send(&InitRequest::Failed {
                step: "Exec".into(),
                message: e.to_string(),
            });
            127
        }
    }
}

/// Performs the transition into `step`.
#[cfg(target_os = "linux")]
fn advance(step: Step, ctx: &mut BootstrapContext, channel: &mut InitChannel) -> Result<()> {
    tracing::trace!(%step, "entering bootstrap step");
    match step {
        Step::Spawned => Ok(()),
        Step::NamespacesJoined => join_namespaces(ctx),
        Step::UserMappingApplied => apply_user_mapping(channel),
        Step::CgroupJoined => join_cgroup(channel),
        Step::RootfsPrepared => prepare_rootfs(ctx, channel),
        Step::MountsApplied => apply_mounts(ctx),
        Step::CapabilitiesDropped => drop_privileges(ctx),
        Step::SeccompLoaded => load_filter(ctx, channel),
        Step::ReadyToExec => await_run_order(channel),
    }
}

/// Splits an error into the step name and message for a failure report.
///
/// Bootstrap errors already name their step; anything else is attributed
/// to the step that was being entered.
#[cfg(target_os = "linux")]
fn failure_report(step: Step, error: &CapstanError) -> (String, String) {
    match error {
        CapstanError::Bootstrap { step, message } => (step.clone(), message.clone()),
        other => (step.name().to_owned(), other.to_string()),
    }
}

#[cfg(target_os = "linux")]
fn join_namespaces(ctx: &BootstrapContext) -> Result<()> {
    use capstan_common::spec::NamespaceKind;

    for op in ctx.plan.joins() {
        capstan_core::namespace::enter(op)?;
    }
    // clone(2) rejects the time namespace flag, so it is unshared here.
    if ctx.plan.unshares_time() {
        capstan_core::namespace::unshare(NamespaceKind::Time)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply_user_mapping(channel: &mut InitChannel) -> Result<()> {
    use nix::unistd::{Gid, Uid, setgid, setuid};

    channel.send(&InitRequest::MappingsRequested)?;
    channel.await_ack(&ControllerAck::MappingsWritten)?;

    // Assume the mapped root identity so the remaining privileged setup
    // works; the workload credentials are applied at finalization.
    setgid(Gid::from_raw(0))
        .map_err(|e| CapstanError::bootstrap("UserMappingApplied", format!("setgid(0): {e}")))?;
    setuid(Uid::from_raw(0))
        .map_err(|e| CapstanError::bootstrap("UserMappingApplied", format!("setuid(0): {e}")))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn join_cgroup(channel: &mut InitChannel) -> Result<()> {
    channel.send(&InitRequest::CgroupRequested)?;
    channel.await_ack(&ControllerAck::CgroupConfigured)
}

/// Prepares the new root and pivots into it.
///
/// Bind sources are staged as detached mount descriptors before the pivot
/// so host paths stay attachable afterwards. The pre-start hook exchange
/// sits between preparation and the pivot, while the controller can still
/// reach the host view of this process.
#[cfg(target_os = "linux")]
fn prepare_rootfs(ctx: &mut BootstrapContext, channel: &mut InitChannel) -> Result<()> {
    use capstan_core::filesystem::{mount, pivot_root};

    if ctx.plan.creates_mount() {
        pivot_root::prepare_root(&ctx.spec.rootfs)?;
        ctx.staged = mount::stage_mounts(&ctx.spec.mounts)?;
    }
    if ctx.plan.creates_uts() {
        if let Some(hostname) = &ctx.spec.hostname {
            capstan_core::namespace::set_hostname(hostname)?;
        }
    }

    channel.send(&InitRequest::HooksRequested)?;
    channel.await_ack(&ControllerAck::HooksDone)?;

    if ctx.plan.creates_mount() {
        pivot_root::pivot(&ctx.spec.rootfs)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply_mounts(ctx: &BootstrapContext) -> Result<()> {
    if ctx.staged.is_empty() {
        return Ok(());
    }
    capstan_core::filesystem::mount::apply_mounts(&ctx.staged)
}

#[cfg(target_os = "linux")]
fn drop_privileges(ctx: &BootstrapContext) -> Result<()> {
    let process = &ctx.spec.process;
    capstan_core::capability::finalize(
        &ctx.spec.capabilities,
        process.uid,
        process.gid,
        &process.extra_groups,
    )?;
    nix::unistd::chdir(&process.cwd).map_err(|e| {
        CapstanError::bootstrap(
            "CapabilitiesDropped",
            format!("chdir {}: {e}", process.cwd.display()),
        )
    })?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn load_filter(ctx: &BootstrapContext, channel: &mut InitChannel) -> Result<()> {
    capstan_core::seccomp::install(&ctx.spec.seccomp)?;
    channel.send(&InitRequest::FilterLoaded)?;
    channel.await_ack(&ControllerAck::FilterAcked)
}

#[cfg(target_os = "linux")]
fn await_run_order(channel: &mut InitChannel) -> Result<()> {
    channel.send(&InitRequest::ExecReady)?;
    channel.await_ack(&ControllerAck::Run)
}

/// Replaces the process image with the workload.
///
/// The environment is exactly the spec's; nothing from the controller's
/// environment leaks through.
#[cfg(target_os = "linux")]
fn exec_workload(spec: &ContainerSpec) -> Result<std::convert::Infallible> {
    use std::ffi::CString;

    let to_cstrings = |values: &[String]| -> Result<Vec<CString>> {
        values
            .iter()
            .map(|v| {
                CString::new(v.as_str()).map_err(|_| CapstanError::Config {
                    message: format!("argument or environment entry contains NUL: {v:?}"),
                })
            })
            .collect()
    };

    let argv = to_cstrings(&spec.process.args)?;
    let envp = to_cstrings(&spec.process.env)?;
    let Some(program) = argv.first() else {
        return Err(CapstanError::Config {
            message: "empty argument vector".into(),
        });
    };

    tracing::debug!(program = %spec.process.args[0], "exec'ing workload");
    nix::unistd::execvpe(program, &argv, &envp).map_err(|e| {
        CapstanError::bootstrap("Exec", format!("execvpe {}: {e}", spec.process.args[0]))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;

    fn walk(maps_user: bool) -> Vec<Step> {
        let mut order = Vec::new();
        let mut step = Step::Spawned;
        while let Some(next) = step.next(maps_user) {
            order.push(next);
            step = next;
        }
        order
    }

    #[test]
    fn sequence_with_user_namespace_maps_before_cgroup() {
        let order = walk(true);
        assert_eq!(
            order,
            vec![
                Step::NamespacesJoined,
                Step::UserMappingApplied,
                Step::CgroupJoined,
                Step::RootfsPrepared,
                Step::MountsApplied,
                Step::CapabilitiesDropped,
                Step::SeccompLoaded,
                Step::ReadyToExec,
            ]
        );

        let mapping = order
            .iter()
            .position(|s| *s == Step::UserMappingApplied)
            .expect("mapping step present");
        let cgroup = order
            .iter()
            .position(|s| *s == Step::CgroupJoined)
            .expect("cgroup step present");
        assert!(mapping < cgroup, "mapping must precede the cgroup join");
    }

    #[test]
    fn sequence_without_user_namespace_skips_mapping() {
        let order = walk(false);
        assert!(!order.contains(&Step::UserMappingApplied));
        assert_eq!(order.first(), Some(&Step::NamespacesJoined));
        assert_eq!(order.get(1), Some(&Step::CgroupJoined));
    }

    #[test]
    fn ready_to_exec_is_terminal() {
        assert_eq!(Step::ReadyToExec.next(false), None);
        assert_eq!(Step::ReadyToExec.next(true), None);
    }

    #[test]
    fn restrictive_steps_keep_their_relative_order() {
        let order = walk(false);
        let pos = |step: Step| {
            order
                .iter()
                .position(|s| *s == step)
                .expect("step present")
        };
        assert!(pos(Step::CgroupJoined) < pos(Step::RootfsPrepared));
        assert!(pos(Step::MountsApplied) < pos(Step::CapabilitiesDropped));
        assert!(pos(Step::CapabilitiesDropped) < pos(Step::SeccompLoaded));
    }
}
