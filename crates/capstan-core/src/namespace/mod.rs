//! Linux namespace management for container isolation.
//!
//! Provides safe wrappers around `clone(2)` flag derivation, `unshare(2)`,
//! and `setns(2)`, driven by a resolved [`plan::NamespacePlan`] rather than
//! per-kind ad hoc calls.

pub mod plan;
pub mod user;

use capstan_common::error::Result;
use capstan_common::spec::NamespaceKind;

pub use plan::{JoinOp, NamespacePlan};

/// Returns the `clone(2)`/`setns(2)` flag for a namespace kind.
///
/// The time namespace flag is only honored by `unshare(2)` and `setns(2)`;
/// [`NamespacePlan::clone_flags`] therefore never includes it and the init
/// process unshares it separately.
#[cfg(target_os = "linux")]
#[must_use]
pub fn clone_flag(kind: NamespaceKind) -> nix::sched::CloneFlags {
    use nix::sched::CloneFlags;

    match kind {
        NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
        NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
        NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
        NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
        NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
        NamespaceKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        NamespaceKind::Time => CloneFlags::from_bits_truncate(libc::CLONE_NEWTIME),
    }
}

/// Enters the existing namespace held open by a join operation.
///
/// # Errors
///
/// Returns an error if `setns(2)` fails, typically for missing privilege
/// in the target namespace's owning user namespace.
#[cfg(target_os = "linux")]
pub fn enter(op: &JoinOp) -> Result<()> {
    use std::os::fd::AsFd;

    use capstan_common::error::CapstanError;

    nix::sched::setns(op.fd.as_fd(), clone_flag(op.kind)).map_err(|e| {
        CapstanError::bootstrap(
            "NamespacesJoined",
            format!("setns {} ({}) failed: {e}", op.kind, op.path.display()),
        )
    })?;
    tracing::debug!(kind = %op.kind, path = %op.path.display(), "joined namespace");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — namespace joining requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn enter(_op: &JoinOp) -> Result<()> {
    Err(capstan_common::error::CapstanError::Unsupported {
        operation: "namespace join",
    })
}

/// Unshares a single namespace kind for the calling process.
///
/// Used by the init process for the time namespace, which `clone(2)`
/// does not accept in its flag mask.
///
/// # Errors
///
/// Returns an error if `unshare(2)` fails.
#[cfg(target_os = "linux")]
pub fn unshare(kind: NamespaceKind) -> Result<()> {
    use capstan_common::error::CapstanError;

    nix::sched::unshare(clone_flag(kind)).map_err(|e| {
        CapstanError::bootstrap("NamespacesJoined", format!("unshare {kind} failed: {e}"))
    })?;
    tracing::debug!(kind = %kind, "unshared namespace");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unshare(_kind: NamespaceKind) -> Result<()> {
    Err(capstan_common::error::CapstanError::Unsupported {
        operation: "namespace unshare",
    })
}

/// Sets the hostname inside a freshly created UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(hostname: &str) -> Result<()> {
    use capstan_common::error::CapstanError;

    nix::unistd::sethostname(hostname).map_err(|e| {
        CapstanError::bootstrap("RootfsPrepared", format!("sethostname failed: {e}"))
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — UTS namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_hostname: &str) -> Result<()> {
    Err(capstan_common::error::CapstanError::Unsupported {
        operation: "sethostname",
    })
}
