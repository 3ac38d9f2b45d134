//! Namespace plan resolution.
//!
//! A [`NamespacePlan`] is the resolved form of the namespace directives in a
//! container spec: the set of kinds to create at process creation and the
//! ordered list of existing namespaces to join. Resolution validates the
//! directives and opens every join path up front, so an invalid or
//! inaccessible path fails before any process is spawned and the opened
//! descriptors are immune to path races afterward.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::{NamespaceAction, NamespaceKind, NamespaceSpec};

/// One join operation: enter the namespace behind an already-open descriptor.
#[derive(Debug)]
pub struct JoinOp {
    /// Which namespace kind is being joined.
    pub kind: NamespaceKind,
    /// The path the descriptor was opened from, kept for diagnostics.
    pub path: PathBuf,
    /// Descriptor to the namespace file, opened at plan resolution.
    pub fd: OwnedFd,
}

/// A resolved, validated namespace plan.
///
/// `creates` becomes the process-creation flag mask; `joins` is performed by
/// the init process, in order, before any namespace-dependent setup. A user
/// namespace join is always first: entering other namespaces may require the
/// new credential mapping to be active already.
#[derive(Debug, Default)]
pub struct NamespacePlan {
    creates: Vec<NamespaceKind>,
    joins: Vec<JoinOp>,
}

impl NamespacePlan {
    /// Resolves a list of namespace directives into a plan.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a kind appears twice or a join
    /// path cannot be opened. Nothing is partially applied: resolution has
    /// no side effects beyond opening descriptors owned by the plan.
    pub fn resolve(specs: &[NamespaceSpec]) -> Result<Self> {
        let mut seen: Vec<NamespaceKind> = Vec::new();
        let mut creates = Vec::new();
        let mut joins = Vec::new();

        for spec in specs {
            if seen.contains(&spec.kind) {
                return Err(CapstanError::Config {
                    message: format!("duplicate namespace directive: {}", spec.kind),
                });
            }
            seen.push(spec.kind);

            match &spec.action {
                NamespaceAction::Create => creates.push(spec.kind),
                NamespaceAction::Join(path) => {
                    let file = File::open(path).map_err(|e| CapstanError::Config {
                        message: format!(
                            "{} namespace path {} is not accessible: {e}",
                            spec.kind,
                            path.display()
                        ),
                    })?;
                    joins.push(JoinOp {
                        kind: spec.kind,
                        path: path.clone(),
                        fd: file.into(),
                    });
                }
            }
        }

        // A user namespace join must precede every other join.
        joins.sort_by_key(|op| op.kind != NamespaceKind::User);

        tracing::debug!(
            creates = creates.len(),
            joins = joins.len(),
            "namespace plan resolved"
        );
        Ok(Self { creates, joins })
    }

    /// Kinds to create fresh at process creation.
    #[must_use]
    pub fn creates(&self) -> &[NamespaceKind] {
        &self.creates
    }

    /// Ordered join operations for the init process.
    #[must_use]
    pub fn joins(&self) -> &[JoinOp] {
        &self.joins
    }

    /// Whether the plan creates a new user namespace.
    #[must_use]
    pub fn creates_user(&self) -> bool {
        self.creates.contains(&NamespaceKind::User)
    }

    /// Whether the plan creates a new UTS namespace.
    #[must_use]
    pub fn creates_uts(&self) -> bool {
        self.creates.contains(&NamespaceKind::Uts)
    }

    /// Whether the plan creates a new mount namespace.
    ///
    /// The root pivot and mount application only run when it does.
    #[must_use]
    pub fn creates_mount(&self) -> bool {
        self.creates.contains(&NamespaceKind::Mount)
    }

    /// Whether the init process must unshare a time namespace itself.
    ///
    /// `clone(2)` rejects the time namespace flag, so it cannot ride in the
    /// process-creation mask.
    #[must_use]
    pub fn unshares_time(&self) -> bool {
        self.creates.contains(&NamespaceKind::Time)
    }

    /// The `clone(2)` flag mask for process creation.
    ///
    /// Excludes the time namespace (see [`Self::unshares_time`]).
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn clone_flags(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        self.creates
            .iter()
            .filter(|kind| **kind != NamespaceKind::Time)
            .fold(CloneFlags::empty(), |mask, kind| {
                mask | super::clone_flag(*kind)
            })
    }
}
