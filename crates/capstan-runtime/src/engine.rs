//! The engine that creates, recovers, and enumerates containers.
//!
//! An [`Engine`] holds what every container shares: the cgroup driver,
//! the record store, and the hook runner. Each successful
//! [`Engine::create`] hands back a [`Container`] with its init process
//! parked at the pre-exec gate; [`Engine::load`] rebuilds a handle from
//! a persisted record, reconciling it against the kernel before anyone
//! acts on it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capstan_common::constants;
use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::{ContainerSpec, HookSet};
use capstan_common::types::{ContainerId, ContainerStatus};
use capstan_core::cgroup::{self, CgroupDriver, CgroupHandle};
use capstan_core::namespace::NamespacePlan;

use crate::container::{Container, CreateOps};
use crate::hooks::HookRunner;
use crate::process::{self, Handshake};
use crate::state::{self, ProcessRecord, StateStore};

/// Engine-wide settings. [`EngineConfig::default`] matches a stock
/// system install.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one record directory per container.
    pub state_root: PathBuf,
    /// Mount point of the cgroup hierarchy.
    pub cgroup_root: PathBuf,
    /// Deadline for each bootstrap handshake step.
    pub step_timeout: Duration,
    /// Default deadline for each lifecycle hook.
    pub hook_timeout: Duration,
    /// Release the workload as part of [`Engine::create`] instead of
    /// waiting for an explicit [`Container::start`].
    pub start_on_create: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(constants::DEFAULT_STATE_DIR),
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            step_timeout: Duration::from_secs(constants::DEFAULT_STEP_TIMEOUT_SECS),
            hook_timeout: Duration::from_secs(constants::DEFAULT_HOOK_TIMEOUT_SECS),
            start_on_create: false,
        }
    }
}

/// Shared collaborators behind every container this process manages.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    driver: Arc<dyn CgroupDriver>,
    store: StateStore,
    runner: HookRunner,
}

impl Engine {
    /// An engine using the cgroup driver detected at the configured
    /// hierarchy root.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let driver = Arc::from(cgroup::detect_driver(&config.cgroup_root));
        Self::with_driver(config, driver)
    }

    /// An engine over an explicit driver. Tests inject recording
    /// drivers here.
    #[must_use]
    pub fn with_driver(config: EngineConfig, driver: Arc<dyn CgroupDriver>) -> Self {
        let store = StateStore::new(&config.state_root);
        let runner = HookRunner::new(config.hook_timeout);
        Self {
            config,
            driver,
            store,
            runner,
        }
    }

    /// Creates a container: spawns its init process, drives the
    /// bootstrap to the pre-exec gate, and persists the record.
    ///
    /// On success the container is `Created` (or `Running`, when the
    /// engine is configured to start on create). On any failure after
    /// the spawn, the init process is aborted and reaped and the cgroup
    /// and record are removed; no orphaned resource survives the error.
    ///
    /// # Errors
    ///
    /// Returns a config error for an empty argument vector or a new
    /// user namespace without both ID mappings, and otherwise the first
    /// bootstrap, resource, or persistence failure.
    pub fn create(&self, spec: ContainerSpec) -> Result<Container> {
        if spec.process.args.is_empty() {
            return Err(CapstanError::Config {
                message: "container spec has an empty argument vector".to_owned(),
            });
        }
        let plan = NamespacePlan::resolve(&spec.namespaces)?;
        if plan.creates_user() && (spec.uid_mappings.is_empty() || spec.gid_mappings.is_empty()) {
            return Err(CapstanError::Config {
                message: "a new user namespace requires uid and gid mappings".to_owned(),
            });
        }

        let id = ContainerId::generate();
        let hooks = spec.hooks.clone();
        let limits = spec.limits.clone();
        let uid_mappings = spec.uid_mappings.clone();
        let gid_mappings = spec.gid_mappings.clone();

        let cgroup = self.driver.create(&id)?;
        let mut handshake = match process::spawn(spec, plan, Some(self.config.step_timeout)) {
            Ok(handshake) => handshake,
            Err(e) => {
                if let Err(destroy) = self.driver.destroy(&cgroup) {
                    tracing::warn!(%id, error = %destroy, "cgroup cleanup after failed spawn");
                }
                return Err(e);
            }
        };

        let pid = handshake.pid();
        let start_time = state::read_start_tick(pid).unwrap_or_default();
        let mut record = ProcessRecord::new(id.clone(), pid, start_time);
        // The record reaches disk only once the process it names exists.
        if let Err(e) = self.store.save(&record) {
            return Err(self.teardown_failed_create(handshake, &cgroup, &id, e));
        }

        let mut ops = CreateOps {
            id: &id,
            driver: &*self.driver,
            cgroup: &cgroup,
            limits: &limits,
            uid_mappings: &uid_mappings,
            gid_mappings: &gid_mappings,
            runner: &self.runner,
            pre_start: &hooks.pre_start,
        };
        if let Err(e) = handshake.drive_to_ready(&mut ops) {
            return Err(self.teardown_failed_create(handshake, &cgroup, &id, e));
        }

        record.status = ContainerStatus::Created;
        if let Err(e) = self.store.save(&record) {
            return Err(self.teardown_failed_create(handshake, &cgroup, &id, e));
        }
        tracing::info!(%id, pid, "container created");

        let mut container = Container {
            record,
            hooks,
            driver: Arc::clone(&self.driver),
            cgroup,
            store: self.store.clone(),
            runner: self.runner.clone(),
            gate: Some(handshake),
            reparented: false,
        };
        if self.config.start_on_create {
            Self::start_or_destroy(&mut container)?;
        }
        Ok(container)
    }

    /// Creates and immediately starts a container.
    ///
    /// # Errors
    ///
    /// As [`Engine::create`]; a failed start destroys the container
    /// before the error is returned.
    pub fn run(&self, spec: ContainerSpec) -> Result<Container> {
        let mut container = self.create(spec)?;
        if container.record.status == ContainerStatus::Created {
            Self::start_or_destroy(&mut container)?;
        }
        Ok(container)
    }

    /// Rebuilds a container handle from its persisted record.
    ///
    /// The record is reconciled against the kernel before it is
    /// returned, so a container whose init process died while no engine
    /// was watching comes back `Stopped`. Recovered handles carry no
    /// hooks and cannot be started; every other operation works.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown ID, and resource or
    /// persistence failures from the reconciliation.
    pub fn load(&self, id: &ContainerId) -> Result<Container> {
        let record = self.store.load(id)?;
        let cgroup = self.driver.create(id)?;
        let mut container = Container {
            record,
            hooks: HookSet::default(),
            driver: Arc::clone(&self.driver),
            cgroup,
            store: self.store.clone(),
            runner: self.runner.clone(),
            gate: None,
            reparented: true,
        };
        let status = container.state()?;
        tracing::debug!(%id, %status, "container loaded");
        Ok(container)
    }

    /// Lists every persisted record, oldest first, with liveness
    /// reconciled.
    ///
    /// # Errors
    ///
    /// Returns an error when the state root cannot be read.
    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let mut records = self.store.list()?;
        for record in &mut records {
            if record.status.is_live() && !state::init_alive(record.pid, record.start_time) {
                record.status = ContainerStatus::Stopped;
                if let Err(e) = self.store.save(record) {
                    tracing::warn!(id = %record.id, error = %e, "could not persist reconciled state");
                }
            }
        }
        Ok(records)
    }

    fn start_or_destroy(container: &mut Container) -> Result<()> {
        if let Err(e) = container.start() {
            if let Err(destroy) = container.destroy(true) {
                tracing::warn!(id = %container.id(), error = %destroy, "cleanup after failed start");
            }
            return Err(e);
        }
        Ok(())
    }

    fn teardown_failed_create(
        &self,
        handshake: Handshake,
        cgroup: &CgroupHandle,
        id: &ContainerId,
        cause: CapstanError,
    ) -> CapstanError {
        let reason = cause.to_string();
        let _ = handshake.abort(&reason);
        if let Err(e) = self.driver.destroy(cgroup) {
            tracing::warn!(%id, error = %e, "cgroup cleanup after failed create");
        }
        if let Err(e) = self.store.remove(id) {
            tracing::warn!(%id, error = %e, "record cleanup after failed create");
        }
        cause
    }
}
