//! Legacy per-controller (cgroup v1) driver.
//!
//! Each controller is its own hierarchy under the mount root; the driver
//! mirrors the container subtree into every mounted controller it cares
//! about. Freezing goes through the `freezer` controller's `freezer.state`,
//! which must be re-read until the kernel reports the transition settled.

use std::path::PathBuf;

use capstan_common::constants::CGROUP_PARENT;
use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::{DeviceRule, ResourceLimits};
use capstan_common::types::ContainerId;

use super::{CgroupDriver, CgroupHandle, append_proc, read_procs, remove_subtree, write_control};

/// Controllers the driver manages when their hierarchies are mounted.
const SUBSYSTEMS: &[&str] = &["cpu", "memory", "pids", "freezer", "devices"];

/// Driver for legacy split cgroup hierarchies.
#[derive(Debug)]
pub struct V1Driver {
    root: PathBuf,
}

impl V1Driver {
    /// Creates a driver rooted at the controllers' common mount point.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn subsystem_root(&self, subsystem: &str) -> PathBuf {
        self.root.join(subsystem)
    }

    fn dir(&self, subsystem: &str, handle: &CgroupHandle) -> PathBuf {
        self.subsystem_root(subsystem).join(handle.subtree())
    }

    /// Mounted subsystems, in `SUBSYSTEMS` order.
    fn mounted(&self) -> Vec<&'static str> {
        SUBSYSTEMS
            .iter()
            .copied()
            .filter(|s| self.subsystem_root(s).is_dir())
            .collect()
    }

    /// Drives `freezer.state` to the wanted value.
    ///
    /// The kernel may report `FREEZING` for a while; the write is repeated
    /// until the state file reads back the target.
    fn set_freezer(&self, handle: &CgroupHandle, want: &str) -> Result<()> {
        let state = self.dir("freezer", handle).join("freezer.state");
        for _ in 0..100 {
            write_control(&state, want)?;
            let current = std::fs::read_to_string(&state).map_err(|e| CapstanError::Io {
                path: state.clone(),
                source: e,
            })?;
            if current.trim() == want {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(CapstanError::Resource {
            message: format!("freezer did not settle at {want} for {handle}"),
        })
    }
}

/// Renders a device rule in the `devices.allow`/`devices.deny` format,
/// e.g. `c 1:3 rwm` or `a *:* rwm`.
pub(crate) fn render_device_rule(rule: &DeviceRule) -> String {
    let num = |n: Option<u64>| n.map_or_else(|| "*".to_string(), |v| v.to_string());
    format!(
        "{} {}:{} {}",
        rule.dev_type,
        num(rule.major),
        num(rule.minor),
        rule.access
    )
}

impl CgroupDriver for V1Driver {
    fn create(&self, id: &ContainerId) -> Result<CgroupHandle> {
        let subtree = PathBuf::from(CGROUP_PARENT).join(id.as_str());
        let mounted = self.mounted();
        if mounted.is_empty() {
            return Err(CapstanError::Resource {
                message: format!("no cgroup v1 controllers mounted under {}", self.root.display()),
            });
        }
        for subsystem in &mounted {
            let dir = self.subsystem_root(subsystem).join(&subtree);
            std::fs::create_dir_all(&dir).map_err(|e| CapstanError::Io {
                path: dir,
                source: e,
            })?;
        }
        tracing::info!(subtree = %subtree.display(), controllers = mounted.len(), "cgroup created");
        Ok(CgroupHandle::new(subtree))
    }

    fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        for subsystem in self.mounted() {
            append_proc(&self.dir(subsystem, handle).join("cgroup.procs"), pid)?;
        }
        tracing::debug!(pid, cgroup = %handle, "process added to cgroup");
        Ok(())
    }

    fn apply_limits(&self, handle: &CgroupHandle, limits: &ResourceLimits) -> Result<()> {
        if let Some(shares) = limits.cpu_shares {
            write_control(
                &self.dir("cpu", handle).join("cpu.shares"),
                &shares.to_string(),
            )?;
        }
        if let Some(period) = limits.cpu_period_us {
            write_control(
                &self.dir("cpu", handle).join("cpu.cfs_period_us"),
                &period.to_string(),
            )?;
        }
        if let Some(quota) = limits.cpu_quota_us {
            write_control(
                &self.dir("cpu", handle).join("cpu.cfs_quota_us"),
                &quota.to_string(),
            )?;
        }
        if let Some(bytes) = limits.memory_bytes {
            write_control(
                &self.dir("memory", handle).join("memory.limit_in_bytes"),
                &bytes.to_string(),
            )?;
        }
        if let Some(pids) = limits.pids_max {
            write_control(&self.dir("pids", handle).join("pids.max"), &pids.to_string())?;
        }
        for rule in &limits.device_rules {
            let file = if rule.allow {
                "devices.allow"
            } else {
                "devices.deny"
            };
            write_control(
                &self.dir("devices", handle).join(file),
                &render_device_rule(rule),
            )?;
        }
        tracing::debug!(cgroup = %handle, "resource limits applied");
        Ok(())
    }

    fn freeze(&self, handle: &CgroupHandle) -> Result<()> {
        self.set_freezer(handle, "FROZEN")?;
        tracing::info!(cgroup = %handle, "cgroup frozen");
        Ok(())
    }

    fn thaw(&self, handle: &CgroupHandle) -> Result<()> {
        self.set_freezer(handle, "THAWED")?;
        tracing::info!(cgroup = %handle, "cgroup thawed");
        Ok(())
    }

    fn is_frozen(&self, handle: &CgroupHandle) -> Result<bool> {
        let state = self.dir("freezer", handle).join("freezer.state");
        let content = std::fs::read_to_string(&state).map_err(|e| CapstanError::Io {
            path: state,
            source: e,
        })?;
        Ok(content.trim() == "FROZEN")
    }

    fn member_pids(&self, handle: &CgroupHandle) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for subsystem in self.mounted() {
            let procs = self.dir(subsystem, handle).join("cgroup.procs");
            if procs.exists() {
                pids.extend(read_procs(&procs)?);
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    fn destroy(&self, handle: &CgroupHandle) -> Result<()> {
        for subsystem in self.mounted() {
            remove_subtree(&self.dir(subsystem, handle))?;
        }
        tracing::info!(cgroup = %handle, "cgroup destroyed");
        Ok(())
    }
}
