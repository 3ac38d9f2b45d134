//! Unified-hierarchy (cgroup v2) driver.
//!
//! All controllers live in one subtree; limits translate to writes on
//! `cpu.weight`, `cpu.max`, `memory.max`, and `pids.max`, and freezing
//! uses `cgroup.freeze` confirmed through `cgroup.events`.

use std::path::{Path, PathBuf};

use capstan_common::constants::CGROUP_PARENT;
use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::ResourceLimits;
use capstan_common::types::ContainerId;

use super::{CgroupDriver, CgroupHandle, append_proc, read_procs, remove_subtree, write_control};

/// Driver for the unified cgroup hierarchy.
#[derive(Debug)]
pub struct V2Driver {
    root: PathBuf,
}

impl V2Driver {
    /// Creates a driver rooted at the hierarchy mount point.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, handle: &CgroupHandle) -> PathBuf {
        self.root.join(handle.subtree())
    }

    /// Waits until `cgroup.events` reports the wanted frozen state.
    fn wait_frozen(&self, dir: &Path, want_frozen: bool) -> Result<()> {
        let events = dir.join("cgroup.events");
        let want = if want_frozen { "frozen 1" } else { "frozen 0" };
        for _ in 0..100 {
            let content = std::fs::read_to_string(&events).map_err(|e| CapstanError::Io {
                path: events.clone(),
                source: e,
            })?;
            if content.lines().any(|line| line.trim() == want) {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(CapstanError::Resource {
            message: format!(
                "cgroup {} did not reach frozen={} state",
                dir.display(),
                u8::from(want_frozen)
            ),
        })
    }
}

/// Converts v1-scale CPU shares to a v2 `cpu.weight` value.
///
/// Same mapping the unified hierarchy uses for compatibility: shares in
/// [2, 262144] land on weights in [1, 10000]. Values past the v1 scale
/// saturate rather than overflow and still clamp to the maximum weight.
pub(crate) fn shares_to_weight(shares: u64) -> u64 {
    (1 + shares.saturating_sub(2).saturating_mul(9999) / 262_142).min(10_000)
}

/// Renders the `cpu.max` value: `"<quota> <period>"` or `"max <period>"`.
pub(crate) fn render_cpu_max(quota_us: i64, period_us: u64) -> String {
    let period = if period_us == 0 { 100_000 } else { period_us };
    if quota_us < 0 {
        format!("max {period}")
    } else {
        format!("{quota_us} {period}")
    }
}

impl CgroupDriver for V2Driver {
    fn create(&self, id: &ContainerId) -> Result<CgroupHandle> {
        let subtree = PathBuf::from(CGROUP_PARENT).join(id.as_str());
        let dir = self.root.join(&subtree);
        std::fs::create_dir_all(&dir).map_err(|e| CapstanError::Io {
            path: dir.clone(),
            source: e,
        })?;
        tracing::info!(path = %dir.display(), "cgroup created");
        Ok(CgroupHandle::new(subtree))
    }

    fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        let procs = self.dir(handle).join("cgroup.procs");
        append_proc(&procs, pid)?;
        tracing::debug!(pid, cgroup = %handle, "process added to cgroup");
        Ok(())
    }

    fn apply_limits(&self, handle: &CgroupHandle, limits: &ResourceLimits) -> Result<()> {
        let dir = self.dir(handle);
        if let Some(shares) = limits.cpu_shares {
            write_control(&dir.join("cpu.weight"), &shares_to_weight(shares).to_string())?;
        }
        if limits.cpu_quota_us.is_some() || limits.cpu_period_us.is_some() {
            let quota = limits.cpu_quota_us.unwrap_or(-1);
            let period = limits.cpu_period_us.unwrap_or(0);
            write_control(&dir.join("cpu.max"), &render_cpu_max(quota, period))?;
        }
        if let Some(bytes) = limits.memory_bytes {
            write_control(&dir.join("memory.max"), &bytes.to_string())?;
        }
        if let Some(pids) = limits.pids_max {
            write_control(&dir.join("pids.max"), &pids.to_string())?;
        }
        if !limits.device_rules.is_empty() {
            // Device gating on the unified hierarchy needs an eBPF program,
            // which this driver does not install.
            tracing::debug!(
                rules = limits.device_rules.len(),
                cgroup = %handle,
                "skipping device rules on cgroup v2"
            );
        }
        tracing::debug!(cgroup = %handle, "resource limits applied");
        Ok(())
    }

    fn freeze(&self, handle: &CgroupHandle) -> Result<()> {
        let dir = self.dir(handle);
        write_control(&dir.join("cgroup.freeze"), "1")?;
        self.wait_frozen(&dir, true)?;
        tracing::info!(cgroup = %handle, "cgroup frozen");
        Ok(())
    }

    fn thaw(&self, handle: &CgroupHandle) -> Result<()> {
        let dir = self.dir(handle);
        write_control(&dir.join("cgroup.freeze"), "0")?;
        self.wait_frozen(&dir, false)?;
        tracing::info!(cgroup = %handle, "cgroup thawed");
        Ok(())
    }

    fn is_frozen(&self, handle: &CgroupHandle) -> Result<bool> {
        let events = self.dir(handle).join("cgroup.events");
        let content = std::fs::read_to_string(&events).map_err(|e| CapstanError::Io {
            path: events,
            source: e,
        })?;
        Ok(content.lines().any(|line| line.trim() == "frozen 1"))
    }

    fn member_pids(&self, handle: &CgroupHandle) -> Result<Vec<u32>> {
        read_procs(&self.dir(handle).join("cgroup.procs"))
    }

    fn destroy(&self, handle: &CgroupHandle) -> Result<()> {
        remove_subtree(&self.dir(handle))?;
        tracing::info!(cgroup = %handle, "cgroup destroyed");
        Ok(())
    }
}
