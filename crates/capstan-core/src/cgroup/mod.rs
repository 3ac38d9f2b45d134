//! Cgroup resource management behind a version-neutral driver interface.
//!
//! The engine never learns whether it is talking to the unified (v2)
//! hierarchy or the legacy (v1) per-controller hierarchies: it holds a
//! [`CgroupDriver`] trait object selected once at construction and an
//! opaque [`CgroupHandle`] per container. Drivers are stateless; the
//! kernel serializes writes to a given control file.

pub mod v1;
pub mod v2;

use std::fmt;
use std::path::{Path, PathBuf};

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::ResourceLimits;
use capstan_common::types::ContainerId;

/// Opaque handle to one container's cgroup.
///
/// Internally the subtree path relative to the hierarchy root; callers
/// only pass it back to the driver that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    subtree: PathBuf,
}

impl CgroupHandle {
    /// Mints a handle for `subtree`. Driver implementations, including
    /// test drivers, are the only intended callers.
    #[must_use]
    pub fn new(subtree: PathBuf) -> Self {
        Self { subtree }
    }

    /// The subtree path relative to the hierarchy root, for diagnostics.
    #[must_use]
    pub fn subtree(&self) -> &Path {
        &self.subtree
    }
}

impl fmt::Display for CgroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subtree.display())
    }
}

/// Version-neutral cgroup operations consumed by the bootstrap handshake
/// and the lifecycle manager.
///
/// Every operation is idempotent for a retry of the same logical request:
/// creating an existing group, adding an already-member PID, freezing a
/// frozen group, and destroying a missing group all succeed.
pub trait CgroupDriver: fmt::Debug + Send + Sync {
    /// Creates (or re-opens) the cgroup for a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtree cannot be created.
    fn create(&self, id: &ContainerId) -> Result<CgroupHandle>;

    /// Moves a process into the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership write fails.
    fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<()>;

    /// Applies resource limits to the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if a control-file write fails.
    fn apply_limits(&self, handle: &CgroupHandle, limits: &ResourceLimits) -> Result<()>;

    /// Freezes every process in the cgroup, waiting for the kernel to
    /// report the frozen state.
    ///
    /// # Errors
    ///
    /// Returns an error if the freeze cannot be confirmed.
    fn freeze(&self, handle: &CgroupHandle) -> Result<()>;

    /// Thaws a frozen cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the thaw cannot be confirmed.
    fn thaw(&self, handle: &CgroupHandle) -> Result<()>;

    /// Reports whether the cgroup is currently frozen, as the kernel
    /// sees it. Used to reconcile a recorded `Paused` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer state cannot be read.
    fn is_frozen(&self, handle: &CgroupHandle) -> Result<bool>;

    /// Lists the PIDs currently in the cgroup, deduplicated and sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be read.
    fn member_pids(&self, handle: &CgroupHandle) -> Result<Vec<u32>>;

    /// Removes the cgroup. Succeeds if it is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtree exists but cannot be removed.
    fn destroy(&self, handle: &CgroupHandle) -> Result<()>;
}

/// Selects a driver for the hierarchy mounted at `root`.
///
/// The unified hierarchy is recognized by its `cgroup.controllers` file;
/// anything else is treated as a legacy per-controller mount.
#[must_use]
pub fn detect_driver(root: &Path) -> Box<dyn CgroupDriver> {
    if root.join("cgroup.controllers").exists() {
        tracing::debug!(root = %root.display(), "using unified cgroup hierarchy");
        Box::new(v2::V2Driver::new(root))
    } else {
        tracing::debug!(root = %root.display(), "using legacy cgroup hierarchies");
        Box::new(v1::V1Driver::new(root))
    }
}

/// Writes a cgroup control file, mapping failures to I/O errors.
pub(crate) fn write_control(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).map_err(|e| CapstanError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Appends one line to a membership file.
///
/// Each `write(2)` to `cgroup.procs` is a separate attach operation, so
/// append semantics mirror the kernel's behavior.
pub(crate) fn append_proc(path: &Path, pid: u32) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CapstanError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    writeln!(file, "{pid}").map_err(|e| CapstanError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Reads a membership file into a deduplicated, sorted PID list.
pub(crate) fn read_procs(path: &Path) -> Result<Vec<u32>> {
    let content = std::fs::read_to_string(path).map_err(|e| CapstanError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut pids: Vec<u32> = content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

/// Removes a cgroup directory, retrying while the kernel still holds it.
pub(crate) fn remove_subtree(path: &Path) -> Result<()> {
    use std::io::ErrorKind;

    for attempt in 0..5 {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt == 4 => {
                return Err(CapstanError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(10)),
        }
    }
    Ok(())
}
