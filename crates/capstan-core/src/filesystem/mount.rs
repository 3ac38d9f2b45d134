//! Post-pivot application of user mount directives.
//!
//! User mounts attach strictly after the root pivot, but bind sources are
//! host paths that stop resolving once the old root is detached. Binds are
//! therefore staged before the pivot as detached mount trees
//! (`open_tree(2)` with `OPEN_TREE_CLONE`) and attached afterwards with
//! `move_mount(2)`. Pseudo-filesystems mount directly at apply time.

use std::path::{Path, PathBuf};

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::MountSpec;

/// A mount directive ready for post-pivot application.
///
/// For binds, `tree` holds the detached mount descriptor cloned from the
/// host source; pseudo-filesystems carry no descriptor.
#[derive(Debug)]
pub struct StagedMount {
    spec: MountSpec,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    tree: Option<std::os::fd::OwnedFd>,
    source_is_dir: bool,
}

impl StagedMount {
    /// The directive this staging came from.
    #[must_use]
    pub fn spec(&self) -> &MountSpec {
        &self.spec
    }
}

/// Normalizes a container-relative target to an absolute in-container path.
fn container_target(target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        Path::new("/").join(target)
    }
}

/// Creates the mount target under `root`, as a directory or as a file for
/// single-file binds, and returns the full target path.
fn ensure_target(root: &Path, target: &Path, is_dir: bool) -> Result<PathBuf> {
    let relative = container_target(target);
    let full = root.join(relative.strip_prefix("/").unwrap_or(&relative));
    if is_dir {
        std::fs::create_dir_all(&full).map_err(|e| CapstanError::Io {
            path: full.clone(),
            source: e,
        })?;
    } else {
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CapstanError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        if !full.exists() {
            drop(
                std::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&full)
                    .map_err(|e| CapstanError::Io {
                        path: full.clone(),
                        source: e,
                    })?,
            );
        }
    }
    Ok(full)
}

/// Clones a host path as a detached mount tree.
///
/// The descriptor stays valid across the pivot and is close-on-exec, so it
/// cannot leak into the workload.
#[cfg(target_os = "linux")]
fn open_tree(source: &Path, recursive: bool) -> Result<std::os::fd::OwnedFd> {
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};
    use std::os::unix::ffi::OsStrExt;

    let c_source =
        std::ffi::CString::new(source.as_os_str().as_bytes()).map_err(|_| CapstanError::Config {
            message: format!("mount source contains NUL: {}", source.display()),
        })?;
    let mut flags = libc::OPEN_TREE_CLONE | libc::OPEN_TREE_CLOEXEC;
    if recursive {
        flags |= libc::AT_RECURSIVE as libc::c_uint;
    }
    // SAFETY: c_source is a valid NUL-terminated path and the flags are a
    // valid open_tree(2) mask; the returned descriptor is owned here.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_open_tree,
            libc::AT_FDCWD,
            c_source.as_ptr(),
            flags,
        )
    };
    if fd < 0 {
        return Err(CapstanError::Io {
            path: source.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: fd was just returned by a successful open_tree(2) and is not
    // owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Attaches a detached mount tree at `target`.
#[cfg(target_os = "linux")]
fn move_mount(tree: &std::os::fd::OwnedFd, target: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;

    let c_empty = c"";
    let c_target =
        std::ffi::CString::new(target.as_os_str().as_bytes()).map_err(|_| CapstanError::Config {
            message: format!("mount target contains NUL: {}", target.display()),
        })?;
    // SAFETY: tree is a valid detached-tree descriptor, both strings are
    // NUL-terminated, and MOVE_MOUNT_F_EMPTY_PATH names the descriptor
    // itself as the source.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_move_mount,
            tree.as_raw_fd(),
            c_empty.as_ptr(),
            libc::AT_FDCWD,
            c_target.as_ptr(),
            libc::MOVE_MOUNT_F_EMPTY_PATH,
        )
    };
    if rc < 0 {
        return Err(CapstanError::Io {
            path: target.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Stages mount directives before the pivot.
///
/// Bind sources are cloned as detached trees while the host view is still
/// reachable; order is preserved for application.
///
/// # Errors
///
/// Returns an error if a bind source is missing or cannot be cloned.
#[cfg(target_os = "linux")]
pub fn stage_mounts(mounts: &[MountSpec]) -> Result<Vec<StagedMount>> {
    let mut staged = Vec::with_capacity(mounts.len());
    for spec in mounts {
        if spec.bind {
            let meta = std::fs::metadata(&spec.source).map_err(|e| CapstanError::Io {
                path: spec.source.clone(),
                source: e,
            })?;
            let tree = open_tree(&spec.source, spec.recursive)?;
            staged.push(StagedMount {
                spec: spec.clone(),
                tree: Some(tree),
                source_is_dir: meta.is_dir(),
            });
        } else {
            staged.push(StagedMount {
                spec: spec.clone(),
                tree: None,
                source_is_dir: true,
            });
        }
    }
    tracing::debug!(count = staged.len(), "mount sources staged");
    Ok(staged)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — mount staging requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn stage_mounts(_mounts: &[MountSpec]) -> Result<Vec<StagedMount>> {
    Err(CapstanError::Unsupported {
        operation: "mount staging",
    })
}

/// Applies staged mounts inside the pivoted root, in directive order.
///
/// Must run after [`super::pivot_root::pivot`], with the working directory
/// at the container root.
///
/// # Errors
///
/// Returns an error if target creation, attachment, or a read-only remount
/// fails. Partially applied mounts are not rolled back; the caller tears
/// the container down wholesale.
#[cfg(target_os = "linux")]
pub fn apply_mounts(staged: &[StagedMount]) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    for entry in staged {
        let spec = &entry.spec;
        let target = ensure_target(Path::new("/"), &spec.target, entry.source_is_dir)?;

        if let Some(tree) = &entry.tree {
            move_mount(tree, &target)?;
            if spec.read_only {
                mount(
                    None::<&str>,
                    &target,
                    None::<&str>,
                    MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|e| {
                    CapstanError::bootstrap(
                        "MountsApplied",
                        format!("read-only remount of {} failed: {e}", target.display()),
                    )
                })?;
            }
        } else {
            let fstype = spec.fstype.as_deref().unwrap_or("tmpfs");
            let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
            if spec.read_only {
                flags |= MsFlags::MS_RDONLY;
            }
            mount(
                Some(spec.source.as_path()),
                &target,
                Some(fstype),
                flags,
                spec.data.as_deref(),
            )
            .map_err(|e| {
                CapstanError::bootstrap(
                    "MountsApplied",
                    format!("mounting {fstype} at {} failed: {e}", target.display()),
                )
            })?;
        }
        tracing::debug!(target = %spec.target.display(), bind = spec.bind, "mount applied");
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — mount application requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn apply_mounts(_staged: &[StagedMount]) -> Result<()> {
    Err(CapstanError::Unsupported {
        operation: "mount application",
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn relative_targets_are_rooted() {
        assert_eq!(container_target(Path::new("proc")), PathBuf::from("/proc"));
        assert_eq!(
            container_target(Path::new("/dev/shm")),
            PathBuf::from("/dev/shm")
        );
    }

    #[test]
    fn directory_targets_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let full = ensure_target(dir.path(), Path::new("/var/lib/app"), true).expect("target");
        assert!(full.is_dir());
        assert_eq!(full, dir.path().join("var/lib/app"));
    }

    #[test]
    fn file_targets_are_touched_with_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let full =
            ensure_target(dir.path(), Path::new("/etc/resolv.conf"), false).expect("target");
        assert!(full.is_file());
    }

    #[test]
    fn existing_file_target_is_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("fixture");
        std::fs::write(dir.path().join("etc/hosts"), "preexisting").expect("fixture");
        let full = ensure_target(dir.path(), Path::new("/etc/hosts"), false).expect("target");
        assert_eq!(
            std::fs::read_to_string(full).expect("content"),
            "preexisting"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_bind_source_fails_at_staging() {
        let spec = MountSpec::bind("/nonexistent/host/dir", "/data");
        let err = stage_mounts(&[spec]).expect_err("missing source must fail");
        assert!(err.to_string().contains("/nonexistent/host/dir"), "{err}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pseudo_mounts_stage_without_descriptors() {
        let specs = vec![
            MountSpec::pseudo("proc", "/proc"),
            MountSpec::pseudo("tmpfs", "/tmp").read_only(),
        ];
        let staged = stage_mounts(&specs).expect("staging touches nothing");
        assert_eq!(staged.len(), 2);
        assert!(staged.iter().all(|s| !s.spec().bind));
        assert!(staged[1].spec().read_only);
    }
}
