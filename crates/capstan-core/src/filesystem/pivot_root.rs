//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`. The sequence here
//! pivots onto the rootfs in place and lazily detaches the old root, so
//! no host path stays reachable and no temporary `put_old` directory is
//! needed inside the container root.

use std::path::Path;

use capstan_common::error::Result;

/// Prepares the mount namespace for the pivot.
///
/// Makes mount propagation recursively slave so nothing leaks back to the
/// host, then binds the rootfs onto itself: `pivot_root(2)` requires the
/// new root to be a mount point.
///
/// # Errors
///
/// Returns an error if either mount operation fails.
#[cfg(target_os = "linux")]
pub fn prepare_root(rootfs: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    use capstan_common::error::CapstanError;

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        CapstanError::bootstrap("RootfsPrepared", format!("making / rslave failed: {e}"))
    })?;

    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        CapstanError::bootstrap(
            "RootfsPrepared",
            format!("self-bind of {} failed: {e}", rootfs.display()),
        )
    })?;

    tracing::debug!(rootfs = %rootfs.display(), "rootfs prepared for pivot");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn prepare_root(_rootfs: &Path) -> Result<()> {
    Err(capstan_common::error::CapstanError::Unsupported {
        operation: "rootfs preparation",
    })
}

/// Switches the root filesystem to `rootfs` and detaches the old root.
///
/// Both roots are held as directory descriptors so the sequence never
/// depends on path resolution: pivot onto `.` inside the new root, step
/// back into the old root by descriptor, cut its propagation, and lazily
/// unmount it.
///
/// # Errors
///
/// Returns an error if any step of the pivot sequence fails.
#[cfg(target_os = "linux")]
pub fn pivot(rootfs: &Path) -> Result<()> {
    use nix::fcntl::{OFlag, open};
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::sys::stat::Mode;
    use nix::unistd::{chdir, fchdir, pivot_root};

    use capstan_common::error::CapstanError;

    let step = |what: &str, e: nix::errno::Errno| {
        CapstanError::bootstrap("RootfsPrepared", format!("{what} failed: {e}"))
    };

    let old_root = open("/", OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| step("opening old root", e))?;
    let new_root = open(rootfs, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| step("opening new root", e))?;

    fchdir(&new_root).map_err(|e| step("entering new root", e))?;
    // With both arguments ".", the old root is stacked underneath the new
    // root mount and can be unmounted without a scratch directory.
    pivot_root(".", ".").map_err(|e| step("pivot_root", e))?;

    fchdir(&old_root).map_err(|e| step("re-entering old root", e))?;
    mount(
        None::<&str>,
        ".",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| step("isolating old root propagation", e))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| step("detaching old root", e))?;

    chdir("/").map_err(|e| step("entering container root", e))?;
    tracing::info!(rootfs = %rootfs.display(), "root filesystem pivoted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — `pivot_root(2)` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot(_rootfs: &Path) -> Result<()> {
    Err(capstan_common::error::CapstanError::Unsupported {
        operation: "pivot_root",
    })
}
