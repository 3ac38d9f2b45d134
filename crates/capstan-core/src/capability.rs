//! Linux capability reduction for least-privilege execution.
//!
//! Finalization reduces every capability set of the init process to
//! exactly the configured set: bounding first (while the process is still
//! privileged), then the credential switch, then the effective, permitted,
//! inheritable, and ambient sets. Keep-caps bridges the switch so the
//! permitted set survives `setuid(2)`.

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::CapabilitySet;

/// Fallback for the highest capability number when the kernel does not
/// expose it.
const FALLBACK_LAST_CAP: u32 = 40;

/// Kernel capability user-space header, version 3.
#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

/// One 32-bit word of each capability set.
#[repr(C)]
#[derive(Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Parses the contents of `/proc/sys/kernel/cap_last_cap`.
fn parse_last_cap(content: &str) -> Option<u32> {
    content.trim().parse().ok()
}

/// Splits a capability set into the kernel's low/high 32-bit words.
fn set_words(caps: &CapabilitySet) -> (u32, u32) {
    let mut low = 0u32;
    let mut high = 0u32;
    for cap in caps.iter() {
        if cap < 32 {
            low |= 1 << cap;
        } else if cap < 64 {
            high |= 1 << (cap - 32);
        }
    }
    (low, high)
}

/// Highest capability number supported by the running kernel.
#[cfg(target_os = "linux")]
fn last_cap() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| parse_last_cap(&s))
        .unwrap_or(FALLBACK_LAST_CAP)
}

#[cfg(target_os = "linux")]
fn cap_error(message: String) -> CapstanError {
    CapstanError::bootstrap("CapabilitiesDropped", message)
}

/// Removes every capability outside `keep` from the bounding set.
#[cfg(target_os = "linux")]
fn drop_bounding(keep: &CapabilitySet) -> Result<()> {
    for cap in 0..=last_cap() {
        if keep.contains(cap) {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP with a capability number has no memory
        // arguments.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(cap), 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Unknown capability numbers on older kernels are not fatal.
            if err.raw_os_error() == Some(libc::EINVAL) {
                continue;
            }
            return Err(cap_error(format!("dropping bounding cap {cap}: {err}")));
        }
    }
    tracing::debug!(kept = keep.len(), "bounding set reduced");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_keepcaps(enabled: bool) -> Result<()> {
    // SAFETY: PR_SET_KEEPCAPS takes a single integer argument.
    let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, libc::c_ulong::from(enabled), 0, 0, 0) };
    if rc != 0 {
        return Err(cap_error(format!(
            "PR_SET_KEEPCAPS({enabled}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Switches to the workload's credentials: supplementary groups first,
/// then GID, then UID, so privilege is shed last.
#[cfg(target_os = "linux")]
fn switch_credentials(uid: u32, gid: u32, extra_groups: &[u32]) -> Result<()> {
    use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};

    let map_id_err = |what: &str, e: nix::errno::Errno| {
        if e == nix::errno::Errno::EINVAL {
            cap_error(format!("{what}: id is not mapped in the user namespace"))
        } else {
            cap_error(format!("{what}: {e}"))
        }
    };

    if !extra_groups.is_empty() {
        let groups: Vec<Gid> = extra_groups.iter().map(|g| Gid::from_raw(*g)).collect();
        setgroups(&groups).map_err(|e| map_id_err("setgroups", e))?;
    }
    setgid(Gid::from_raw(gid)).map_err(|e| map_id_err("setgid", e))?;
    setuid(Uid::from_raw(uid)).map_err(|e| map_id_err("setuid", e))?;
    Ok(())
}

/// Applies `capset(2)` with effective = permitted = inheritable = `caps`,
/// then rebuilds the ambient set to match.
#[cfg(target_os = "linux")]
fn apply_sets(caps: &CapabilitySet) -> Result<()> {
    let (low, high) = set_words(caps);
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: low,
            permitted: low,
            inheritable: low,
        },
        CapUserData {
            effective: high,
            permitted: high,
            inheritable: high,
        },
    ];
    // SAFETY: header and data are valid for the V3 capability ABI, which
    // expects two data words.
    let rc = unsafe { libc::syscall(libc::SYS_capset, &raw const header, data.as_ptr()) };
    if rc != 0 {
        return Err(cap_error(format!(
            "capset: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL takes no further arguments.
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(cap_error(format!(
            "clearing ambient set: {}",
            std::io::Error::last_os_error()
        )));
    }
    for cap in caps.iter() {
        // SAFETY: PR_CAP_AMBIENT_RAISE with a capability number present in
        // the permitted and inheritable sets.
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE,
                libc::c_ulong::from(cap),
                0,
                0,
            )
        };
        if rc != 0 {
            return Err(cap_error(format!(
                "raising ambient cap {cap}: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Reduces the process to exactly `caps` and the given credentials.
///
/// Must run after all privileged setup (mounts, cgroup join) and before
/// the seccomp filter is installed, since an active filter could block the
/// calls made here.
///
/// # Errors
///
/// Returns an error if any capability or credential syscall fails; an
/// unmapped UID/GID inside a new user namespace surfaces as a descriptive
/// bootstrap failure.
#[cfg(target_os = "linux")]
pub fn finalize(caps: &CapabilitySet, uid: u32, gid: u32, extra_groups: &[u32]) -> Result<()> {
    drop_bounding(caps)?;
    set_keepcaps(true)?;
    switch_credentials(uid, gid, extra_groups)?;
    apply_sets(caps)?;
    set_keepcaps(false)?;
    tracing::info!(kept = caps.len(), uid, gid, "capabilities finalized");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — capability manipulation requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn finalize(_caps: &CapabilitySet, _uid: u32, _gid: u32, _extra_groups: &[u32]) -> Result<()> {
    Err(CapstanError::Unsupported {
        operation: "capability finalization",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_cap_parses_with_trailing_newline() {
        assert_eq!(parse_last_cap("40\n"), Some(40));
        assert_eq!(parse_last_cap("garbage"), None);
    }

    #[test]
    fn set_words_split_across_the_word_boundary() {
        // CAP_CHOWN=0, CAP_KILL=5, and a high cap (38 = PERFMON).
        let caps = CapabilitySet::from_numbers([0, 5, 38]);
        let (low, high) = set_words(&caps);
        assert_eq!(low, (1 << 0) | (1 << 5));
        assert_eq!(high, 1 << 6);
    }

    #[test]
    fn empty_set_produces_zero_words() {
        let (low, high) = set_words(&CapabilitySet::empty());
        assert_eq!((low, high), (0, 0));
    }
}
