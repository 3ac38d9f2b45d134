//! User namespace credential mapping.
//!
//! Maps container UIDs/GIDs to host ranges by writing `/proc/<pid>/uid_map`
//! and `gid_map` from the controller, which retains the privileged view of
//! the new namespace. The init process itself cannot write its own maps
//! once it has entered the namespace without privilege.

use capstan_common::error::Result;
use capstan_common::spec::IdMapping;

/// Renders mapping ranges in the kernel's `inside outside count` format.
fn render_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}", m.inside, m.outside, m.count))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes UID and GID mappings for a child's new user namespace.
///
/// Denies `setgroups` before the GID map when the file is present, which
/// is required before an unprivileged process may write `gid_map` and is
/// harmless otherwise.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/setgroups`, `uid_map`, or
/// `gid_map` fails.
#[cfg(target_os = "linux")]
pub fn write_id_mappings(
    pid: u32,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<()> {
    use std::fs;

    use capstan_common::error::CapstanError;

    let setgroups_path = format!("/proc/{pid}/setgroups");
    if std::path::Path::new(&setgroups_path).exists() {
        fs::write(&setgroups_path, "deny").map_err(|e| CapstanError::Io {
            path: setgroups_path.into(),
            source: e,
        })?;
    }

    if !uid_mappings.is_empty() {
        let uid_map_path = format!("/proc/{pid}/uid_map");
        fs::write(&uid_map_path, render_map(uid_mappings)).map_err(|e| CapstanError::Io {
            path: uid_map_path.into(),
            source: e,
        })?;
    }

    if !gid_mappings.is_empty() {
        let gid_map_path = format!("/proc/{pid}/gid_map");
        fs::write(&gid_map_path, render_map(gid_mappings)).map_err(|e| CapstanError::Io {
            path: gid_map_path.into(),
            source: e,
        })?;
    }

    tracing::debug!(
        pid,
        uid_ranges = uid_mappings.len(),
        gid_ranges = gid_mappings.len(),
        "wrote UID/GID maps"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — UID/GID mapping requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn write_id_mappings(
    _pid: u32,
    _uid_mappings: &[IdMapping],
    _gid_mappings: &[IdMapping],
) -> Result<()> {
    Err(capstan_common::error::CapstanError::Unsupported {
        operation: "UID/GID mapping",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lines_use_kernel_format() {
        let rendered = render_map(&[IdMapping::new(0, 100_000, 65_536), IdMapping::new(1000, 5, 1)]);
        assert_eq!(rendered, "0 100000 65536\n1000 5 1");
    }

    #[test]
    fn empty_mapping_renders_empty() {
        assert_eq!(render_map(&[]), "");
    }
}
