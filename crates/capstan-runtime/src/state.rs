//! Persisted container records and init-process liveness.
//!
//! Each container owns one directory under the state root with a single
//! `record.json` inside. Writes go through a temp file, fsync, and rename
//! so a crash leaves either the old record or the new one, never a torn
//! file. The record pairs the pid with the process's start tick from
//! `/proc/<pid>/stat`; a recycled pid fails the tick comparison and is
//! reported dead instead of adopted.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use capstan_common::constants::RECORD_FILE;
use capstan_common::error::{CapstanError, Result};
use capstan_common::types::{ContainerId, ContainerStatus, ExitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The durable view of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    /// Container identifier; also names the directory on disk.
    pub id: ContainerId,
    /// Pid of the init process in the controller's pid namespace.
    pub pid: i32,
    /// Start tick of the init process, from `/proc/<pid>/stat`.
    ///
    /// Together with the pid this identifies the process across
    /// controller restarts; a recycled pid has a different tick.
    pub start_time: u64,
    /// Last observed lifecycle state.
    pub status: ContainerStatus,
    /// When the record was first written.
    pub created_at: DateTime<Utc>,
    /// Exit status, once the init process has been reaped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<ExitStatus>,
}

impl ProcessRecord {
    /// A fresh record for a container whose bootstrap just started.
    #[must_use]
    pub fn new(id: ContainerId, pid: i32, start_time: u64) -> Self {
        Self {
            id,
            pid,
            start_time,
            status: ContainerStatus::Creating,
            created_at: Utc::now(),
            exit_status: None,
        }
    }
}

/// Filesystem-backed store of [`ProcessRecord`]s.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// A store rooted at the given directory. Nothing is created until
    /// the first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Writes the record atomically.
    ///
    /// The record file is replaced by rename, and the directory is
    /// synced so the rename itself survives a crash.
    ///
    /// # Errors
    ///
    /// Returns an I/O error naming the failing path, or a serialization
    /// error.
    pub fn save(&self, record: &ProcessRecord) -> Result<()> {
        let dir = self.container_dir(&record.id);
        fs::create_dir_all(&dir).map_err(|source| CapstanError::Io {
            path: dir.clone(),
            source,
        })?;

        let tmp = dir.join(".record.json.tmp");
        let final_path = dir.join(RECORD_FILE);
        let payload = serde_json::to_vec_pretty(record)?;

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CapstanError::Io { path, source }
        };

        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&payload).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        drop(file);

        fs::rename(&tmp, &final_path).map_err(io_err(&final_path))?;
        File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(io_err(&dir))?;

        tracing::trace!(id = %record.id, status = %record.status, "record persisted");
        Ok(())
    }

    /// Loads one container's record.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::NotFound`] when no record exists, an I/O
    /// error for unreadable files, and a serialization error for a
    /// malformed record.
    pub fn load(&self, id: &ContainerId) -> Result<ProcessRecord> {
        let path = self.container_dir(id).join(RECORD_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapstanError::NotFound {
                    kind: "container",
                    id: id.to_string(),
                });
            }
            Err(source) => return Err(CapstanError::Io { path, source }),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Loads every readable record under the root.
    ///
    /// Malformed or unreadable records are logged and skipped; one
    /// corrupt file must not hide the rest of the containers.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only when the root itself cannot be listed.
    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(CapstanError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let id = ContainerId::new(entry.file_name().to_string_lossy());
            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping unreadable record");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Removes a container's directory and everything in it.
    ///
    /// Removing an absent container is a no-op, so teardown paths can
    /// retry safely.
    ///
    /// # Errors
    ///
    /// Returns an I/O error naming the directory.
    pub fn remove(&self, id: &ContainerId) -> Result<()> {
        let dir = self.container_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CapstanError::Io { path: dir, source }),
        }
    }
}

/// Extracts the start tick (field 22) from a `/proc/<pid>/stat` line.
///
/// The comm field may contain spaces and parentheses, so fields are
/// counted from the last `)` rather than from the front.
fn parse_start_tick(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Reads the start tick of a live process, or `None` when the process
/// is gone or its stat line cannot be parsed.
#[cfg(target_os = "linux")]
#[must_use]
pub fn read_start_tick(pid: i32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_tick(&stat)
}

/// Stub for platforms without procfs.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn read_start_tick(_pid: i32) -> Option<u64> {
    None
}

/// Whether the recorded init process is still the one running.
///
/// A pid that no longer exists, or that was recycled for an unrelated
/// process (start tick differs), counts as dead.
#[must_use]
pub fn init_alive(pid: i32, start_time: u64) -> bool {
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
        return false;
    }
    read_start_tick(pid) == Some(start_time)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("temp state root");
        let store = StateStore::new(dir.path());
        (dir, store)
    }

    fn record(id: &str) -> ProcessRecord {
        ProcessRecord::new(ContainerId::new(id), 1234, 567_890)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let mut rec = record("alpha");
        rec.status = ContainerStatus::Running;
        store.save(&rec).expect("save");

        let loaded = store.load(&ContainerId::new("alpha")).expect("load");
        assert_eq!(loaded, rec);
    }

    #[test]
    fn save_replaces_the_previous_record() {
        let (_dir, store) = store();
        let mut rec = record("alpha");
        store.save(&rec).expect("first save");

        rec.status = ContainerStatus::Stopped;
        rec.exit_status = Some(ExitStatus::exited(7));
        store.save(&rec).expect("second save");

        let loaded = store.load(&rec.id).expect("load");
        assert_eq!(loaded.status, ContainerStatus::Stopped);
        assert_eq!(loaded.exit_status, Some(ExitStatus::exited(7)));

        let dir = store.root().join("alpha");
        assert!(!dir.join(".record.json.tmp").exists(), "temp file cleaned up");
    }

    #[test]
    fn load_missing_container_is_not_found() {
        let (_dir, store) = store();
        let err = store
            .load(&ContainerId::new("ghost"))
            .expect_err("missing record");
        assert!(matches!(err, CapstanError::NotFound { kind: "container", .. }));
    }

    #[test]
    fn list_returns_records_in_creation_order() {
        let (_dir, store) = store();
        let first = record("first");
        let mut second = record("second");
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        store.save(&second).expect("save second");
        store.save(&first).expect("save first");

        let ids: Vec<String> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["first".to_owned(), "second".to_owned()]);
    }

    #[test]
    fn list_skips_malformed_records() {
        let (_dir, store) = store();
        store.save(&record("good")).expect("save good");

        let bad_dir = store.root().join("bad");
        fs::create_dir_all(&bad_dir).expect("bad dir");
        fs::write(bad_dir.join(RECORD_FILE), b"{ not json").expect("write garbage");

        let records = store.list().expect("list survives garbage");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_str(), "good");
    }

    #[test]
    fn list_on_absent_root_is_empty() {
        let store = StateStore::new("/nonexistent/capstan-state-root");
        assert!(store.list().expect("empty list").is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();
        let rec = record("gone");
        store.save(&rec).expect("save");
        store.remove(&rec.id).expect("first remove");
        store.remove(&rec.id).expect("second remove");
        assert!(!store.root().join("gone").exists());
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let rec = record("alpha");
        let json = serde_json::to_string(&rec).expect("serialize");
        assert!(json.contains("\"startTime\""), "{json}");
        assert!(json.contains("\"createdAt\""), "{json}");
        assert!(!json.contains("exitStatus"), "absent exit status is omitted");
    }

    #[test]
    fn start_tick_parses_around_hostile_comm_names() {
        let stat = "1234 (a) b) c) R 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    5 3 0 0 20 0 1 0 9876543 12345678 200 18446744073709551615";
        assert_eq!(parse_start_tick(stat), Some(9_876_543));
    }

    #[test]
    fn start_tick_parse_rejects_truncated_lines() {
        assert_eq!(parse_start_tick("1234 (short) R 1 2"), None);
        assert_eq!(parse_start_tick("no parens here"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_process_is_alive_with_matching_tick() {
        let pid = i32::try_from(std::process::id()).expect("pid fits i32");
        let tick = read_start_tick(pid).expect("own start tick");
        assert!(init_alive(pid, tick));
        assert!(!init_alive(pid, tick.wrapping_add(1)), "tick mismatch is dead");
    }
}
