//! System-wide constants and default paths.
//!
//! These are defaults only: the engine never reads them behind the caller's
//! back. Everything configurable is threaded through `EngineConfig` at
//! construction time.

/// Default base directory for persisted container records.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/capstan";

/// Mount point of the cgroup hierarchy (v1 controllers or v2 unified).
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Name of the cgroup subtree containers are placed under.
pub const CGROUP_PARENT: &str = "capstan";

/// File name of the per-container state record.
pub const RECORD_FILE: &str = "record.json";

/// Default deadline for a single handshake step, in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 10;

/// Default deadline for a lifecycle hook invocation, in seconds.
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;
