//! Resolved container specification value objects.
//!
//! Everything in this module arrives already validated and resolved by the
//! configuration loader: capability and syscall names have been turned into
//! numbers, mount options into flags, and namespace references into paths.
//! The engine consumes these values as-is and never parses configuration
//! text. All types are immutable once a bootstrap begins.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of Linux namespace a [`NamespaceSpec`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Mount points.
    Mount,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Process IDs.
    Pid,
    /// Network devices, stacks, and ports.
    Network,
    /// UID/GID mappings and capabilities.
    User,
    /// Cgroup root directory view.
    Cgroup,
    /// Boot and monotonic clock offsets.
    Time,
}

impl NamespaceKind {
    /// All namespace kinds, in no particular order.
    pub const ALL: [Self; 8] = [
        Self::Mount,
        Self::Uts,
        Self::Ipc,
        Self::Pid,
        Self::Network,
        Self::User,
        Self::Cgroup,
        Self::Time,
    ];

    /// The entry name under `/proc/<pid>/ns/` for this kind.
    #[must_use]
    pub fn proc_entry(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
            Self::Network => "net",
            Self::User => "user",
            Self::Cgroup => "cgroup",
            Self::Time => "time",
        }
    }

    /// Human-readable name used in errors and log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
            Self::Network => "network",
            Self::User => "user",
            Self::Cgroup => "cgroup",
            Self::Time => "time",
        }
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do for one namespace kind during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceAction {
    /// Create a fresh namespace at process creation.
    Create,
    /// Join the existing namespace behind this path (a `/proc/<pid>/ns/*`
    /// entry or a bind-mounted namespace file).
    Join(PathBuf),
}

/// One resolved namespace directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    /// Which namespace this directive concerns.
    pub kind: NamespaceKind,
    /// Create a new namespace or join an existing one.
    pub action: NamespaceAction,
}

impl NamespaceSpec {
    /// A directive to create a fresh namespace of `kind`.
    #[must_use]
    pub fn create(kind: NamespaceKind) -> Self {
        Self {
            kind,
            action: NamespaceAction::Create,
        }
    }

    /// A directive to join the namespace behind `path`.
    #[must_use]
    pub fn join(kind: NamespaceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            action: NamespaceAction::Join(path.into()),
        }
    }
}

/// One UID or GID mapping range for a new user namespace.
///
/// `inside` is the first ID as seen inside the namespace, `outside` the
/// first host ID it maps to, `count` the length of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First ID inside the namespace.
    pub inside: u32,
    /// First ID outside (host view).
    pub outside: u32,
    /// Number of consecutive IDs mapped.
    pub count: u32,
}

impl IdMapping {
    /// Creates a mapping range.
    #[must_use]
    pub fn new(inside: u32, outside: u32, count: u32) -> Self {
        Self {
            inside,
            outside,
            count,
        }
    }
}

/// One resolved mount directive, applied after the root pivot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Mount source: a host path for binds, a device or filesystem label
    /// otherwise.
    pub source: PathBuf,
    /// Target path, relative to the container root.
    pub target: PathBuf,
    /// Filesystem type for non-bind mounts (`proc`, `tmpfs`, `sysfs`, ...).
    pub fstype: Option<String>,
    /// Filesystem-specific data string passed to the mount call.
    pub data: Option<String>,
    /// Whether this is a bind mount of a host path.
    pub bind: bool,
    /// Whether a bind mount replicates the whole subtree.
    pub recursive: bool,
    /// Whether the mount is remounted read-only after attachment.
    pub read_only: bool,
}

impl MountSpec {
    /// A recursive bind mount of `source` at `target`.
    #[must_use]
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            data: None,
            bind: true,
            recursive: true,
            read_only: false,
        }
    }

    /// A pseudo-filesystem mount (`proc`, `tmpfs`, `sysfs`, ...) at `target`.
    #[must_use]
    pub fn pseudo(fstype: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        let fstype = fstype.into();
        Self {
            source: PathBuf::from(&fstype),
            target: target.into(),
            fstype: Some(fstype),
            data: None,
            bind: false,
            recursive: false,
            read_only: false,
        }
    }

    /// Marks the mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// One device-access rule, meaningful to the legacy cgroup hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Whether the rule allows (true) or denies (false) access.
    pub allow: bool,
    /// Device class: `'c'` (char), `'b'` (block), or `'a'` (all).
    pub dev_type: char,
    /// Major number; `None` means any.
    pub major: Option<u64>,
    /// Minor number; `None` means any.
    pub minor: Option<u64>,
    /// Access string, a subset of `"rwm"`.
    pub access: String,
}

/// Resource limits for a container, as plain values.
///
/// No cgroup v1/v2 detail leaks in here; the selected driver translates
/// these into its own file writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU shares (relative weight, v1 scale).
    pub cpu_shares: Option<u64>,
    /// CPU quota in microseconds per period; negative means unlimited.
    pub cpu_quota_us: Option<i64>,
    /// CPU period in microseconds.
    pub cpu_period_us: Option<u64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// Maximum number of tasks.
    pub pids_max: Option<u64>,
    /// Device access rules.
    pub device_rules: Vec<DeviceRule>,
}

impl ResourceLimits {
    /// Whether no limit of any kind is requested.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.cpu_shares.is_none()
            && self.cpu_quota_us.is_none()
            && self.cpu_period_us.is_none()
            && self.memory_bytes.is_none()
            && self.pids_max.is_none()
            && self.device_rules.is_empty()
    }
}

/// The exact set of capabilities a container keeps.
///
/// Members are kernel capability numbers (`CAP_CHOWN` = 0, ...), resolved
/// from names by the configuration loader. The bootstrap reduces every
/// capability set of the init process to precisely this set; an empty set
/// leaves the workload with no capabilities at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<u32>);

impl CapabilitySet {
    /// The empty capability set.
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Builds a set from capability numbers.
    #[must_use]
    pub fn from_numbers(numbers: impl IntoIterator<Item = u32>) -> Self {
        Self(numbers.into_iter().collect())
    }

    /// Whether `cap` is a member.
    #[must_use]
    pub fn contains(&self, cap: u32) -> bool {
        self.0.contains(&cap)
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Disposition for a syscall under a seccomp filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeccompAction {
    /// Permit the call.
    Allow,
    /// Fail the call with this errno.
    Errno(u16),
    /// Kill the calling thread.
    Kill,
    /// Deliver SIGSYS.
    Trap,
    /// Permit and log the call.
    Log,
}

/// One syscall rule: the resolved syscall number and its disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRule {
    /// Syscall number on the build architecture.
    pub nr: i64,
    /// Action taken when the workload invokes it.
    pub action: SeccompAction,
}

/// A resolved seccomp profile.
///
/// Syscall name resolution happens in the configuration loader; the engine
/// only ever sees numbers for the architecture it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompProfile {
    /// Action for syscalls matching no rule.
    pub default_action: SeccompAction,
    /// Per-syscall overrides.
    pub rules: Vec<SyscallRule>,
}

impl SeccompProfile {
    /// A profile that installs no filter at all.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            default_action: SeccompAction::Allow,
            rules: Vec::new(),
        }
    }

    /// Whether installing this profile would be a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default_action == SeccompAction::Allow
    }
}

impl Default for SeccompProfile {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// One lifecycle hook: an external program run by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Absolute path of the program to run.
    pub program: PathBuf,
    /// Arguments, not including the program name.
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Deadline in seconds; `None` uses the engine default.
    pub timeout_secs: Option<u64>,
}

impl HookSpec {
    /// A hook invoking `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout_secs: None,
        }
    }
}

/// Hooks grouped by lifecycle point.
///
/// Pre-start hooks must succeed; a failure aborts the bootstrap. Post-start
/// and post-stop failures are logged and otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSet {
    /// Run by the controller during bootstrap, before the root pivot.
    pub pre_start: Vec<HookSpec>,
    /// Run after the workload has been started.
    pub post_start: Vec<HookSpec>,
    /// Run after the container reached `Stopped` and is being destroyed.
    pub post_stop: Vec<HookSpec>,
}

/// The workload to exec and the credentials to assume for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Argument vector; `args[0]` is the program path.
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form; passed through verbatim.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// UID the workload runs as (namespace view when a user namespace
    /// exists).
    pub uid: u32,
    /// GID the workload runs as.
    pub gid: u32,
    /// Supplementary groups.
    pub extra_groups: Vec<u32>,
}

impl ProcessSpec {
    /// A root process with the given argv and an empty environment.
    #[must_use]
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: PathBuf::from("/"),
            uid: 0,
            gid: 0,
            extra_groups: Vec::new(),
        }
    }
}

/// The complete resolved specification for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Host path of the prepared root filesystem.
    pub rootfs: PathBuf,
    /// Hostname, applied when a UTS namespace is created.
    pub hostname: Option<String>,
    /// The workload process.
    pub process: ProcessSpec,
    /// Namespace directives.
    pub namespaces: Vec<NamespaceSpec>,
    /// UID mappings for a new user namespace.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for a new user namespace.
    pub gid_mappings: Vec<IdMapping>,
    /// Mounts applied after the root pivot, in order.
    pub mounts: Vec<MountSpec>,
    /// Capabilities the workload keeps.
    pub capabilities: CapabilitySet,
    /// Syscall filter installed last before exec.
    pub seccomp: SeccompProfile,
    /// Resource limits handed to the cgroup collaborator.
    pub limits: ResourceLimits,
    /// Lifecycle hooks.
    pub hooks: HookSet,
}

impl ContainerSpec {
    /// A minimal spec: the given rootfs and process, nothing else.
    #[must_use]
    pub fn new(rootfs: impl Into<PathBuf>, process: ProcessSpec) -> Self {
        Self {
            rootfs: rootfs.into(),
            hostname: None,
            process,
            namespaces: Vec::new(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            mounts: Vec::new(),
            capabilities: CapabilitySet::empty(),
            seccomp: SeccompProfile::allow_all(),
            limits: ResourceLimits::default(),
            hooks: HookSet::default(),
        }
    }
}
