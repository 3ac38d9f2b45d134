//! # capstan-core
//!
//! Low-level Linux isolation primitives for the Capstan engine.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: plan resolution, `clone(2)` flag masks, and ordered
//!   `setns(2)` joins.
//! - **Cgroups**: a version-neutral driver interface with v1 and v2
//!   filesystem implementations.
//! - **Filesystem**: rootfs preparation, `pivot_root`, and post-pivot mount
//!   application.
//! - **Capabilities**: reduction of every capability set to the configured
//!   set during finalization.
//! - **Seccomp**: classic-BPF filter emission and installation.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod seccomp;
