//! Filesystem management for container isolation.
//!
//! Provides rootfs preparation, `pivot_root` for secure root filesystem
//! switching, and post-pivot application of user mount directives.

pub mod mount;
pub mod pivot_root;
