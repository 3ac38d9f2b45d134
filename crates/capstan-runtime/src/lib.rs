//! Container lifecycle management for the Capstan engine.
//!
//! This crate contains both sides of the container-creation handshake and
//! the lifecycle manager around them:
//! - **sync**: the typed synchronization channel between controller and
//!   init process.
//! - **init**: the linear bootstrap state machine the init process walks
//!   before exec.
//! - **process**: `clone(2)` spawning and the controller-side handshake
//!   driver.
//! - **state**: persisted per-container process records.
//! - **hooks**: external lifecycle hook invocation.
//! - **container** / **engine**: the lifecycle operations exposed to
//!   operators.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod hooks;
pub mod init;
pub mod process;
pub mod state;
pub mod sync;
