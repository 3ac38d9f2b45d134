//! # capstan-common
//!
//! Shared types, error definitions, and the resolved container specification
//! model used across the entire Capstan workspace.
//!
//! This crate is the leaf of the dependency graph — it depends on no other
//! internal crate and provides the foundational primitives that all other
//! crates build upon. Everything in it is a plain value object; the
//! kernel-facing mechanisms live in `capstan-core` and `capstan-runtime`.

pub mod constants;
pub mod error;
pub mod spec;
pub mod types;
