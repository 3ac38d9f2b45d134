//! Unified error types for the Capstan workspace.
//!
//! The variants follow the engine's error taxonomy: configuration problems
//! are detected before any process exists, bootstrap and resource failures
//! abort a creation in progress, and protocol violations mean the controller
//! and the init process have diverged on process state. Workload failures
//! after exec are not errors of this system and have no variant here.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CapstanError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A container specification is invalid or unsatisfiable.
    ///
    /// Raised before any process is spawned; nothing needs cleaning up.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A bootstrap step failed inside or on behalf of the init process.
    ///
    /// Recovery is abort and tear down, never a retry of the step.
    #[error("bootstrap step {step} failed: {message}")]
    Bootstrap {
        /// Name of the failing bootstrap step.
        step: String,
        /// Description of the failure.
        message: String,
    },

    /// The cgroup collaborator failed to create, join, or apply limits.
    #[error("resource control failure: {message}")]
    Resource {
        /// Description of the failure.
        message: String,
    },

    /// An out-of-order, missing, or malformed handshake message.
    ///
    /// Always fatal to the creation attempt; the two ends no longer agree
    /// on process state.
    #[error("sync protocol violation: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// A lifecycle operation was requested in a state that forbids it.
    #[error("cannot {operation} container in state {current}")]
    State {
        /// The rejected operation.
        operation: &'static str,
        /// The container's current lifecycle state.
        current: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The requested mechanism is unavailable on this platform.
    #[error("unsupported on this platform: {operation}")]
    Unsupported {
        /// The operation that requires Linux.
        operation: &'static str,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CapstanError {
    /// Builds a [`CapstanError::Bootstrap`] for the named step.
    #[must_use]
    pub fn bootstrap(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bootstrap {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CapstanError>;
