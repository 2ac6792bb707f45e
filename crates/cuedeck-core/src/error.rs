//! Error types for cuedeck-core
//!
//! Engine-level failures only. Failures that happen while a run executes
//! (bad configuration, handler errors) are data, not errors: they travel in
//! [`RunOutcome`](crate::run::RunOutcome) so queue history can serialize
//! them.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Named queue does not exist
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A queue with this name already exists
    #[error("queue already exists: {0}")]
    QueueExists(String),

    /// A handler is already registered under this (namespace, kind)
    #[error("duplicate handler: {namespace}:{kind}")]
    DuplicateHandler {
        /// Handler namespace
        namespace: String,
        /// Handler name within the namespace
        kind: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {field}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
