//! Error types for nxj.

use thiserror::Error;

/// Main error type for nxj.
#[derive(Error, Debug)]
pub enum NxjError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("received invalid command '{0}'")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("dependency cycle: {a} <-> {b}")]
    DependencyCycle {
        a: String,
        b: String,
        remaining: std::collections::BTreeSet<String>,
    },

    #[error("interrupted")]
    Interrupted,
}

/// Result type alias for nxj operations.
pub type Result<T> = std::result::Result<T, NxjError>;
