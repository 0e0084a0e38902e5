//! Error taxonomy shared by the hub, dispatcher and kernel supervision.

use std::time::Duration;

/// Result alias used across the daemon.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors surfaced at the dispatch boundary.
///
/// Expected outcomes (denied permission, unknown cell, busy kernel) are
/// variants here and become `{status: "error"}` envelopes. `Other` carries
/// truly unexpected faults from lower layers.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Permission(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("Kernel for notebook {0} is busy")]
    KernelBusy(String),

    #[error("Kernel for notebook {0} is not responding")]
    KernelDead(String),

    /// A kernel request that did not answer in time, named by what was asked.
    #[error("{0} timed out after {} seconds", .1.as_secs())]
    Timeout(&'static str, Duration),

    #[error("Delivery failed: {0}")]
    Transport(String),

    #[error("Invalid message: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollabError {
    /// Shorthand for a missing notebook.
    pub fn notebook_not_found(id: impl Into<String>) -> Self {
        CollabError::NotFound("Notebook", id.into())
    }

    /// Shorthand for a missing cell.
    pub fn cell_not_found(id: impl Into<String>) -> Self {
        CollabError::NotFound("Cell", id.into())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        CollabError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Protocol(e.to_string())
    }
}
