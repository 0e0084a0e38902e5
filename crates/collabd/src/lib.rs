//! collabd - real-time collaboration daemon for shared workspaces and notebooks.
//!
//! Participants connect to a resource (a workspace feed or a notebook) and
//! exchange JSON envelopes with the daemon. The daemon fans every accepted
//! action out to the other participants of that resource, replays recent
//! history to late joiners, relays traffic to sibling instances over a
//! pub/sub bus, and supervises one Jupyter kernel per notebook so code
//! submitted by any participant executes against shared state.
//!
//! All connections use length-prefixed JSON framing with a handshake frame
//! that carries the resource and the bearer token (see `connection.rs`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod access;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod hub;
pub mod jupyter;
pub mod kernel;
pub mod kernel_manager;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod store;

pub use error::{CollabError, CollabResult};

// ============================================================================
// Paths
// ============================================================================

/// Get the base directory for daemon state.
///
/// `COLLABD_HOME` wins when set, otherwise `~/.cache/collabd/`.
pub fn daemon_base_dir() -> PathBuf {
    if let Ok(home) = std::env::var("COLLABD_HOME") {
        return PathBuf::from(home);
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("collabd")
}

/// Get the default directory for persisted notebook documents.
pub fn default_notebook_docs_dir() -> PathBuf {
    daemon_base_dir().join("notebooks")
}

/// Get the default directory for uploaded workspace files.
pub fn default_files_dir() -> PathBuf {
    daemon_base_dir().join("files")
}

// ============================================================================
// Types
// ============================================================================

/// The two kinds of resource a participant can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A workspace chat/file feed.
    Workspace,
    /// A computational notebook.
    Notebook,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Workspace => write!(f, "workspace"),
            ResourceKind::Notebook => write!(f, "notebook"),
        }
    }
}
