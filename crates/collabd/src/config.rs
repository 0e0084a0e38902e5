//! Daemon configuration.
//!
//! Every knob has a default so an empty (or absent) config file is valid.
//! The binary layers CLI flags on top of whatever the file provides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::access::Role;
use crate::{default_files_dir, default_notebook_docs_dir};

/// Configuration for the collaboration daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: String,
    /// Identity of this instance on the pub/sub bus.
    pub instance_id: String,
    /// Messages kept per resource for late joiners.
    pub history_limit: usize,
    /// Upper bound on a single code execution.
    pub execution_timeout_secs: u64,
    /// Upper bound on waiting for a kernel's completion reply.
    pub completion_timeout_secs: u64,
    /// Idle time after which a kernel is reaped.
    pub kernel_idle_timeout_secs: u64,
    /// How often the reaper runs.
    pub reaper_interval_secs: u64,
    /// Upper bound on a single relay wait, so cancellation is observed promptly.
    pub relay_poll_interval_ms: u64,
    /// Kernelspec name launched for notebooks.
    pub kernel_name: String,
    /// Where notebook documents are persisted.
    pub docs_dir: PathBuf,
    /// Where uploaded workspace files land.
    pub files_dir: PathBuf,
    /// Largest accepted upload, after base64 decoding.
    pub max_upload_bytes: usize,
    /// Bearer token -> user id.
    pub tokens: HashMap<String, String>,
    /// Workspace id -> user id -> role.
    pub grants: HashMap<String, HashMap<String, Role>>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8002".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            history_limit: 100,
            execution_timeout_secs: 300,
            completion_timeout_secs: 10,
            kernel_idle_timeout_secs: 3600, // 1 hour
            reaper_interval_secs: 60,
            relay_poll_interval_ms: 100,
            kernel_name: "python3".to_string(),
            docs_dir: default_notebook_docs_dir(),
            files_dir: default_files_dir(),
            max_upload_bytes: 50 * 1024 * 1024,
            tokens: HashMap::new(),
            grants: HashMap::new(),
        }
    }
}

impl CollabConfig {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {:?}", path))?;
        Ok(config)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs.max(1))
    }

    pub fn kernel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.kernel_idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms.max(1))
    }
}
