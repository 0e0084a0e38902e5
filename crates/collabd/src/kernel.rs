//! Kernel handle abstraction.
//!
//! A [`Kernel`] accepts code, answers with a correlation id, and publishes
//! every event it produces on a broadcast channel tagged with the id of the
//! request that caused it. Consumers subscribe before submitting and keep
//! only events whose `parent_id` matches their own request.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::Output;

/// Events buffered per subscriber before it starts lagging.
pub const KERNEL_EVENT_CAPACITY: usize = 1024;

/// Kernel-reported execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelActivity {
    Starting,
    Busy,
    Idle,
}

/// Payload of a kernel event.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEventContent {
    Status(KernelActivity),
    /// The kernel accepted the request and assigned it an execution counter.
    ExecuteInput { execution_count: u32 },
    Output(Output),
}

/// A kernel event tagged with the correlation id of its originating request.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelEvent {
    /// Empty when the kernel emitted the event outside any request.
    pub parent_id: String,
    pub content: KernelEventContent,
}

impl KernelEvent {
    pub fn new(parent_id: impl Into<String>, content: KernelEventContent) -> Self {
        Self {
            parent_id: parent_id.into(),
            content,
        }
    }

    /// True for the idle status that closes out a request.
    pub fn is_idle(&self) -> bool {
        matches!(self.content, KernelEventContent::Status(KernelActivity::Idle))
    }
}

/// Completion candidates for the code around a cursor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
    pub metadata: Value,
}

/// An installed kernel a launcher can start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSpecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
    /// Directory holding the kernelspec.
    pub path: PathBuf,
}

/// A running kernel.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Submit code. Returns the request's correlation id.
    async fn execute(&self, code: &str) -> anyhow::Result<String>;

    /// Subscribe to the kernel's event stream.
    fn subscribe(&self) -> broadcast::Receiver<KernelEvent>;

    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Ask for completions of `code` at byte offset `cursor_pos`.
    async fn complete(&self, code: &str, cursor_pos: usize) -> anyhow::Result<Completion>;

    async fn is_alive(&self) -> bool;

    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Starts kernels for notebooks.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self, notebook_id: &str) -> anyhow::Result<Arc<dyn Kernel>>;

    /// Kernels this launcher knows how to start.
    async fn available_kernels(&self) -> Vec<KernelSpecInfo> {
        Vec::new()
    }
}
