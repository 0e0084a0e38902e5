//! Envelope types exchanged with participants.
//!
//! Inbound frames are validated into a closed [`ClientRequest`] enum at the
//! boundary. Outbound frames are [`Message`] envelopes: a fixed header
//! (`action`, `status`, `timestamp`, `execution_id`) plus action-specific
//! fields flattened next to it. Kernel output is carried as [`Output`],
//! serialized in nbformat shape.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::access::Capability;
use crate::ResourceKind;

/// Field the relay uses to tag a message with its originating instance.
pub const ORIGIN_FIELD: &str = "_source_instance";

/// Outcome marker carried by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// The logical envelope sent to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Assigned by the hub on broadcast when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Only ever set while a message travels over the pub/sub bus.
    #[serde(
        rename = "_source_instance",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: None,
            timestamp: None,
            execution_id: None,
            origin: None,
            payload: Map::new(),
        }
    }

    /// A successful response for `action`, stamped now.
    pub fn success(action: impl Into<String>) -> Self {
        Self::new(action).with_status(Status::Success).stamped()
    }

    /// An error envelope echoing the offending action.
    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(action)
            .with_status(Status::Error)
            .with("message", message.into())
            .stamped()
    }

    /// The container used to replay buffered messages to a joiner.
    pub fn history(messages: Vec<Message>) -> Self {
        Self::new("history")
            .with("messages", serde_json::to_value(messages).unwrap_or_default())
            .stamped()
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Set an action-specific field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    /// Read a string payload field.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(Status::Error)
    }

    /// `user_connected`/`user_disconnected` notices. They describe who is
    /// here right now and are never replayed to late joiners.
    pub fn is_presence(&self) -> bool {
        matches!(self.action.as_str(), "user_connected" | "user_disconnected")
    }
}

/// Why an inbound frame could not become a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid JSON message")]
    InvalidJson,
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },
}

impl RequestError {
    /// The action name to echo back in the error envelope.
    pub fn action(&self) -> &str {
        match self {
            RequestError::InvalidJson => "error",
            RequestError::UnknownAction(a) => a,
            RequestError::InvalidPayload { action, .. } => action,
        }
    }
}

fn default_presence() -> String {
    "active".to_string()
}

/// Every action a participant may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    // Workspace scope
    ChatMessage {
        content: String,
    },
    PresenceUpdate {
        #[serde(default = "default_presence")]
        status: String,
    },
    ActivityNotification {
        activity_type: String,
        #[serde(default)]
        activity_data: Value,
    },
    FileUpload {
        filename: String,
        /// Base64 encoded file body.
        content: String,
        #[serde(default)]
        description: String,
    },

    // Notebook scope
    CellUpdate {
        cell_id: String,
        source: String,
    },
    CursorPosition {
        cell_id: String,
        #[serde(default)]
        position: Value,
    },
    CodeExecute {
        cell_id: String,
        code: String,
    },
    InterruptExecution,
    CompleteCode {
        code: String,
        /// Byte offset of the cursor in `code`.
        cursor_pos: usize,
    },
    ExecutionStatus {
        execution_id: String,
        #[serde(default)]
        include_outputs: bool,
    },
}

const KNOWN_ACTIONS: &[&str] = &[
    "chat_message",
    "presence_update",
    "activity_notification",
    "file_upload",
    "cell_update",
    "cursor_position",
    "code_execute",
    "interrupt_execution",
    "complete_code",
    "execution_status",
];

impl ClientRequest {
    /// Validate a raw frame into a request.
    pub fn parse(data: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(data).map_err(|_| RequestError::InvalidJson)?;
        let action = value
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or_default()
            .to_string();
        if !KNOWN_ACTIONS.contains(&action.as_str()) {
            return Err(RequestError::UnknownAction(action));
        }
        serde_json::from_value(value).map_err(|e| RequestError::InvalidPayload {
            action,
            reason: e.to_string(),
        })
    }

    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::ChatMessage { .. } => "chat_message",
            ClientRequest::PresenceUpdate { .. } => "presence_update",
            ClientRequest::ActivityNotification { .. } => "activity_notification",
            ClientRequest::FileUpload { .. } => "file_upload",
            ClientRequest::CellUpdate { .. } => "cell_update",
            ClientRequest::CursorPosition { .. } => "cursor_position",
            ClientRequest::CodeExecute { .. } => "code_execute",
            ClientRequest::InterruptExecution => "interrupt_execution",
            ClientRequest::CompleteCode { .. } => "complete_code",
            ClientRequest::ExecutionStatus { .. } => "execution_status",
        }
    }

    /// Which kind of resource accepts this action.
    pub fn scope(&self) -> ResourceKind {
        match self {
            ClientRequest::ChatMessage { .. }
            | ClientRequest::PresenceUpdate { .. }
            | ClientRequest::ActivityNotification { .. }
            | ClientRequest::FileUpload { .. } => ResourceKind::Workspace,
            ClientRequest::CellUpdate { .. }
            | ClientRequest::CursorPosition { .. }
            | ClientRequest::CodeExecute { .. }
            | ClientRequest::InterruptExecution
            | ClientRequest::CompleteCode { .. }
            | ClientRequest::ExecutionStatus { .. } => ResourceKind::Notebook,
        }
    }

    /// Capability the sender must hold on the owning workspace.
    pub fn required_capability(&self) -> Capability {
        match self {
            ClientRequest::ChatMessage { .. }
            | ClientRequest::PresenceUpdate { .. }
            | ClientRequest::ActivityNotification { .. }
            | ClientRequest::CursorPosition { .. }
            | ClientRequest::CompleteCode { .. }
            | ClientRequest::ExecutionStatus { .. } => Capability::Read,
            ClientRequest::FileUpload { .. } | ClientRequest::CellUpdate { .. } => {
                Capability::Write
            }
            ClientRequest::CodeExecute { .. } | ClientRequest::InterruptExecution => {
                Capability::Execute
            }
        }
    }
}

/// One classified unit of kernel output, in nbformat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: String,
        text: String,
    },
    ExecuteResult {
        /// The kernel's own execution counter.
        execution_count: Option<u32>,
        data: Value,
    },
    DisplayData {
        data: Value,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    /// Synthetic output appended when an execution exceeds its bound.
    pub fn timeout(limit: Duration) -> Self {
        Output::Error {
            ename: "TimeoutError".to_string(),
            evalue: format!("Execution timed out after {} seconds", limit.as_secs()),
            traceback: Vec::new(),
        }
    }

    /// Synthetic output appended when a participant interrupts.
    pub fn interrupted() -> Self {
        Output::Error {
            ename: "Interrupted".to_string(),
            evalue: "Execution was interrupted".to_string(),
            traceback: Vec::new(),
        }
    }

    /// Error output describing a failure to talk to the kernel.
    pub fn kernel_failure(message: impl Into<String>) -> Self {
        Output::Error {
            ename: "KernelError".to_string(),
            evalue: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }
}
