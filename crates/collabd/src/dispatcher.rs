//! Action dispatch for one inbound frame.
//!
//! Every frame is validated into a [`ClientRequest`], checked against the
//! owning workspace's permissions, and handled. The response goes straight
//! back to the sender; on success the same envelope is broadcast to the
//! other participants of the resource. Failures never leave the sender's
//! connection.

use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use log::{debug, error, warn};
use serde_json::Value;

use crate::access::PermissionCheck;
use crate::error::{CollabError, CollabResult};
use crate::execution::{ExecutionSupervisor, PendingExecution};
use crate::hub::{ConnectionHandle, Hub};
use crate::protocol::{ClientRequest, Message, RequestError, Status};
use crate::store::{CellPatch, DocumentStore, FileStore};
use crate::ResourceKind;

/// The sender of a frame and the resource their connection is bound to.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub kind: ResourceKind,
    pub resource_id: String,
    pub conn: ConnectionHandle,
}

/// What to do after a handler succeeds.
enum Outcome {
    /// Reply to the sender and broadcast the reply to everyone else.
    Broadcast(Message),
    /// Reply and broadcast, then start the claimed execution.
    Execute(Message, PendingExecution),
    /// Reply to the sender only.
    Reply(Message),
}

fn denied_message(request: &ClientRequest) -> &'static str {
    match request {
        ClientRequest::ChatMessage { .. } => "You don't have permission to send messages",
        ClientRequest::PresenceUpdate { .. } | ClientRequest::ActivityNotification { .. } => {
            "You don't have permission for this workspace"
        }
        ClientRequest::FileUpload { .. } => "You don't have permission to upload files",
        ClientRequest::CellUpdate { .. } => "You don't have permission to update cells",
        ClientRequest::CursorPosition { .. } => "You don't have permission to view this notebook",
        ClientRequest::CodeExecute { .. } => "You don't have permission to execute code",
        ClientRequest::InterruptExecution => "You don't have permission to interrupt execution",
        ClientRequest::CompleteCode { .. } => {
            "You don't have permission to use code completion in this notebook"
        }
        ClientRequest::ExecutionStatus { .. } => "You don't have permission to view this notebook",
    }
}

pub struct Dispatcher {
    hub: Arc<Hub>,
    store: Arc<dyn DocumentStore>,
    files: Arc<dyn FileStore>,
    permissions: Arc<dyn PermissionCheck>,
    executions: Arc<ExecutionSupervisor>,
}

impl Dispatcher {
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn DocumentStore>,
        files: Arc<dyn FileStore>,
        permissions: Arc<dyn PermissionCheck>,
        executions: Arc<ExecutionSupervisor>,
    ) -> Self {
        Self {
            hub,
            store,
            files,
            permissions,
            executions,
        }
    }

    /// Workspace that owns a resource. Notebooks are looked up in the
    /// document store; a workspace owns itself.
    pub async fn resolve_workspace(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> CollabResult<String> {
        match kind {
            ResourceKind::Workspace => Ok(resource_id.to_string()),
            ResourceKind::Notebook => Ok(self.store.get_notebook(resource_id).await?.workspace_id),
        }
    }

    /// Handle one raw frame from `who`. Returns the envelope sent back to
    /// the sender.
    pub async fn dispatch(&self, who: &Participant, frame: &[u8]) -> Message {
        let (action, result) = match ClientRequest::parse(frame) {
            Err(e) => {
                debug!("[dispatcher] Rejected frame from {}: {}", who.user_id, e);
                let reply = Message::error(e.action(), e.to_string());
                self.reply(who, &reply);
                return reply;
            }
            Ok(request) if request.scope() != who.kind => {
                let e = RequestError::UnknownAction(request.name().to_string());
                let reply = Message::error(e.action(), e.to_string());
                self.reply(who, &reply);
                return reply;
            }
            Ok(request) => {
                let action = request.name();
                (action, self.handle(who, request).await)
            }
        };

        match result {
            Ok(Outcome::Broadcast(reply)) => {
                self.reply(who, &reply);
                self.hub
                    .broadcast(&who.resource_id, reply.clone(), Some(who.conn.id()))
                    .await;
                reply
            }
            Ok(Outcome::Execute(reply, pending)) => {
                self.reply(who, &reply);
                self.hub
                    .broadcast(&who.resource_id, reply.clone(), Some(who.conn.id()))
                    .await;
                pending.spawn();
                reply
            }
            Ok(Outcome::Reply(reply)) => {
                self.reply(who, &reply);
                reply
            }
            Err(e) => {
                match &e {
                    CollabError::Other(inner) => error!(
                        "[dispatcher] {} from {} on {} failed: {:#}",
                        action, who.user_id, who.resource_id, inner
                    ),
                    _ => debug!(
                        "[dispatcher] {} from {} on {} refused: {}",
                        action, who.user_id, who.resource_id, e
                    ),
                }
                let reply = Message::error(action, e.to_string());
                self.reply(who, &reply);
                reply
            }
        }
    }

    fn reply(&self, who: &Participant, message: &Message) {
        if let Err(e) = who.conn.send_message(message) {
            warn!("[dispatcher] Failed to reply to {}: {}", who.user_id, e);
        }
    }

    async fn handle(&self, who: &Participant, request: ClientRequest) -> CollabResult<Outcome> {
        let workspace_id = self.resolve_workspace(who.kind, &who.resource_id).await?;
        let capability = request.required_capability();
        if !self
            .permissions
            .has_access(&workspace_id, &who.user_id, capability)
            .await
        {
            return Err(CollabError::Permission(denied_message(&request).to_string()));
        }

        let user = who.user_id.as_str();
        let reply = match request {
            ClientRequest::ChatMessage { content } => Message::success("chat_message")
                .with("content", content)
                .with("user_id", user)
                .with("message_id", uuid::Uuid::new_v4().to_string()),

            ClientRequest::PresenceUpdate { status } => Message::success("presence_update")
                .with("user_id", user)
                .with("presence_status", status),

            ClientRequest::ActivityNotification {
                activity_type,
                activity_data,
            } => Message::success("activity_notification")
                .with("user_id", user)
                .with("activity_type", activity_type)
                .with(
                    "activity_data",
                    if activity_data.is_null() {
                        Value::Object(Default::default())
                    } else {
                        activity_data
                    },
                ),

            ClientRequest::FileUpload {
                filename,
                content,
                description,
            } => {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(content.as_bytes())
                    .map_err(|e| CollabError::Protocol(format!("invalid file content: {}", e)))?;
                let info = self
                    .files
                    .upload(&workspace_id, user, &filename, &description, Bytes::from(data))
                    .await?;
                Message::success("file_uploaded")
                    .with("file_info", serde_json::to_value(info)?)
                    .with("user_id", user)
            }

            ClientRequest::CellUpdate { cell_id, source } => {
                self.store
                    .update_cell(&who.resource_id, &cell_id, CellPatch::Source(source))
                    .await?;
                Message::success("cell_updated")
                    .with("cell_id", cell_id)
                    .with("user_id", user)
            }

            ClientRequest::CursorPosition { cell_id, position } => {
                Message::success("cursor_position")
                    .with("cell_id", cell_id)
                    .with("position", position)
                    .with("user_id", user)
            }

            ClientRequest::CodeExecute { cell_id, code } => {
                let pending = self
                    .executions
                    .prepare(&who.resource_id, &cell_id, &code)
                    .await?;
                let reply = Message::success("code_executing")
                    .with_execution_id(pending.execution_id())
                    .with("cell_id", cell_id)
                    .with("user_id", user);
                return Ok(Outcome::Execute(reply, pending));
            }

            ClientRequest::InterruptExecution => {
                let interrupted = self.executions.interrupt(&who.resource_id).await;
                let mut reply = Message::new("execution_interrupted")
                    .with_status(if interrupted {
                        Status::Success
                    } else {
                        Status::Error
                    })
                    .with("user_id", user)
                    .stamped();
                if !interrupted {
                    reply = reply.with("message", "No execution in progress");
                }
                reply
            }

            ClientRequest::CompleteCode { code, cursor_pos } => {
                let reply = Message::success("code_completion").with("user_id", user);
                let reply = match self
                    .executions
                    .complete(&who.resource_id, &code, cursor_pos)
                    .await
                {
                    Ok(completion) => reply
                        .with("matches", completion.matches)
                        .with("cursor_start", completion.cursor_start)
                        .with("cursor_end", completion.cursor_end)
                        .with("metadata", completion.metadata)
                        .with("completion_status", "ok"),
                    Err(e @ CollabError::NotFound(..)) => return Err(e),
                    // Kernel trouble degrades to an empty completion
                    Err(e) => {
                        debug!(
                            "[dispatcher] Completion on {} failed: {}",
                            who.resource_id, e
                        );
                        reply
                            .with("matches", Vec::<String>::new())
                            .with("cursor_start", cursor_pos)
                            .with("cursor_end", cursor_pos)
                            .with("metadata", Value::Object(Default::default()))
                            .with("completion_status", "error")
                            .with("error", e.to_string())
                    }
                };
                return Ok(Outcome::Reply(reply));
            }

            ClientRequest::ExecutionStatus {
                execution_id,
                include_outputs,
            } => {
                let record = self
                    .executions
                    .execution(&execution_id)
                    .filter(|record| record.notebook_id == who.resource_id)
                    .ok_or(CollabError::NotFound("Execution", execution_id))?;
                return Ok(Outcome::Reply(record.to_message(include_outputs)));
            }
        };

        Ok(Outcome::Broadcast(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Role, RoleGrants};
    use crate::kernel::testing::ScriptedLauncher;
    use crate::kernel_manager::KernelSessionManager;
    use crate::store::{Cell, FsFileStore, MemoryStore, Notebook};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        hub: Arc<Hub>,
        store: Arc<MemoryStore>,
        dispatcher: Dispatcher,
        _files: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let hub = Arc::new(Hub::new("inst", 10, None));
        let store = Arc::new(MemoryStore::new());
        store.insert(Notebook::new("nb1", "ws1").with_cell(Cell::code("c1", "")));

        let mut grants = RoleGrants::default();
        grants.grant("ws1", "owner", Role::Owner);
        grants.grant("ws1", "viewer", Role::Viewer);

        let files_dir = tempfile::TempDir::new().unwrap();
        let files = Arc::new(FsFileStore::new(files_dir.path(), 1024));
        let kernels = Arc::new(KernelSessionManager::new(
            Arc::new(ScriptedLauncher::new()),
            Duration::from_secs(60),
        ));
        let executions = Arc::new(ExecutionSupervisor::new(
            kernels,
            store.clone(),
            hub.clone(),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(
            hub.clone(),
            store.clone(),
            files,
            Arc::new(grants),
            executions,
        );
        Fixture {
            hub,
            store,
            dispatcher,
            _files: files_dir,
        }
    }

    fn join(
        f: &Fixture,
        user: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> (Participant, mpsc::Receiver<Bytes>) {
        let (conn, rx) = ConnectionHandle::channel(user);
        f.hub.register(resource_id, conn.clone());
        (
            Participant {
                user_id: user.to_string(),
                kind,
                resource_id: resource_id.to_string(),
                conn,
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_slice(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_chat_replies_and_broadcasts() {
        let f = fixture();
        let (owner, mut owner_rx) = join(&f, "owner", ResourceKind::Workspace, "ws1");
        let (_viewer, mut viewer_rx) = join(&f, "viewer", ResourceKind::Workspace, "ws1");

        let reply = f
            .dispatcher
            .dispatch(&owner, br#"{"action":"chat_message","content":"hello"}"#)
            .await;
        assert_eq!(reply.action, "chat_message");
        assert_eq!(reply.status, Some(Status::Success));
        assert!(reply.field_str("message_id").is_some());

        let sent = drain(&mut owner_rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].field_str("user_id"), Some("owner"));

        let seen = drain(&mut viewer_rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].field_str("content"), Some("hello"));
    }

    #[tokio::test]
    async fn test_permission_denied_is_private() {
        let f = fixture();
        let (viewer, mut viewer_rx) = join(&f, "viewer", ResourceKind::Notebook, "nb1");
        let (_owner, mut owner_rx) = join(&f, "owner", ResourceKind::Notebook, "nb1");

        let reply = f
            .dispatcher
            .dispatch(
                &viewer,
                br#"{"action":"cell_update","cell_id":"c1","source":"x = 1"}"#,
            )
            .await;
        assert!(reply.is_error());
        assert_eq!(reply.action, "cell_update");
        assert_eq!(
            reply.field_str("message"),
            Some("You don't have permission to update cells")
        );
        assert_eq!(drain(&mut viewer_rx).len(), 1);
        assert!(drain(&mut owner_rx).is_empty());
        assert!(f.hub.history("nb1").is_empty());

        // Cursor only needs READ
        let reply = f
            .dispatcher
            .dispatch(
                &viewer,
                br#"{"action":"cursor_position","cell_id":"c1","position":{"line":1}}"#,
            )
            .await;
        assert!(!reply.is_error());
        assert_eq!(drain(&mut owner_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_cell_update_persists() {
        let f = fixture();
        let (owner, _rx) = join(&f, "owner", ResourceKind::Notebook, "nb1");

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"cell_update","cell_id":"c1","source":"y = 2"}"#,
            )
            .await;
        assert_eq!(reply.action, "cell_updated");
        let nb = f.store.get_notebook("nb1").await.unwrap();
        assert_eq!(nb.cell("c1").unwrap().source, "y = 2");

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"cell_update","cell_id":"ghost","source":""}"#,
            )
            .await;
        assert!(reply.is_error());
        assert_eq!(reply.field_str("message"), Some("Cell not found: ghost"));
    }

    #[tokio::test]
    async fn test_bad_frames() {
        let f = fixture();
        let (owner, _rx) = join(&f, "owner", ResourceKind::Workspace, "ws1");

        let reply = f.dispatcher.dispatch(&owner, b"{oops").await;
        assert_eq!(reply.field_str("message"), Some("Invalid JSON message"));

        let reply = f
            .dispatcher
            .dispatch(&owner, br#"{"action":"self_destruct"}"#)
            .await;
        assert_eq!(reply.field_str("message"), Some("Unknown action: self_destruct"));

        // Notebook actions are unknown on a workspace connection
        let reply = f
            .dispatcher
            .dispatch(&owner, br#"{"action":"interrupt_execution"}"#)
            .await;
        assert_eq!(
            reply.field_str("message"),
            Some("Unknown action: interrupt_execution")
        );
    }

    #[tokio::test]
    async fn test_file_upload() {
        let f = fixture();
        let (owner, _rx) = join(&f, "owner", ResourceKind::Workspace, "ws1");

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"file_upload","filename":"a.txt","content":"aGVsbG8="}"#,
            )
            .await;
        assert_eq!(reply.action, "file_uploaded");
        assert_eq!(reply.payload["file_info"]["size"], 5);

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"file_upload","filename":"a.txt","content":"!!not base64!!"}"#,
            )
            .await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_presence_defaults_to_active() {
        let f = fixture();
        let (owner, _rx) = join(&f, "owner", ResourceKind::Workspace, "ws1");
        let reply = f
            .dispatcher
            .dispatch(&owner, br#"{"action":"presence_update"}"#)
            .await;
        assert_eq!(reply.field_str("presence_status"), Some("active"));
    }

    #[tokio::test]
    async fn test_code_execute_acks_before_result() {
        let f = fixture();
        let (owner, mut owner_rx) = join(&f, "owner", ResourceKind::Notebook, "nb1");

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"code_execute","cell_id":"c1","code":"print(2+2)"}"#,
            )
            .await;
        assert_eq!(reply.action, "code_executing");
        let execution_id = reply.execution_id.clone().unwrap();

        let first = owner_rx.recv().await.unwrap();
        let first: Message = serde_json::from_slice(&first).unwrap();
        assert_eq!(first.action, "code_executing");

        let done = tokio::time::timeout(Duration::from_secs(2), owner_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let done: Message = serde_json::from_slice(&done).unwrap();
        assert_eq!(done.action, "cell_updated");
        assert_eq!(done.execution_id.as_deref(), Some(execution_id.as_str()));
        assert_eq!(done.payload["outputs"][0]["text"], "4\n");
    }

    #[tokio::test]
    async fn test_interrupt_with_nothing_running() {
        let f = fixture();
        let (owner, _rx) = join(&f, "owner", ResourceKind::Notebook, "nb1");
        let reply = f
            .dispatcher
            .dispatch(&owner, br#"{"action":"interrupt_execution"}"#)
            .await;
        assert_eq!(reply.action, "execution_interrupted");
        assert_eq!(reply.status, Some(Status::Error));
    }

    #[tokio::test]
    async fn test_missing_notebook() {
        let f = fixture();
        let (owner, _rx) = join(&f, "owner", ResourceKind::Notebook, "gone");
        let reply = f
            .dispatcher
            .dispatch(&owner, br#"{"action":"cursor_position","cell_id":"c1"}"#)
            .await;
        assert_eq!(reply.field_str("message"), Some("Notebook not found: gone"));
    }

    #[tokio::test]
    async fn test_complete_code_replies_to_sender_only() {
        let f = fixture();
        let (viewer, mut viewer_rx) = join(&f, "viewer", ResourceKind::Notebook, "nb1");
        let (_owner, mut owner_rx) = join(&f, "owner", ResourceKind::Notebook, "nb1");

        let reply = f
            .dispatcher
            .dispatch(
                &viewer,
                br#"{"action":"complete_code","code":"pri","cursor_pos":3}"#,
            )
            .await;
        assert_eq!(reply.action, "code_completion");
        assert_eq!(reply.status, Some(Status::Success));
        assert_eq!(reply.field_str("completion_status"), Some("ok"));
        assert_eq!(reply.payload["matches"][0], "print");
        assert_eq!(reply.payload["cursor_start"], 0);
        assert_eq!(reply.payload["cursor_end"], 3);

        assert_eq!(drain(&mut viewer_rx).len(), 1);
        assert!(drain(&mut owner_rx).is_empty());
        assert!(f.hub.history("nb1").is_empty());
    }

    #[tokio::test]
    async fn test_complete_code_needs_read() {
        let f = fixture();
        let (stranger, _rx) = join(&f, "stranger", ResourceKind::Notebook, "nb1");
        let reply = f
            .dispatcher
            .dispatch(
                &stranger,
                br#"{"action":"complete_code","code":"pri","cursor_pos":3}"#,
            )
            .await;
        assert!(reply.is_error());
        assert_eq!(
            reply.field_str("message"),
            Some("You don't have permission to use code completion in this notebook")
        );
    }

    #[tokio::test]
    async fn test_execution_status_lookup() {
        let f = fixture();
        let (owner, mut owner_rx) = join(&f, "owner", ResourceKind::Notebook, "nb1");

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"code_execute","cell_id":"c1","code":"print(2+2)"}"#,
            )
            .await;
        let execution_id = reply.execution_id.clone().unwrap();
        // code_executing, then cell_updated
        owner_rx.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), owner_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let request = serde_json::json!({
            "action": "execution_status",
            "execution_id": execution_id,
            "include_outputs": true,
        });
        let reply = f
            .dispatcher
            .dispatch(&owner, request.to_string().as_bytes())
            .await;
        assert_eq!(reply.action, "execution_status");
        assert_eq!(reply.execution_id.as_deref(), Some(execution_id.as_str()));
        assert_eq!(reply.payload["is_completed"], true);
        assert_eq!(reply.payload["execution_status"], "success");
        assert_eq!(reply.payload["outputs"][0]["text"], "4\n");

        let reply = f
            .dispatcher
            .dispatch(
                &owner,
                br#"{"action":"execution_status","execution_id":"nope"}"#,
            )
            .await;
        assert!(reply.is_error());
        assert_eq!(reply.field_str("message"), Some("Execution not found: nope"));
    }
}
