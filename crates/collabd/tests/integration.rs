//! Integration tests for the collabd server and client.
//!
//! These tests run real servers on ephemeral ports and drive them through
//! `CollabClient`, with an in-process kernel standing in for Jupyter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use collabd::access::{Role, RoleGrants, StaticTokens};
use collabd::client::{ClientError, CollabClient};
use collabd::config::CollabConfig;
use collabd::kernel::{
    Completion, Kernel, KernelActivity, KernelEvent, KernelEventContent, KernelLauncher,
    KERNEL_EVENT_CAPACITY,
};
use collabd::protocol::{ClientRequest, Message, Output, Status};
use collabd::relay::{MemoryBus, PubSubBus};
use collabd::server::{Collaborators, Server};
use collabd::store::{Cell, DocumentStore, FsFileStore, FsStore, Notebook};
use collabd::ResourceKind;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Kernel that prints "4" for `print(2+2)` and blocks on `hang` until
/// interrupted.
struct EchoKernel {
    events: broadcast::Sender<KernelEvent>,
    counter: AtomicU32,
    interrupt: Arc<Notify>,
}

impl EchoKernel {
    fn new() -> Self {
        let (events, _) = broadcast::channel(KERNEL_EVENT_CAPACITY);
        Self {
            events,
            counter: AtomicU32::new(0),
            interrupt: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Kernel for EchoKernel {
    async fn execute(&self, code: &str) -> anyhow::Result<String> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        let interrupt = self.interrupt.clone();
        let code = code.to_string();
        let id = msg_id.clone();

        tokio::spawn(async move {
            let send = |content| {
                let _ = events.send(KernelEvent::new(id.clone(), content));
            };
            send(KernelEventContent::Status(KernelActivity::Busy));
            send(KernelEventContent::ExecuteInput {
                execution_count: count,
            });
            match code.as_str() {
                "print(2+2)" => send(KernelEventContent::Output(Output::Stream {
                    name: "stdout".into(),
                    text: "4\n".into(),
                })),
                "hang" => interrupt.notified().await,
                _ => {}
            }
            send(KernelEventContent::Status(KernelActivity::Idle));
        });

        Ok(msg_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn complete(&self, code: &str, cursor_pos: usize) -> anyhow::Result<Completion> {
        let before = code.get(..cursor_pos).unwrap_or(code);
        let start = before
            .rfind(|c: char| !c.is_alphanumeric() && c != '_')
            .map_or(0, |i| i + 1);
        let token = &before[start..];
        let matches = ["print", "property"]
            .into_iter()
            .filter(|word| !token.is_empty() && word.starts_with(token))
            .map(String::from)
            .collect();
        Ok(Completion {
            matches,
            cursor_start: start,
            cursor_end: cursor_pos,
            metadata: serde_json::json!({}),
        })
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        self.interrupt.notify_one();
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.interrupt.notify_one();
        Ok(())
    }
}

/// Launches echo kernels. A notebook listed in `held` waits for its gate
/// before its kernel comes up.
#[derive(Default)]
struct EchoLauncher {
    held: HashMap<String, Arc<Notify>>,
}

#[async_trait]
impl KernelLauncher for EchoLauncher {
    async fn launch(&self, notebook_id: &str) -> anyhow::Result<Arc<dyn Kernel>> {
        if let Some(gate) = self.held.get(notebook_id) {
            gate.notified().await;
        }
        Ok(Arc::new(EchoKernel::new()))
    }
}

/// A running test server.
struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    store: Arc<FsStore>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(WAIT, self.handle).await;
    }
}

/// Create a test configuration rooted in `temp_dir`.
fn test_config(temp_dir: &TempDir) -> CollabConfig {
    CollabConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        docs_dir: temp_dir.path().join("notebooks"),
        files_dir: temp_dir.path().join("files"),
        execution_timeout_secs: 5,
        relay_poll_interval_ms: 20,
        tokens: HashMap::from([
            ("t-alice".to_string(), "alice".to_string()),
            ("t-bob".to_string(), "bob".to_string()),
            ("t-eve".to_string(), "eve".to_string()),
        ]),
        grants: HashMap::from([(
            "ws1".to_string(),
            HashMap::from([
                ("alice".to_string(), Role::Owner),
                ("bob".to_string(), Role::Editor),
                ("eve".to_string(), Role::Viewer),
            ]),
        )]),
        ..Default::default()
    }
}

async fn start_server(temp_dir: &TempDir, bus: Option<MemoryBus>) -> TestServer {
    start_server_with(temp_dir, bus, EchoLauncher::default()).await
}

async fn start_server_with(
    temp_dir: &TempDir,
    bus: Option<MemoryBus>,
    launcher: EchoLauncher,
) -> TestServer {
    let config = test_config(temp_dir);
    let store = Arc::new(FsStore::new(&config.docs_dir));
    for notebook_id in ["nb1", "nb2"] {
        store
            .save_notebook(
                &Notebook::new(notebook_id, "ws1").with_cell(Cell::code("c1", "print(2+2)")),
            )
            .await
            .unwrap();
    }

    let collaborators = Collaborators {
        store: store.clone(),
        files: Arc::new(FsFileStore::new(&config.files_dir, config.max_upload_bytes)),
        permissions: Arc::new(RoleGrants::new(config.grants.clone())),
        auth: Arc::new(StaticTokens::new(config.tokens.clone())),
        bus: bus.map(|b| Arc::new(b) as Arc<dyn PubSubBus>),
        launcher: Arc::new(launcher),
    };
    let server = Server::new(config, collaborators);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server.clone().serve(listener));

    TestServer {
        server,
        addr,
        store,
        handle,
    }
}

async fn join(
    server: &TestServer,
    kind: ResourceKind,
    id: &str,
    token: &str,
) -> CollabClient {
    CollabClient::connect(server.addr, kind, id, token)
        .await
        .unwrap()
}

/// Poll until the hub has `count` connections on `resource_id`.
async fn wait_for_connections(server: &Server, resource_id: &str, count: usize) {
    let start = std::time::Instant::now();
    while server.hub().connection_count(resource_id) != count {
        assert!(start.elapsed() < WAIT, "timed out waiting for {} connections", count);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_chat_history_and_execution() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    // A joins the workspace and chats
    let mut alice = join(&server, ResourceKind::Workspace, "ws1", "t-alice").await;
    assert_eq!(alice.ack().field_str("user_id"), Some("alice"));
    assert_eq!(alice.ack().field_str("workspace_id"), Some("ws1"));

    alice.chat("hello").await.unwrap();
    let reply = alice.recv_action("chat_message", WAIT).await.unwrap();
    assert_eq!(reply.status, Some(Status::Success));
    assert_eq!(reply.field_str("content"), Some("hello"));
    assert_eq!(reply.field_str("user_id"), Some("alice"));
    assert!(reply.field_str("message_id").is_some());

    // B joins and sees only the chat in history, not A's arrival
    let mut bob = join(&server, ResourceKind::Workspace, "ws1", "t-bob").await;
    let history = bob.recv_timeout(WAIT).await.unwrap();
    assert_eq!(history.action, "history");
    let messages: Vec<Message> =
        serde_json::from_value(history.payload["messages"].clone()).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].action, "chat_message");
    assert_eq!(messages[0].field_str("content"), Some("hello"));

    // A learns that B arrived
    let connected = alice.recv_action("user_connected", WAIT).await.unwrap();
    assert_eq!(connected.field_str("user_id"), Some("bob"));

    // A runs a cell in the notebook
    let mut nb = join(&server, ResourceKind::Notebook, "nb1", "t-alice").await;
    assert_eq!(nb.ack().field_str("workspace_id"), Some("ws1"));
    nb.execute("c1", "print(2+2)").await.unwrap();

    let executing = nb.recv_action("code_executing", WAIT).await.unwrap();
    assert_eq!(executing.status, Some(Status::Success));
    let execution_id = executing.execution_id.clone().unwrap();

    let updated = nb.recv_action("cell_updated", WAIT).await.unwrap();
    assert_eq!(updated.execution_id.as_deref(), Some(execution_id.as_str()));
    assert_eq!(updated.field_str("cell_id"), Some("c1"));
    assert_eq!(updated.field_str("execution_status"), Some("success"));
    assert_eq!(updated.payload["outputs"][0]["output_type"], "stream");
    assert_eq!(updated.payload["outputs"][0]["text"], "4\n");
    assert_eq!(updated.payload["execution_count"], 1);

    // Outputs are persisted on the cell
    let notebook = server.store.get_notebook("nb1").await.unwrap();
    let cell = notebook.cell("c1").unwrap();
    assert_eq!(cell.execution_count, Some(1));
    assert_eq!(
        cell.outputs,
        vec![Output::Stream {
            name: "stdout".into(),
            text: "4\n".into(),
        }]
    );

    // Nothing is running any more
    nb.interrupt().await.unwrap();
    let interrupted = nb.recv_action("execution_interrupted", WAIT).await.unwrap();
    assert_eq!(interrupted.status, Some(Status::Error));
    assert_eq!(
        interrupted.field_str("message"),
        Some("No execution in progress")
    );

    server.stop().await;
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let result = CollabClient::connect(server.addr, ResourceKind::Workspace, "ws1", "bogus").await;
    match result {
        Err(ClientError::Rejected { code, .. }) => assert_eq!(code, 1008),
        Err(e) => panic!("expected rejection, got {}", e),
        Ok(_) => panic!("expected rejection, got a connection"),
    }
    assert_eq!(server.server.hub().connection_count("ws1"), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_notebook_and_foreign_workspace_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let missing = CollabClient::connect(server.addr, ResourceKind::Notebook, "nope", "t-alice").await;
    assert!(matches!(missing, Err(ClientError::Rejected { code: 1008, .. })));

    let foreign = CollabClient::connect(server.addr, ResourceKind::Workspace, "ws2", "t-alice").await;
    match foreign {
        Err(ClientError::Rejected { message, .. }) => {
            assert_eq!(message, "You don't have access to this workspace")
        }
        _ => panic!("expected rejection"),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_viewer_cannot_execute() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let mut eve = join(&server, ResourceKind::Notebook, "nb1", "t-eve").await;
    eve.execute("c1", "print(2+2)").await.unwrap();
    let reply = eve.recv_action("code_execute", WAIT).await.unwrap();
    assert_eq!(reply.status, Some(Status::Error));
    assert_eq!(
        reply.field_str("message"),
        Some("You don't have permission to execute code")
    );
    assert!(server.server.kernels().get("nb1").await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_frames_get_error_replies() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let mut alice = join(&server, ResourceKind::Workspace, "ws1", "t-alice").await;

    alice.send_raw(b"not json").await.unwrap();
    let reply = alice.recv_timeout(WAIT).await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.field_str("message"), Some("Invalid JSON message"));

    // Notebook actions are unknown on a workspace connection
    alice.execute("c1", "print(2+2)").await.unwrap();
    let reply = alice.recv_timeout(WAIT).await.unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.action, "code_execute");

    // The connection survives bad frames
    alice.chat("still here").await.unwrap();
    let reply = alice.recv_action("chat_message", WAIT).await.unwrap();
    assert_eq!(reply.status, Some(Status::Success));

    server.stop().await;
}

#[tokio::test]
async fn test_interrupt_running_execution() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let mut alice = join(&server, ResourceKind::Notebook, "nb1", "t-alice").await;
    let mut bob = join(&server, ResourceKind::Notebook, "nb1", "t-bob").await;

    alice.execute("c1", "hang").await.unwrap();
    let executing = alice.recv_action("code_executing", WAIT).await.unwrap();
    let execution_id = executing.execution_id.unwrap();

    // Others see the execution start, and may stop it
    let seen = bob.recv_action("code_executing", WAIT).await.unwrap();
    assert_eq!(seen.execution_id.as_deref(), Some(execution_id.as_str()));

    // A second run is refused while the kernel is busy
    alice.execute("c1", "print(2+2)").await.unwrap();
    let busy = alice.recv_action("code_execute", WAIT).await.unwrap();
    assert!(busy.is_error());

    bob.interrupt().await.unwrap();
    let interrupted = bob.recv_action("execution_interrupted", WAIT).await.unwrap();
    assert_eq!(interrupted.status, Some(Status::Success));

    let updated = alice.recv_action("cell_updated", WAIT).await.unwrap();
    assert_eq!(updated.execution_id.as_deref(), Some(execution_id.as_str()));
    assert_eq!(updated.field_str("execution_status"), Some("interrupted"));

    server.stop().await;
}

#[tokio::test]
async fn test_file_upload_is_broadcast() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let mut alice = join(&server, ResourceKind::Workspace, "ws1", "t-alice").await;
    let mut bob = join(&server, ResourceKind::Workspace, "ws1", "t-bob").await;

    let content = base64::engine::general_purpose::STANDARD.encode(b"a,b\n1,2\n");
    alice
        .send(&ClientRequest::FileUpload {
            filename: "data.csv".to_string(),
            content,
            description: "numbers".to_string(),
        })
        .await
        .unwrap();

    let reply = alice.recv_action("file_uploaded", WAIT).await.unwrap();
    assert_eq!(reply.status, Some(Status::Success));
    assert_eq!(reply.payload["file_info"]["filename"], "data.csv");
    assert_eq!(reply.payload["file_info"]["size"], 8);

    let seen = bob.recv_action("file_uploaded", WAIT).await.unwrap();
    assert_eq!(seen.field_str("user_id"), Some("alice"));

    server.stop().await;
}

#[tokio::test]
async fn test_user_disconnected_after_last_connection() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let mut alice = join(&server, ResourceKind::Workspace, "ws1", "t-alice").await;
    let bob_first = join(&server, ResourceKind::Workspace, "ws1", "t-bob").await;
    let bob_second = join(&server, ResourceKind::Workspace, "ws1", "t-bob").await;
    wait_for_connections(&server.server, "ws1", 3).await;

    // Closing one of two tabs is not a departure
    bob_first.close().await.unwrap();
    wait_for_connections(&server.server, "ws1", 2).await;

    bob_second.close().await.unwrap();
    let left = alice.recv_action("user_disconnected", WAIT).await.unwrap();
    assert_eq!(left.field_str("user_id"), Some("bob"));
    wait_for_connections(&server.server, "ws1", 1).await;

    let users = server.server.hub().active_users("ws1");
    assert_eq!(users.len(), 1);
    assert!(users.contains("alice"));

    server.stop().await;
}

#[tokio::test]
async fn test_relay_between_instances() {
    let bus = MemoryBus::new();
    let dir_one = TempDir::new().unwrap();
    let dir_two = TempDir::new().unwrap();
    let one = start_server(&dir_one, Some(bus.clone())).await;
    let two = start_server(&dir_two, Some(bus.clone())).await;

    let mut bob = join(&two, ResourceKind::Workspace, "ws1", "t-bob").await;
    wait_for_connections(&two.server, "ws1", 1).await;

    let mut alice = join(&one, ResourceKind::Workspace, "ws1", "t-alice").await;
    let connected = bob.recv_action("user_connected", WAIT).await.unwrap();
    assert_eq!(connected.field_str("user_id"), Some("alice"));

    alice.chat("hello from one").await.unwrap();
    let relayed = bob.recv_action("chat_message", WAIT).await.unwrap();
    assert_eq!(relayed.field_str("content"), Some("hello from one"));
    assert_eq!(relayed.field_str("user_id"), Some("alice"));

    // Messages published by an instance are not delivered back to it twice
    let own = alice.recv_action("chat_message", WAIT).await.unwrap();
    assert_eq!(own.field_str("content"), Some("hello from one"));
    assert!(matches!(
        alice.recv_timeout(Duration::from_millis(200)).await,
        Err(ClientError::Timeout)
    ));
    assert_eq!(one.server.relay().unwrap().active_subscriptions(), 1);
    assert_eq!(two.server.relay().unwrap().active_subscriptions(), 1);

    // The subscription goes away with the last local connection
    alice.close().await.unwrap();
    bob.close().await.unwrap();
    for instance in [&one, &two] {
        let relay = instance.server.relay().unwrap();
        let start = std::time::Instant::now();
        while relay.active_subscriptions() != 0 {
            assert!(start.elapsed() < WAIT, "subscription outlived its connections");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    one.stop().await;
    two.stop().await;
}

#[tokio::test]
async fn test_completion_and_execution_status() {
    let temp_dir = TempDir::new().unwrap();
    let server = start_server(&temp_dir, None).await;

    let mut alice = join(&server, ResourceKind::Notebook, "nb1", "t-alice").await;
    let mut eve = join(&server, ResourceKind::Notebook, "nb1", "t-eve").await;

    // Viewers may complete; the reply goes to the asker alone
    eve.send(&ClientRequest::CompleteCode {
        code: "x = pr".to_string(),
        cursor_pos: 6,
    })
    .await
    .unwrap();
    let completion = eve.recv_action("code_completion", WAIT).await.unwrap();
    assert_eq!(completion.status, Some(Status::Success));
    assert_eq!(completion.field_str("completion_status"), Some("ok"));
    assert_eq!(completion.payload["matches"], serde_json::json!(["print", "property"]));
    assert_eq!(completion.payload["cursor_start"], 4);
    assert_eq!(completion.payload["cursor_end"], 6);

    alice.execute("c1", "print(2+2)").await.unwrap();
    let executing = alice.recv_action("code_executing", WAIT).await.unwrap();
    let execution_id = executing.execution_id.unwrap();
    alice.recv_action("cell_updated", WAIT).await.unwrap();

    eve.send(&ClientRequest::ExecutionStatus {
        execution_id: execution_id.clone(),
        include_outputs: true,
    })
    .await
    .unwrap();
    let status = eve.recv_action("execution_status", WAIT).await.unwrap();
    assert_eq!(status.execution_id.as_deref(), Some(execution_id.as_str()));
    assert_eq!(status.payload["is_completed"], true);
    assert_eq!(status.field_str("execution_status"), Some("success"));
    assert_eq!(status.payload["outputs"][0]["text"], "4\n");

    // Neither reply reached the other participant
    let mut seen = Vec::new();
    while let Ok(message) = alice.recv_timeout(Duration::from_millis(200)).await {
        seen.push(message.action);
    }
    assert!(!seen.iter().any(|a| a == "code_completion" || a == "execution_status"));

    server.stop().await;
}

#[tokio::test]
async fn test_slow_kernel_launch_does_not_stall_other_notebooks() {
    let temp_dir = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let launcher = EchoLauncher {
        held: HashMap::from([("nb2".to_string(), gate.clone())]),
    };
    let server = start_server_with(&temp_dir, None, launcher).await;

    // nb2's kernel is stuck launching, yet the request is acknowledged
    let mut alice = join(&server, ResourceKind::Notebook, "nb2", "t-alice").await;
    alice.execute("c1", "print(2+2)").await.unwrap();
    let executing = alice.recv_action("code_executing", WAIT).await.unwrap();
    assert_eq!(executing.status, Some(Status::Success));

    // nb1 runs and is interrupted meanwhile
    let mut bob = join(&server, ResourceKind::Notebook, "nb1", "t-bob").await;
    bob.execute("c1", "hang").await.unwrap();
    bob.recv_action("code_executing", WAIT).await.unwrap();
    bob.interrupt().await.unwrap();
    let interrupted = bob.recv_action("execution_interrupted", WAIT).await.unwrap();
    assert_eq!(interrupted.status, Some(Status::Success));
    let updated = bob.recv_action("cell_updated", WAIT).await.unwrap();
    assert_eq!(updated.field_str("execution_status"), Some("interrupted"));

    // Once nb2's kernel is up its execution completes
    gate.notify_one();
    let updated = alice.recv_action("cell_updated", WAIT).await.unwrap();
    assert_eq!(updated.field_str("execution_status"), Some("success"));
    assert_eq!(updated.payload["outputs"][0]["text"], "4\n");

    server.stop().await;
}
