//! Jupyter kernels launched through `runtimelib`.
//!
//! Each kernel runs as its own process group. An iopub listener translates
//! protocol messages into [`KernelEvent`]s tagged with the parent request's
//! `msg_id`; a shell reader drains replies so the socket never backs up and
//! routes `complete_reply` back to whoever asked.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use jupyter_protocol::{
    CompleteReply, CompleteRequest, ConnectionInfo, ExecuteRequest, ExecutionState,
    InterruptRequest, JupyterMessage, JupyterMessageContent, KernelInfoRequest,
    ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::kernel::{
    Completion, Kernel, KernelActivity, KernelEvent, KernelEventContent, KernelLauncher,
    KernelSpecInfo, KERNEL_EVENT_CAPACITY,
};
use crate::protocol::Output;

const COMPLETE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending completion requests: msg_id -> oneshot sender for routing complete_reply.
type PendingCompletions = Arc<StdMutex<HashMap<String, oneshot::Sender<Completion>>>>;

fn completion_from_reply(reply: CompleteReply) -> Completion {
    Completion {
        matches: reply.matches,
        cursor_start: reply.cursor_start,
        cursor_end: reply.cursor_end,
        metadata: Value::Object(reply.metadata),
    }
}

/// Translate a kernel message into an event, dropping message types the
/// daemon does not track.
fn event_from_content(parent_id: &str, content: &JupyterMessageContent) -> Option<KernelEvent> {
    let content = match content {
        JupyterMessageContent::Status(status) => {
            let activity = match status.execution_state {
                ExecutionState::Busy => KernelActivity::Busy,
                ExecutionState::Idle => KernelActivity::Idle,
                ExecutionState::Starting => KernelActivity::Starting,
                _ => return None,
            };
            KernelEventContent::Status(activity)
        }
        JupyterMessageContent::ExecuteInput(input) => KernelEventContent::ExecuteInput {
            execution_count: input.execution_count.0 as u32,
        },
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            KernelEventContent::Output(Output::Stream {
                name: name.to_string(),
                text: stream.text.clone(),
            })
        }
        JupyterMessageContent::ExecuteResult(result) => {
            KernelEventContent::Output(Output::ExecuteResult {
                execution_count: Some(result.execution_count.0 as u32),
                data: serde_json::to_value(&result.data).unwrap_or_default(),
            })
        }
        JupyterMessageContent::DisplayData(display) => {
            KernelEventContent::Output(Output::DisplayData {
                data: serde_json::to_value(&display.data).unwrap_or_default(),
            })
        }
        JupyterMessageContent::ErrorOutput(err) => KernelEventContent::Output(Output::Error {
            ename: err.ename.clone(),
            evalue: err.evalue.clone(),
            traceback: err.traceback.clone(),
        }),
        _ => return None,
    };
    Some(KernelEvent::new(parent_id, content))
}

/// Launches kernels from an installed kernelspec.
pub struct JupyterLauncher {
    kernel_name: String,
    working_dir: PathBuf,
}

impl JupyterLauncher {
    pub fn new(kernel_name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl KernelLauncher for JupyterLauncher {
    async fn launch(&self, notebook_id: &str) -> Result<Arc<dyn Kernel>> {
        let kernel = JupyterKernel::launch(notebook_id, &self.kernel_name, &self.working_dir).await?;
        Ok(Arc::new(kernel))
    }

    async fn available_kernels(&self) -> Vec<KernelSpecInfo> {
        runtimelib::list_kernelspecs()
            .await
            .into_iter()
            .map(|s| KernelSpecInfo {
                name: s.kernel_name,
                display_name: s.kernelspec.display_name,
                language: s.kernelspec.language,
                path: s.path,
            })
            .collect()
    }
}

/// A running Jupyter kernel process.
pub struct JupyterKernel {
    notebook_id: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    session_id: String,
    events: broadcast::Sender<KernelEvent>,
    shell_writer: Mutex<Option<runtimelib::DealerSendConnection>>,
    pending_completions: PendingCompletions,
    process: Mutex<Option<tokio::process::Child>>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl JupyterKernel {
    pub async fn launch(
        notebook_id: &str,
        kernel_name: &str,
        working_dir: &std::path::Path,
    ) -> Result<Self> {
        // Reserve ports
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernel_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("collabd-kernel-{}.json", kernel_id));
        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        info!(
            "[jupyter] Starting {} kernel {} for notebook {}",
            kernel_name, kernel_id, notebook_id
        );
        let kernelspec = runtimelib::find_kernelspec(kernel_name).await?;
        let mut cmd = kernelspec.command(
            &connection_file,
            Some(Stdio::null()),
            Some(Stdio::null()),
        )?;
        tokio::fs::create_dir_all(working_dir).await?;
        cmd.current_dir(working_dir);

        #[cfg(unix)]
        cmd.process_group(0);

        let process = cmd.kill_on_drop(true).spawn()?;
        #[cfg(unix)]
        let process_group_id = process.id().map(|pid| pid as i32);

        // Small delay to let the kernel start
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let session_id = Uuid::new_v4().to_string();
        let (events, _) = broadcast::channel(KERNEL_EVENT_CAPACITY);

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;
        let iopub_events = events.clone();
        let iopub_notebook = notebook_id.to_string();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        let parent_id = message
                            .parent_header
                            .as_ref()
                            .map(|h| h.msg_id.clone())
                            .unwrap_or_default();
                        debug!(
                            "[jupyter] iopub: type={} parent_msg_id={}",
                            message.header.msg_type, parent_id
                        );
                        if let Some(event) = event_from_content(&parent_id, &message.content) {
                            let _ = iopub_events.send(event);
                        }
                    }
                    Err(e) => {
                        error!("[jupyter] iopub read error for {}: {}", iopub_notebook, e);
                        break;
                    }
                }
            }
        });

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Verify kernel is alive
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;
        match tokio::time::timeout(std::time::Duration::from_secs(30), shell.read()).await {
            Ok(Ok(msg)) => {
                info!("[jupyter] Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                iopub_task.abort();
                return Err(anyhow::anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                iopub_task.abort();
                return Err(anyhow::anyhow!("Kernel did not respond within 30s"));
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();
        let pending_completions = PendingCompletions::default();
        let pending = pending_completions.clone();
        let shell_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        let parent_msg_id = msg.parent_header.as_ref().map(|h| h.msg_id.clone());
                        match msg.content {
                            JupyterMessageContent::CompleteReply(reply) => {
                                let sender = parent_msg_id.and_then(|id| {
                                    pending
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .remove(&id)
                                });
                                if let Some(sender) = sender {
                                    let _ = sender.send(completion_from_reply(reply));
                                }
                            }
                            JupyterMessageContent::ExecuteReply(ref reply)
                                if reply.status != jupyter_protocol::ReplyStatus::Ok =>
                            {
                                debug!("[jupyter] execute_reply status: {:?}", reply.status);
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        debug!("[jupyter] shell read ended: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            notebook_id: notebook_id.to_string(),
            connection_info,
            connection_file,
            session_id,
            events,
            shell_writer: Mutex::new(Some(shell_writer)),
            pending_completions,
            process: Mutex::new(Some(process)),
            #[cfg(unix)]
            process_group_id,
            tasks: StdMutex::new(vec![iopub_task, shell_task]),
        })
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    #[cfg(unix)]
    fn kill_process_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pgid) = self.process_group_id {
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!("[jupyter] Failed to kill process group {}: {}", pgid, e);
                }
            }
        }
    }
}

#[async_trait]
impl Kernel for JupyterKernel {
    async fn execute(&self, code: &str) -> Result<String> {
        let mut shell = self.shell_writer.lock().await;
        let shell = shell
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No kernel running"))?;

        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let msg_id = message.header.msg_id.clone();
        shell.send(message).await?;
        debug!(
            "[jupyter] Sent execute_request {} for {}",
            msg_id, self.notebook_id
        );
        Ok(msg_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn complete(&self, code: &str, cursor_pos: usize) -> Result<Completion> {
        let request: JupyterMessage = CompleteRequest {
            code: code.to_string(),
            cursor_pos,
        }
        .into();
        let msg_id = request.header.msg_id.clone();

        // Register before sending so the shell reader can always route the reply
        let (tx, rx) = oneshot::channel();
        self.pending_completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id.clone(), tx);

        let sent = {
            let mut shell = self.shell_writer.lock().await;
            match shell.as_mut() {
                Some(shell) => shell.send(request).await.map_err(anyhow::Error::from),
                None => Err(anyhow::anyhow!("No kernel running")),
            }
        };
        let result = match sent {
            Ok(()) => match tokio::time::timeout(COMPLETE_REPLY_TIMEOUT, rx).await {
                Ok(Ok(completion)) => Ok(completion),
                Ok(Err(_)) => Err(anyhow::anyhow!("Shell reader dropped")),
                Err(_) => Err(anyhow::anyhow!("Timeout waiting for complete_reply")),
            },
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.pending_completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&msg_id);
        }
        result
    }

    async fn interrupt(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        let request: JupyterMessage = InterruptRequest {}.into();
        control.send(request).await?;
        info!("[jupyter] Sent interrupt_request to {}", self.notebook_id);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let tasks_running = {
            let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            !tasks.is_empty() && tasks.iter().all(|t| !t.is_finished())
        };
        if !tasks_running {
            return false;
        }
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("[jupyter] Shutting down kernel for {}", self.notebook_id);
        self.abort_tasks();

        if let Some(mut shell) = self.shell_writer.lock().await.take() {
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            if let Err(e) = shell.send(request).await {
                warn!("[jupyter] shutdown_request failed: {}", e);
            }
        }

        #[cfg(unix)]
        self.kill_process_group();

        self.process.lock().await.take();
        let _ = tokio::fs::remove_file(&self.connection_file).await;
        Ok(())
    }
}

impl Drop for JupyterKernel {
    fn drop(&mut self) {
        self.abort_tasks();

        #[cfg(unix)]
        self.kill_process_group();

        let _ = std::fs::remove_file(&self.connection_file);
    }
}
