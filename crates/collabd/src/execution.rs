//! Code execution against notebook kernels.
//!
//! An execution claims the notebook's session (BUSY), makes sure a kernel
//! is running, submits the code, and pumps the kernel's event stream until
//! the request's idle status arrives, the timeout fires, or a participant
//! interrupts. Only events carrying this request's correlation id are kept.
//! Outputs are written to the cell and the session goes back to IDLE.
//!
//! Recent executions stay in a bounded registry so participants can look up
//! their status and outputs by id.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::hub::Hub;
use crate::kernel::{Completion, Kernel, KernelActivity, KernelEventContent};
use crate::kernel_manager::{KernelSession, KernelSessionManager};
use crate::protocol::{Message, Output};
use crate::store::{CellPatch, DocumentStore};

/// Finished executions kept for status lookups.
const FINISHED_EXECUTIONS_KEPT: usize = 256;

const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Timeout,
    Interrupted,
    /// The kernel refused the request or went away mid-execution.
    Error,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub notebook_id: String,
    pub cell_id: String,
    /// The kernel's own counter for this request.
    pub execution_count: Option<u32>,
    pub outputs: Vec<Output>,
    #[serde(serialize_with = "as_secs")]
    pub duration: Duration,
    pub status: ExecutionStatus,
}

impl ExecutionReport {
    /// The `cell_updated` broadcast announcing a finished execution.
    pub fn to_message(&self) -> Message {
        Message::success("cell_updated")
            .with_execution_id(self.execution_id.clone())
            .with("cell_id", self.cell_id.clone())
            .with(
                "outputs",
                serde_json::to_value(&self.outputs).unwrap_or_default(),
            )
            .with("execution_count", self.execution_count)
            .with(
                "execution_status",
                serde_json::to_value(self.status).unwrap_or_default(),
            )
            .with("duration", self.duration.as_secs_f64())
    }
}

/// What is known about a recent execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub notebook_id: String,
    pub cell_id: String,
    pub start_time: DateTime<Utc>,
    started: Instant,
    /// Set once the execution has finished.
    pub report: Option<ExecutionReport>,
}

impl ExecutionRecord {
    pub fn is_completed(&self) -> bool {
        self.report.is_some()
    }

    pub fn duration(&self) -> Duration {
        match &self.report {
            Some(report) => report.duration,
            None => self.started.elapsed(),
        }
    }

    /// The `execution_status` reply. Outputs are only included on request,
    /// and only once the execution has finished.
    pub fn to_message(&self, include_outputs: bool) -> Message {
        let msg = Message::success("execution_status")
            .with_execution_id(self.execution_id.clone())
            .with("notebook_id", self.notebook_id.clone())
            .with("cell_id", self.cell_id.clone())
            .with("start_time", self.start_time.to_rfc3339())
            .with("duration", self.duration().as_secs_f64())
            .with("is_completed", self.is_completed());

        let Some(report) = &self.report else {
            return msg
                .with("execution_status", "running")
                .with("output_count", 0);
        };
        let msg = msg
            .with(
                "execution_status",
                serde_json::to_value(report.status).unwrap_or_default(),
            )
            .with("execution_count", report.execution_count)
            .with("output_count", report.outputs.len());
        if include_outputs {
            msg.with(
                "outputs",
                serde_json::to_value(&report.outputs).unwrap_or_default(),
            )
        } else {
            msg
        }
    }
}

/// Running and recently finished executions.
#[derive(Default)]
struct ExecutionLog {
    records: HashMap<String, ExecutionRecord>,
    /// Finished execution ids, oldest first.
    finished: VecDeque<String>,
}

impl ExecutionLog {
    fn finish(&mut self, report: &ExecutionReport) {
        if let Some(record) = self.records.get_mut(&report.execution_id) {
            record.report = Some(report.clone());
            self.finished.push_back(report.execution_id.clone());
        }
        while self.finished.len() > FINISHED_EXECUTIONS_KEPT {
            if let Some(oldest) = self.finished.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }
}

/// Outputs gathered while pumping kernel events.
#[derive(Default)]
struct Collected {
    outputs: Vec<Output>,
    execution_count: Option<u32>,
}

struct Claimed {
    supervisor: Arc<ExecutionSupervisor>,
    session: Arc<KernelSession>,
    signal: Arc<Notify>,
    cell_id: String,
    code: String,
}

/// A claimed but not yet started background execution. Dropping it
/// without calling [`PendingExecution::spawn`] releases the session.
pub struct PendingExecution {
    execution_id: String,
    claimed: Option<Claimed>,
}

impl PendingExecution {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Run the execution on its own task and broadcast the result. The
    /// kernel is launched on that task if the notebook has none yet.
    pub fn spawn(mut self) -> JoinHandle<()> {
        let claimed = self.claimed.take();
        let execution_id = self.execution_id.clone();
        tokio::spawn(async move {
            let Some(c) = claimed else {
                return;
            };
            let report = c
                .supervisor
                .run(c.session, c.signal, &c.cell_id, &c.code, execution_id)
                .await;
            c.supervisor
                .hub
                .broadcast(&report.notebook_id, report.to_message(), None)
                .await;
        })
    }
}

impl Drop for PendingExecution {
    fn drop(&mut self) {
        if let Some(c) = self.claimed.take() {
            c.supervisor.interrupts().remove(&self.execution_id);
            c.supervisor.log().records.remove(&self.execution_id);
            c.session.mark_idle(&self.execution_id);
        }
    }
}

/// Runs code on behalf of participants.
pub struct ExecutionSupervisor {
    kernels: Arc<KernelSessionManager>,
    store: Arc<dyn DocumentStore>,
    hub: Arc<Hub>,
    timeout: Duration,
    completion_timeout: Duration,
    /// execution_id -> signal that ends its pump early. Whoever removes the
    /// entry decides how the execution ends.
    interrupts: StdMutex<HashMap<String, Arc<Notify>>>,
    log: StdMutex<ExecutionLog>,
}

impl ExecutionSupervisor {
    pub fn new(
        kernels: Arc<KernelSessionManager>,
        store: Arc<dyn DocumentStore>,
        hub: Arc<Hub>,
        timeout: Duration,
    ) -> Self {
        Self {
            kernels,
            store,
            hub,
            timeout,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            interrupts: StdMutex::new(HashMap::new()),
            log: StdMutex::new(ExecutionLog::default()),
        }
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn kernels(&self) -> &Arc<KernelSessionManager> {
        &self.kernels
    }

    fn interrupts(&self) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.interrupts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self) -> MutexGuard<'_, ExecutionLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Status of a running or recently finished execution.
    pub fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.log().records.get(execution_id).cloned()
    }

    /// Check the cell exists, then claim the notebook's session. The kernel
    /// itself is started later, by `run`.
    async fn claim(
        &self,
        notebook_id: &str,
        cell_id: &str,
        execution_id: &str,
    ) -> CollabResult<(Arc<KernelSession>, Arc<Notify>)> {
        let notebook = self.store.get_notebook(notebook_id).await?;
        if notebook.cell(cell_id).is_none() {
            return Err(CollabError::cell_not_found(cell_id));
        }

        // Registered before the session turns BUSY so an interrupt can
        // always find it
        let signal = Arc::new(Notify::new());
        self.interrupts()
            .insert(execution_id.to_string(), signal.clone());

        match self.kernels.begin_execution(notebook_id, execution_id).await {
            Ok(session) => {
                self.log().records.insert(
                    execution_id.to_string(),
                    ExecutionRecord {
                        execution_id: execution_id.to_string(),
                        notebook_id: notebook_id.to_string(),
                        cell_id: cell_id.to_string(),
                        start_time: Utc::now(),
                        started: Instant::now(),
                        report: None,
                    },
                );
                Ok((session, signal))
            }
            Err(e) => {
                self.interrupts().remove(execution_id);
                Err(e)
            }
        }
    }

    /// Execute and wait for the result.
    pub async fn execute(
        &self,
        notebook_id: &str,
        cell_id: &str,
        code: &str,
    ) -> CollabResult<ExecutionReport> {
        let execution_id = Uuid::new_v4().to_string();
        let (session, signal) = self.claim(notebook_id, cell_id, &execution_id).await?;
        Ok(self
            .run(session, signal, cell_id, code, execution_id)
            .await)
    }

    /// Start an execution in the background and return its id. When it
    /// finishes every participant on the notebook receives `cell_updated`.
    pub async fn execute_async(
        self: &Arc<Self>,
        notebook_id: &str,
        cell_id: &str,
        code: &str,
    ) -> CollabResult<String> {
        let pending = self.prepare(notebook_id, cell_id, code).await?;
        let execution_id = pending.execution_id().to_string();
        pending.spawn();
        Ok(execution_id)
    }

    /// Claim the session for a background execution without starting it
    /// yet, so the caller can announce the execution id first. Never waits
    /// for a kernel launch.
    pub async fn prepare(
        self: &Arc<Self>,
        notebook_id: &str,
        cell_id: &str,
        code: &str,
    ) -> CollabResult<PendingExecution> {
        let execution_id = Uuid::new_v4().to_string();
        let (session, signal) = self.claim(notebook_id, cell_id, &execution_id).await?;
        Ok(PendingExecution {
            execution_id,
            claimed: Some(Claimed {
                supervisor: self.clone(),
                session,
                signal,
                cell_id: cell_id.to_string(),
                code: code.to_string(),
            }),
        })
    }

    async fn run(
        &self,
        session: Arc<KernelSession>,
        signal: Arc<Notify>,
        cell_id: &str,
        code: &str,
        execution_id: String,
    ) -> ExecutionReport {
        let notebook_id = session.notebook_id().to_string();
        let started = Instant::now();
        let mut collected = Collected::default();

        let mut status = match self.kernels.kernel_for_execution(&session).await {
            Err(e) => {
                warn!(
                    "[execution] No kernel for {} to run {}: {}",
                    notebook_id, execution_id, e
                );
                collected.outputs.push(Output::kernel_failure(e.to_string()));
                ExecutionStatus::Error
            }
            // Interrupted while the kernel was starting
            Ok(_) if signal.notified().now_or_never().is_some() => {
                collected.outputs.push(Output::interrupted());
                ExecutionStatus::Interrupted
            }
            Ok(kernel) => {
                info!(
                    "[execution] Running {} on {} (cell {})",
                    execution_id, notebook_id, cell_id
                );
                self.pump(kernel.as_ref(), &signal, code, &execution_id, &mut collected)
                    .await
            }
        };
        if status == ExecutionStatus::Error {
            session.mark_error(&execution_id);
        }

        // An interrupt that already took the signal has been reported as a
        // success to its sender, so the execution ends as interrupted.
        if self.interrupts().remove(&execution_id).is_none()
            && status != ExecutionStatus::Interrupted
        {
            debug!(
                "[execution] {} was interrupted as it finished",
                execution_id
            );
            collected.outputs.push(Output::interrupted());
            status = ExecutionStatus::Interrupted;
        }

        let Collected {
            outputs,
            execution_count,
        } = collected;
        if let Err(e) = self
            .store
            .update_cell(
                &notebook_id,
                cell_id,
                CellPatch::Execution {
                    outputs: outputs.clone(),
                    execution_count,
                },
            )
            .await
        {
            warn!(
                "[execution] Failed to save outputs of {} to cell {}: {}",
                execution_id, cell_id, e
            );
        }

        session.mark_idle(&execution_id);

        let duration = started.elapsed();
        info!(
            "[execution] {} finished with {:?} in {:.2?}",
            execution_id, status, duration
        );
        let report = ExecutionReport {
            execution_id,
            notebook_id,
            cell_id: cell_id.to_string(),
            execution_count,
            outputs,
            duration,
            status,
        };
        self.log().finish(&report);
        report
    }

    /// Submit `code` and collect this request's events until it ends.
    async fn pump(
        &self,
        kernel: &dyn Kernel,
        signal: &Notify,
        code: &str,
        execution_id: &str,
        collected: &mut Collected,
    ) -> ExecutionStatus {
        // Subscribe before submitting so no event can be missed
        let mut events = kernel.subscribe();

        let msg_id = match kernel.execute(code).await {
            Ok(msg_id) => msg_id,
            Err(e) => {
                warn!("[execution] Kernel refused execution {}: {}", execution_id, e);
                collected.outputs.push(Output::kernel_failure(e.to_string()));
                return ExecutionStatus::Error;
            }
        };
        debug!("[execution] {} submitted as msg_id {}", execution_id, msg_id);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = signal.notified() => {
                    collected.outputs.push(Output::interrupted());
                    return ExecutionStatus::Interrupted;
                }
                _ = &mut deadline => {
                    warn!(
                        "[execution] {} timed out after {:?}",
                        execution_id, self.timeout
                    );
                    if let Err(e) = kernel.interrupt().await {
                        debug!("[execution] Interrupt after timeout failed: {}", e);
                    }
                    collected.outputs.push(Output::timeout(self.timeout));
                    return ExecutionStatus::Timeout;
                }
                event = events.recv() => match event {
                    Ok(event) if event.parent_id != msg_id => continue,
                    Ok(event) => match event.content {
                        KernelEventContent::Status(KernelActivity::Idle) => {
                            return ExecutionStatus::Success;
                        }
                        KernelEventContent::Status(_) => {}
                        KernelEventContent::ExecuteInput { execution_count: n } => {
                            collected.execution_count = Some(n);
                        }
                        KernelEventContent::Output(output) => {
                            if let Output::ExecuteResult {
                                execution_count: Some(n),
                                ..
                            } = &output
                            {
                                collected.execution_count = Some(*n);
                            }
                            collected.outputs.push(output);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            "[execution] {} missed {} kernel events",
                            execution_id, n
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        collected.outputs.push(Output::kernel_failure(
                            "Kernel stopped before the execution finished",
                        ));
                        return ExecutionStatus::Error;
                    }
                },
            }
        }
    }

    /// Interrupt the notebook's running execution. Returns false when there
    /// is nothing to interrupt, including an execution that has already
    /// collected its result.
    pub async fn interrupt(&self, notebook_id: &str) -> bool {
        let Some(session) = self.kernels.get(notebook_id).await else {
            return false;
        };
        let Some(execution_id) = session.current_execution() else {
            return false;
        };
        let Some(signal) = self.interrupts().remove(&execution_id) else {
            return false;
        };

        // The pump must see the signal before any kernel reaction
        signal.notify_one();
        if let Some(kernel) = session.kernel() {
            if let Err(e) = kernel.interrupt().await {
                warn!(
                    "[execution] Failed to signal kernel for {}: {}",
                    notebook_id, e
                );
            }
        }
        session.mark_idle(&execution_id);
        info!(
            "[execution] Interrupted {} on {}",
            execution_id, notebook_id
        );
        true
    }

    /// Ask the notebook's kernel for completions, starting it if needed.
    pub async fn complete(
        &self,
        notebook_id: &str,
        code: &str,
        cursor_pos: usize,
    ) -> CollabResult<Completion> {
        self.store.get_notebook(notebook_id).await?;
        let (session, _) = self.kernels.start(notebook_id).await?;
        let kernel = session
            .kernel()
            .ok_or_else(|| CollabError::KernelDead(notebook_id.to_string()))?;
        let completion =
            tokio::time::timeout(self.completion_timeout, kernel.complete(code, cursor_pos))
                .await
                .map_err(|_| CollabError::Timeout("Completion", self.completion_timeout))??;
        session.touch();
        Ok(completion)
    }
}
