//! Per-notebook kernel sessions.
//!
//! Each notebook has at most one session, holding at most one kernel handle
//! plus a small state machine (IDLE, BUSY, ERROR). The session map lock only
//! covers lookups, claims and eviction. Kernel launches run under the
//! session's own launch lock, so a slow launch for one notebook never holds
//! up another notebook, and the reaper never evicts a session that is busy
//! or still launching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{CollabError, CollabResult};
use crate::kernel::{Kernel, KernelLauncher, KernelSpecInfo};

/// Execution state of a kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Idle,
    Busy,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Busy => write!(f, "BUSY"),
            SessionState::Error => write!(f, "ERROR"),
        }
    }
}

/// How `start` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartStatus {
    Started,
    Reused,
    Restarted,
}

/// Snapshot of a session for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStatusReport {
    pub notebook_id: String,
    pub state: SessionState,
    pub last_activity: DateTime<Utc>,
    pub execution_id: Option<String>,
}

struct SessionInner {
    /// None until the first launch completes.
    kernel: Option<Arc<dyn Kernel>>,
    state: SessionState,
    last_activity: DateTime<Utc>,
    last_activity_at: Instant,
    current_execution: Option<String>,
    /// Set once the session leaves the manager; a closed session accepts no work.
    closed: bool,
}

/// One notebook's kernel and its execution state.
pub struct KernelSession {
    notebook_id: String,
    inner: StdMutex<SessionInner>,
    /// Held while a kernel is being launched or replaced.
    launch_lock: Mutex<()>,
}

impl KernelSession {
    fn new(notebook_id: &str) -> Self {
        Self {
            notebook_id: notebook_id.to_string(),
            inner: StdMutex::new(SessionInner {
                kernel: None,
                state: SessionState::Idle,
                last_activity: Utc::now(),
                last_activity_at: Instant::now(),
                current_execution: None,
                closed: false,
            }),
            launch_lock: Mutex::new(()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    /// The running kernel, if one has been launched.
    pub fn kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.inner().kernel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    /// The execution currently holding the session, if BUSY.
    pub fn current_execution(&self) -> Option<String> {
        self.inner().current_execution.clone()
    }

    pub fn touch(&self) {
        let mut inner = self.inner();
        inner.last_activity = Utc::now();
        inner.last_activity_at = Instant::now();
    }

    fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Claim the session for an execution. Fails if it is already BUSY or
    /// has been closed.
    pub fn mark_busy(&self, execution_id: &str) -> CollabResult<()> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(CollabError::KernelDead(self.notebook_id.clone()));
        }
        if inner.state == SessionState::Busy {
            return Err(CollabError::KernelBusy(self.notebook_id.clone()));
        }
        inner.state = SessionState::Busy;
        inner.current_execution = Some(execution_id.to_string());
        inner.last_activity = Utc::now();
        inner.last_activity_at = Instant::now();
        Ok(())
    }

    /// Release the session, but only on behalf of the execution that holds
    /// it. Returns false if some other execution (or none) owns the session.
    pub fn mark_idle(&self, execution_id: &str) -> bool {
        let mut inner = self.inner();
        if inner.current_execution.as_deref() != Some(execution_id) {
            return false;
        }
        inner.state = SessionState::Idle;
        inner.current_execution = None;
        inner.last_activity = Utc::now();
        inner.last_activity_at = Instant::now();
        true
    }

    /// Record a kernel failure. The next launch replaces the kernel.
    pub fn mark_error(&self, execution_id: &str) {
        let mut inner = self.inner();
        if inner.current_execution.as_deref() == Some(execution_id) {
            inner.state = SessionState::Error;
            inner.current_execution = None;
        }
    }

    /// Install a freshly launched kernel. An ERROR session becomes IDLE; a
    /// BUSY claim is left to its execution unless `reset` is set. Returns
    /// false if the session was closed while the kernel was launching.
    fn install_kernel(&self, kernel: Arc<dyn Kernel>, reset: bool) -> bool {
        let mut inner = self.inner();
        if inner.closed {
            return false;
        }
        inner.kernel = Some(kernel);
        if reset || inner.state == SessionState::Error {
            inner.state = SessionState::Idle;
            inner.current_execution = None;
        }
        inner.last_activity = Utc::now();
        inner.last_activity_at = Instant::now();
        true
    }

    fn fail_launch(&self) {
        let mut inner = self.inner();
        inner.state = SessionState::Error;
        inner.current_execution = None;
    }

    fn take_kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.inner().kernel.take()
    }

    fn close(&self) {
        self.inner().closed = true;
    }

    /// Close the session if it is neither BUSY nor launching and has been
    /// idle for longer than `timeout`.
    fn close_if_idle(&self, timeout: Duration) -> bool {
        let Ok(_launch) = self.launch_lock.try_lock() else {
            return false;
        };
        let mut inner = self.inner();
        if inner.state == SessionState::Busy || inner.last_activity_at.elapsed() <= timeout {
            return false;
        }
        inner.closed = true;
        true
    }

    pub fn status(&self) -> KernelStatusReport {
        let inner = self.inner();
        KernelStatusReport {
            notebook_id: self.notebook_id.clone(),
            state: inner.state,
            last_activity: inner.last_activity,
            execution_id: inner.current_execution.clone(),
        }
    }
}

async fn shutdown_kernel(notebook_id: &str, kernel: Arc<dyn Kernel>) {
    if let Err(e) = kernel.shutdown().await {
        warn!(
            "[kernel-manager] Error shutting down kernel for {}: {}",
            notebook_id, e
        );
    }
}

/// Owns every kernel session on this instance.
pub struct KernelSessionManager {
    launcher: Arc<dyn KernelLauncher>,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<KernelSession>>>,
}

impl KernelSessionManager {
    pub fn new(launcher: Arc<dyn KernelLauncher>, idle_timeout: Duration) -> Self {
        Self {
            launcher,
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn launch(&self, notebook_id: &str) -> CollabResult<Arc<dyn Kernel>> {
        let kernel = self
            .launcher
            .launch(notebook_id)
            .await
            .with_context(|| format!("launching kernel for notebook {}", notebook_id))?;
        Ok(kernel)
    }

    async fn session(&self, notebook_id: &str) -> Arc<KernelSession> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(notebook_id.to_string())
            .or_insert_with(|| Arc::new(KernelSession::new(notebook_id)))
            .clone();
        session.touch();
        session
    }

    /// Make sure `session` has a live kernel, launching or relaunching one
    /// under the session's launch lock.
    async fn ensure_kernel(
        &self,
        session: &KernelSession,
    ) -> CollabResult<(Arc<dyn Kernel>, StartStatus)> {
        let _launch = session.launch_lock.lock().await;
        if session.is_closed() {
            return Err(CollabError::KernelDead(session.notebook_id.clone()));
        }

        let status = match session.kernel() {
            Some(kernel) if kernel.is_alive().await => {
                debug!("[kernel-manager] Reusing kernel for {}", session.notebook_id);
                session.touch();
                return Ok((kernel, StartStatus::Reused));
            }
            Some(old) => {
                warn!(
                    "[kernel-manager] Kernel for {} is not responding, restarting",
                    session.notebook_id
                );
                if let Err(e) = old.shutdown().await {
                    debug!(
                        "[kernel-manager] Shutdown of old kernel for {} failed: {}",
                        session.notebook_id, e
                    );
                }
                StartStatus::Restarted
            }
            None => StartStatus::Started,
        };

        let kernel = self.launch_into(session, false).await?;
        info!(
            "[kernel-manager] Kernel for {} {}",
            session.notebook_id,
            match status {
                StartStatus::Restarted => "restarted",
                _ => "started",
            }
        );
        Ok((kernel, status))
    }

    /// Launch a kernel and install it into `session`. The caller holds the
    /// session's launch lock.
    async fn launch_into(
        &self,
        session: &KernelSession,
        reset: bool,
    ) -> CollabResult<Arc<dyn Kernel>> {
        match self.launch(&session.notebook_id).await {
            Ok(kernel) => {
                if session.install_kernel(kernel.clone(), reset) {
                    return Ok(kernel);
                }
                debug!(
                    "[kernel-manager] Session for {} closed during launch",
                    session.notebook_id
                );
                shutdown_kernel(&session.notebook_id, kernel).await;
                Err(CollabError::KernelDead(session.notebook_id.clone()))
            }
            Err(e) => {
                error!(
                    "[kernel-manager] Failed to launch kernel for {}: {}",
                    session.notebook_id, e
                );
                session.fail_launch();
                Err(CollabError::KernelDead(session.notebook_id.clone()))
            }
        }
    }

    /// Get or create the notebook's session with a live kernel, restarting
    /// the kernel if the handle stopped responding.
    pub async fn start(&self, notebook_id: &str) -> CollabResult<(Arc<KernelSession>, StartStatus)> {
        let session = self.session(notebook_id).await;
        let (_, status) = self.ensure_kernel(&session).await?;
        Ok((session, status))
    }

    /// Get or create the notebook's session and claim it for
    /// `execution_id`. No kernel is launched here; the execution does that
    /// through [`KernelSessionManager::kernel_for_execution`].
    pub async fn begin_execution(
        &self,
        notebook_id: &str,
        execution_id: &str,
    ) -> CollabResult<Arc<KernelSession>> {
        // Claim under the map lock so the reaper cannot close the session in between
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(notebook_id.to_string())
            .or_insert_with(|| Arc::new(KernelSession::new(notebook_id)))
            .clone();
        session.mark_busy(execution_id)?;
        Ok(session)
    }

    /// The live kernel a claimed execution should run on.
    pub(crate) async fn kernel_for_execution(
        &self,
        session: &KernelSession,
    ) -> CollabResult<Arc<dyn Kernel>> {
        self.ensure_kernel(session).await.map(|(kernel, _)| kernel)
    }

    /// Shut the kernel down and forget the session. Safe on a BUSY session.
    pub async fn stop(&self, notebook_id: &str) -> bool {
        let session = self.sessions.lock().await.remove(notebook_id);
        let Some(session) = session else {
            return false;
        };
        session.close();
        if let Some(kernel) = session.take_kernel() {
            shutdown_kernel(notebook_id, kernel).await;
        }
        info!("[kernel-manager] Stopped kernel for {}", notebook_id);
        true
    }

    /// Replace the notebook's kernel with a fresh one. Kernel state is lost.
    pub async fn restart(&self, notebook_id: &str) -> CollabResult<()> {
        let session = self
            .get(notebook_id)
            .await
            .ok_or_else(|| CollabError::NotFound("Kernel", notebook_id.to_string()))?;

        let _launch = session.launch_lock.lock().await;
        if session.is_closed() {
            return Err(CollabError::KernelDead(notebook_id.to_string()));
        }
        if let Some(old) = session.take_kernel() {
            shutdown_kernel(notebook_id, old).await;
        }
        self.launch_into(&session, true).await?;
        info!("[kernel-manager] Restarted kernel for {}", notebook_id);
        Ok(())
    }

    pub async fn get(&self, notebook_id: &str) -> Option<Arc<KernelSession>> {
        self.sessions.lock().await.get(notebook_id).cloned()
    }

    pub async fn kernel_status(&self, notebook_id: &str) -> Option<KernelStatusReport> {
        self.get(notebook_id).await.map(|s| s.status())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Kernels the launcher can start.
    pub async fn available_kernels(&self) -> Vec<KernelSpecInfo> {
        self.launcher.available_kernels().await
    }

    /// Stop every session that is neither BUSY nor launching and has been
    /// idle for longer than the idle timeout. Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let mut reaped = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, session| {
                if session.close_if_idle(self.idle_timeout) {
                    reaped.push(session.clone());
                    false
                } else {
                    true
                }
            });
        }

        for session in &reaped {
            info!("[kernel-manager] Reaping idle kernel for {}", session.notebook_id);
            if let Some(kernel) = session.take_kernel() {
                shutdown_kernel(&session.notebook_id, kernel).await;
            }
        }
        reaped.len()
    }

    /// Run `reap_idle` every `interval` until the handle is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = manager.reap_idle().await;
                if reaped > 0 {
                    info!("[kernel-manager] Reaped {} idle kernel(s)", reaped);
                }
            }
        })
    }

    /// Stop every session.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (notebook_id, session) in sessions {
            session.close();
            if let Some(kernel) = session.take_kernel() {
                shutdown_kernel(&notebook_id, kernel).await;
            }
        }
    }
}
