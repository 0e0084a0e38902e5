//! TCP server: accept loop, handshake and per-connection lifecycle.
//!
//! A connection goes through: handshake (resource + token), authentication,
//! owning-workspace resolution, READ check. Any failure there gets one
//! rejection frame with the policy-violation code and the socket is closed.
//! Accepted connections receive `connection_ack`, then the history
//! envelope, then live traffic, until the peer disconnects.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::access::{Authenticator, Capability, PermissionCheck, RoleGrants, StaticTokens};
use crate::config::CollabConfig;
use crate::connection::{
    is_connection_closed, recv_control_frame, recv_frame, send_frame, send_json_frame,
    Handshake, Rejection,
};
use crate::dispatcher::{Dispatcher, Participant};
use crate::execution::ExecutionSupervisor;
use crate::hub::{ConnectionHandle, Hub};
use crate::jupyter::JupyterLauncher;
use crate::kernel::KernelLauncher;
use crate::kernel_manager::KernelSessionManager;
use crate::protocol::Message;
use crate::relay::{PubSubBus, Relay};
use crate::store::{DocumentStore, FileStore, FsFileStore, FsStore};

/// How long a fresh connection may take to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// External services the server talks to.
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub files: Arc<dyn FileStore>,
    pub permissions: Arc<dyn PermissionCheck>,
    pub auth: Arc<dyn Authenticator>,
    /// Without a bus the instance runs standalone and nothing is relayed.
    pub bus: Option<Arc<dyn PubSubBus>>,
    pub launcher: Arc<dyn KernelLauncher>,
}

impl Collaborators {
    /// File-backed stores, static token and role tables, Jupyter kernels.
    pub fn from_config(config: &CollabConfig) -> Self {
        let kernel_cwd = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            store: Arc::new(FsStore::new(&config.docs_dir)),
            files: Arc::new(FsFileStore::new(&config.files_dir, config.max_upload_bytes)),
            permissions: Arc::new(RoleGrants::new(config.grants.clone())),
            auth: Arc::new(StaticTokens::new(config.tokens.clone())),
            bus: None,
            launcher: Arc::new(JupyterLauncher::new(&config.kernel_name, kernel_cwd)),
        }
    }
}

/// The collaboration server.
pub struct Server {
    config: CollabConfig,
    hub: Arc<Hub>,
    relay: Option<Arc<Relay>>,
    kernels: Arc<KernelSessionManager>,
    dispatcher: Dispatcher,
    auth: Arc<dyn Authenticator>,
    permissions: Arc<dyn PermissionCheck>,
    shutdown_notify: Notify,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: CollabConfig, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            store,
            files,
            permissions,
            auth,
            bus,
            launcher,
        } = collaborators;

        let hub = Arc::new(Hub::new(
            config.instance_id.clone(),
            config.history_limit,
            bus.clone(),
        ));
        let relay = bus.map(|bus| Relay::new(hub.clone(), bus, config.relay_poll_interval()));
        let kernels = Arc::new(KernelSessionManager::new(
            launcher,
            config.kernel_idle_timeout(),
        ));
        let executions = Arc::new(
            ExecutionSupervisor::new(
                kernels.clone(),
                store.clone(),
                hub.clone(),
                config.execution_timeout(),
            )
            .with_completion_timeout(config.completion_timeout()),
        );
        let dispatcher = Dispatcher::new(
            hub.clone(),
            store,
            files,
            permissions.clone(),
            executions,
        );

        Arc::new(Self {
            config,
            hub,
            relay,
            kernels,
            dispatcher,
            auth,
            permissions,
            shutdown_notify: Notify::new(),
            reaper: StdMutex::new(None),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn kernels(&self) -> &Arc<KernelSessionManager> {
        &self.kernels
    }

    pub fn relay(&self) -> Option<&Arc<Relay>> {
        self.relay.as_ref()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`Server::shutdown`].
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "[collabd] Listening on {} (instance {})",
            listener.local_addr()?,
            self.config.instance_id
        );

        let reaper = self.kernels.spawn_reaper(self.config.reaper_interval());
        *self.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("[collabd] Accepted connection from {}", peer);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("[collabd] Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[collabd] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    info!("[collabd] Shutting down");
                    break;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Ask the accept loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    async fn teardown(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
        self.hub.close_all();
        self.kernels.shutdown_all().await;
    }

    async fn reject(mut writer: OwnedWriteHalf, message: String) -> anyhow::Result<()> {
        info!("[collabd] Rejecting connection: {}", message);
        send_json_frame(&mut writer, &Rejection::policy_violation(message)).await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, recv_control_frame(&mut reader))
            .await
        {
            Ok(result) => match result? {
                Some(frame) => frame,
                None => return Ok(()),
            },
            Err(_) => return Self::reject(writer, "Handshake timed out".to_string()).await,
        };
        let handshake: Handshake = match serde_json::from_slice(&frame) {
            Ok(h) => h,
            Err(e) => return Self::reject(writer, format!("Invalid handshake: {}", e)).await,
        };

        let user_id = match self.auth.authenticate(&handshake.token).await {
            Ok(user_id) => user_id,
            Err(e) => return Self::reject(writer, e.to_string()).await,
        };
        let workspace_id = match self
            .dispatcher
            .resolve_workspace(handshake.resource, &handshake.id)
            .await
        {
            Ok(id) => id,
            Err(e) => return Self::reject(writer, e.to_string()).await,
        };
        if !self
            .permissions
            .has_access(&workspace_id, &user_id, Capability::Read)
            .await
        {
            return Self::reject(
                writer,
                format!("You don't have access to this {}", handshake.resource),
            )
            .await;
        }

        let resource_id = handshake.id;
        let (conn, mut rx) = ConnectionHandle::channel(user_id.clone());
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = send_frame(&mut writer, &frame).await {
                    debug!("[collabd] Write failed, closing writer: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut active_users: Vec<String> = self.hub.active_users(&resource_id).into_iter().collect();
        active_users.sort();
        let ack = Message::success("connection_ack")
            .with("resource", handshake.resource.to_string())
            .with("resource_id", resource_id.clone())
            .with("workspace_id", workspace_id)
            .with("user_id", user_id.clone())
            .with("active_users", active_users);
        conn.send_message(&ack)?;

        let relay_guard = match &self.relay {
            Some(relay) => match relay.attach(&resource_id).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!("[collabd] Relay unavailable for {}: {}", resource_id, e);
                    None
                }
            },
            None => None,
        };

        self.hub.join(&resource_id, conn.clone());
        info!(
            "[collabd] {} joined {} {}",
            user_id, handshake.resource, resource_id
        );
        self.hub
            .broadcast(
                &resource_id,
                Message::new("user_connected")
                    .with("user_id", user_id.clone())
                    .stamped(),
                Some(conn.id()),
            )
            .await;

        let participant = Participant {
            user_id: user_id.clone(),
            kind: handshake.resource,
            resource_id: resource_id.clone(),
            conn,
        };
        let result = self.read_loop(&participant, &mut reader).await;

        let last = self
            .hub
            .unregister(&resource_id, &user_id, participant.conn.id());
        drop(relay_guard);
        if last {
            self.hub
                .broadcast(
                    &resource_id,
                    Message::new("user_disconnected")
                        .with("user_id", user_id.clone())
                        .stamped(),
                    None,
                )
                .await;
        }
        info!("[collabd] {} left {}", user_id, resource_id);

        // Let queued frames drain; the writer ends once the last sender is gone
        drop(participant);
        if tokio::time::timeout(Duration::from_secs(5), writer_task)
            .await
            .is_err()
        {
            debug!("[collabd] Writer for {} did not drain in time", user_id);
        }

        result
    }

    async fn read_loop(
        &self,
        participant: &Participant,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
    ) -> anyhow::Result<()> {
        loop {
            match recv_frame(reader).await {
                Ok(Some(frame)) => {
                    self.dispatcher.dispatch(participant, &frame).await;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    let e = anyhow::Error::from(e);
                    if is_connection_closed(&e) {
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        }
    }
}
