//! Client for talking to a collabd instance.
//!
//! Used by the CLI and by tests. One client is one participant connection:
//! it performs the handshake, keeps the `connection_ack`, and then sends
//! requests and reads envelopes as they arrive.

use std::time::Duration;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::connection::{self, Handshake, Rejection};
use crate::protocol::{ClientRequest, Message};
use crate::ResourceKind;

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Connection rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

/// A single participant connection.
pub struct CollabClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    ack: Message,
}

impl CollabClient {
    /// Connect and join `resource`/`id` with `token`.
    ///
    /// Fails with [`ClientError::Rejected`] when the server refuses the
    /// handshake.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        resource: ResourceKind,
        id: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, resource, id, token, Duration::from_secs(2)).await
    }

    pub async fn connect_with_timeout(
        addr: impl ToSocketAddrs,
        resource: ResourceKind,
        id: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let handshake = Handshake {
            resource,
            id: id.to_string(),
            token: token.to_string(),
        };
        connection::send_json_frame(&mut writer, &handshake)
            .await
            .map_err(|e| ClientError::ProtocolError(format!("handshake: {}", e)))?;

        let frame = tokio::time::timeout(timeout, connection::recv_frame(&mut reader))
            .await
            .map_err(|_| ClientError::Timeout)??
            .ok_or(ClientError::Closed)?;

        if let Ok(rejection) = serde_json::from_slice::<Rejection>(&frame) {
            return Err(ClientError::Rejected {
                code: rejection.code,
                message: rejection.message,
            });
        }
        let ack: Message = serde_json::from_slice(&frame)
            .map_err(|e| ClientError::ProtocolError(format!("invalid ack: {}", e)))?;
        if ack.action != "connection_ack" {
            return Err(ClientError::ProtocolError(format!(
                "expected connection_ack, got {}",
                ack.action
            )));
        }
        debug!("[collab-client] Joined {} {}", resource, id);

        Ok(Self {
            reader,
            writer,
            ack,
        })
    }

    /// The `connection_ack` received during the handshake.
    pub fn ack(&self) -> &Message {
        &self.ack
    }

    /// Send a typed request.
    pub async fn send(&mut self, request: &ClientRequest) -> Result<(), ClientError> {
        let data = serde_json::to_vec(request)
            .map_err(|e| ClientError::ProtocolError(e.to_string()))?;
        self.send_raw(&data).await
    }

    /// Send an arbitrary frame, valid or not.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<(), ClientError> {
        connection::send_frame(&mut self.writer, data).await?;
        Ok(())
    }

    /// Next envelope from the server, or `None` once it hangs up.
    pub async fn recv(&mut self) -> Result<Option<Message>, ClientError> {
        match connection::recv_frame(&mut self.reader).await? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| ClientError::ProtocolError(e.to_string())),
            None => Ok(None),
        }
    }

    /// Next envelope, failing if none arrives within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, ClientError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)??
            .ok_or(ClientError::Closed)
    }

    /// Skip envelopes until one with `action` arrives.
    pub async fn recv_action(
        &mut self,
        action: &str,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let message = self.recv_timeout(remaining).await?;
            if message.action == action {
                return Ok(message);
            }
            debug!("[collab-client] Skipping {} while waiting for {}", message.action, action);
        }
    }

    /// Send a chat message to the workspace.
    pub async fn chat(&mut self, content: &str) -> Result<(), ClientError> {
        self.send(&ClientRequest::ChatMessage {
            content: content.to_string(),
        })
        .await
    }

    /// Ask the notebook's kernel to run `code` for `cell_id`.
    pub async fn execute(&mut self, cell_id: &str, code: &str) -> Result<(), ClientError> {
        self.send(&ClientRequest::CodeExecute {
            cell_id: cell_id.to_string(),
            code: code.to_string(),
        })
        .await
    }

    pub async fn interrupt(&mut self) -> Result<(), ClientError> {
        self.send(&ClientRequest::InterruptExecution).await
    }

    /// Close the write side and let the server finish.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
