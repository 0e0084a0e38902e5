//! Connection framing and handshake for the collabd socket.
//!
//! Every frame is length-prefixed:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [JSON payload]
//! ```
//!
//! The first frame on every connection is a [`Handshake`] naming the resource
//! and carrying the bearer token. If it is rejected the server answers with a
//! single error frame carrying [`POLICY_VIOLATION`] and closes the socket.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ResourceKind;

/// Maximum frame size for data frames: 64 MiB (uploads arrive base64 encoded).
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum frame size for the handshake: 64 KiB.
/// Keeps an unauthenticated peer from forcing large allocations.
const MAX_CONTROL_FRAME_SIZE: usize = 64 * 1024;

/// Close code sent when authentication or initial resource access fails.
pub const POLICY_VIOLATION: u16 = 1008;

/// The first frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub resource: ResourceKind,
    pub id: String,
    pub token: String,
}

/// The frame sent just before the server closes a rejected connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub status: String,
    pub message: String,
    pub code: u16,
}

impl Rejection {
    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            code: POLICY_VIOLATION,
        }
    }
}

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame with a caller-specified size limit.
/// Returns `None` on clean disconnect (EOF).
async fn recv_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Receive a data frame. Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

/// Receive a frame under the handshake size limit (64 KiB).
pub async fn recv_control_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_CONTROL_FRAME_SIZE).await
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

/// Check if an error is just a normal connection close.
pub(crate) fn is_connection_closed(e: &anyhow::Error) -> bool {
    if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
        matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    } else {
        false
    }
}
