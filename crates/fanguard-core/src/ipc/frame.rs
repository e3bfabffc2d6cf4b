//! Length-prefixed JSON framing.
//!
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ length: u32 (BE)   │ body: `length` bytes JSON │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! An idle connection may wait indefinitely for the first byte of a frame;
//! once it arrives the rest must follow within the request timeout.

use std::io;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::ErrorKind;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame not completed within {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Error kind to report to the peer, if the failure is reportable.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ProtocolError::Unauthorized => Some(ErrorKind::Unauthorized),
            ProtocolError::Malformed(_) => Some(ErrorKind::Malformed),
            ProtocolError::Timeout(_) => Some(ErrorKind::Timeout),
            ProtocolError::Closed | ProtocolError::Io(_) => None,
        }
    }
}

fn check_len(len: u32, max: usize) -> Result<usize, ProtocolError> {
    let len = len as usize;
    if len == 0 {
        return Err(ProtocolError::Malformed("empty frame".into()));
    }
    if len > max {
        return Err(ProtocolError::Malformed(format!(
            "frame of {len} bytes exceeds limit of {max}"
        )));
    }
    Ok(len)
}

/// Split one frame off the front of `buf`.
///
/// Returns the body and the number of bytes consumed, or `None` when `buf`
/// does not yet hold a complete frame.
pub fn split_frame(buf: &[u8], max: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX) else {
        return Ok(None);
    };
    let len = check_len(u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]), max)?;
    let end = LENGTH_PREFIX + len;
    Ok(buf.get(LENGTH_PREFIX..end).map(|body| (body, end)))
}

/// Serialize `msg` into a complete frame.
pub fn encode_frame<T: Serialize>(msg: &T, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| ProtocolError::Malformed("frame too large".into()))?;
    check_len(len, max)?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn eof_as_closed(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Closed
    } else {
        ProtocolError::Io(e)
    }
}

/// Read one frame body. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(
    reader: &mut R,
    max: usize,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let first = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtocolError::Io(e)),
    };

    let rest = async {
        let mut prefix = [first, 0, 0, 0];
        reader
            .read_exact(&mut prefix[1..])
            .await
            .map_err(eof_as_closed)?;
        let len = check_len(u32::from_be_bytes(prefix), max)?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(eof_as_closed)?;
        Ok::<_, ProtocolError>(body)
    };

    match tokio::time::timeout(timeout, rest).await {
        Ok(result) => result.map(Some),
        Err(_) => Err(ProtocolError::Timeout(timeout)),
    }
}

/// Serialize and write one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T, max: usize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg, max)?;
    writer.write_all(&frame).await.map_err(eof_as_closed)?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message. `Ok(None)` on a clean end of stream.
pub async fn recv<R, T>(reader: &mut R, max: usize, timeout: Duration) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader, max, timeout).await? {
        Some(body) => decode_body(&body).map(Some),
        None => Ok(None),
    }
}
