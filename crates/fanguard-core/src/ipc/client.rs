//! IPC client: connects to the daemon over its Unix domain socket.
//!
//! Used by the CLI to read state, push policies and follow snapshot
//! updates. Each call opens its own connection.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use fanguard_config::ControlPolicy;
use futures::Stream;
use tokio::net::UnixStream;
use tracing::debug;

use super::frame::{self, ProtocolError};
use super::types::{ErrorKind, Request, RequestFrame, Response};
use crate::auth::IpcToken;
use crate::control::RuntimeSnapshot;

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("daemon is not running (socket not found at {})", .0.display())]
    NotRunning(PathBuf),

    #[error("failed to connect to daemon socket at {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("daemon returned {kind}: {message}")]
    Daemon { kind: ErrorKind, message: String },

    #[error("unexpected response from daemon: {0}")]
    UnexpectedResponse(String),
}

impl IpcClientError {
    /// Error kind reported by the daemon, if any.
    pub fn daemon_kind(&self) -> Option<ErrorKind> {
        match self {
            IpcClientError::Daemon { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Snapshots pushed by a subscription.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<RuntimeSnapshot, IpcClientError>> + Send>>;

/// Client for the fanguard daemon.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    token: IpcToken,
    max_frame_bytes: usize,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>, token: IpcToken) -> Self {
        Self {
            socket_path: socket_path.into(),
            token,
            max_frame_bytes: 64 * 1024,
            timeout: Duration::from_secs(20),
        }
    }

    /// Override the frame size limit.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Override how long to wait for a response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if the daemon socket exists (daemon is likely running).
    pub fn daemon_available(&self) -> bool {
        self.socket_path.exists()
    }

    async fn connect(&self) -> Result<UnixStream, IpcClientError> {
        if !self.daemon_available() {
            return Err(IpcClientError::NotRunning(self.socket_path.clone()));
        }
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| IpcClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })
    }

    /// Send one request and wait for one response.
    async fn call(&self, request: Request) -> Result<Response, IpcClientError> {
        let mut stream = self.connect().await?;
        debug!(request = request.name(), "IPC request");
        let frame = RequestFrame::new(self.token.expose(), request);
        frame::write_frame(&mut stream, &frame, self.max_frame_bytes).await?;

        let response = tokio::time::timeout(
            self.timeout,
            frame::recv::<_, Response>(&mut stream, self.max_frame_bytes, self.timeout),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(self.timeout))??;

        match response {
            Some(Response::Error {
                error_kind,
                message,
            }) => Err(IpcClientError::Daemon {
                kind: error_kind,
                message,
            }),
            Some(other) => Ok(other),
            None => Err(ProtocolError::Closed.into()),
        }
    }

    /// Fetch the latest runtime snapshot.
    pub async fn get_state(&self) -> Result<RuntimeSnapshot, IpcClientError> {
        match self.call(Request::GetState).await? {
            Response::StateSnapshot { snapshot } => Ok(*snapshot),
            other => Err(IpcClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Replace the active policy. Returns once the daemon has applied it.
    pub async fn set_policy(&self, policy: ControlPolicy) -> Result<(), IpcClientError> {
        match self.call(Request::SetPolicy { policy }).await? {
            Response::Ack => Ok(()),
            other => Err(IpcClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Follow snapshot updates. The stream ends when the daemon closes the
    /// subscription; dropping it disconnects.
    pub async fn subscribe(&self) -> Result<SnapshotStream, IpcClientError> {
        let mut stream = self.connect().await?;
        let frame = RequestFrame::new(self.token.expose(), Request::Subscribe);
        frame::write_frame(&mut stream, &frame, self.max_frame_bytes).await?;

        let max = self.max_frame_bytes;
        let timeout = self.timeout;
        let updates = async_stream::try_stream! {
            loop {
                let response = frame::recv::<_, Response>(&mut stream, max, timeout)
                    .await
                    .map_err(IpcClientError::from)?;
                match response {
                    Some(Response::StateSnapshot { snapshot }) => yield *snapshot,
                    Some(Response::Error { error_kind, message }) => {
                        Err::<(), IpcClientError>(IpcClientError::Daemon {
                            kind: error_kind,
                            message,
                        })?;
                    }
                    Some(other) => {
                        Err::<(), IpcClientError>(IpcClientError::UnexpectedResponse(format!(
                            "{other:?}"
                        )))?;
                    }
                    None => break,
                }
            }
        };
        Ok(Box::pin(updates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_not_running_when_socket_missing() {
        let tmp = TempDir::new().unwrap();
        let client = IpcClient::new(tmp.path().join("absent.sock"), IpcToken::generate());
        assert!(!client.daemon_available());
        assert!(matches!(
            client.get_state().await,
            Err(IpcClientError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_daemon_error_is_surfaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fake.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: RequestFrame = frame::recv(&mut stream, 4096, Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(req.token, "tok");
            let reply = Response::error(ErrorKind::Unauthorized, "nope");
            frame::write_frame(&mut stream, &reply, 4096).await.unwrap();
        });

        let client = IpcClient::new(&path, IpcToken::new("tok").unwrap());
        let err = client.get_state().await.unwrap_err();
        assert_eq!(err.daemon_kind(), Some(ErrorKind::Unauthorized));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("silent.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let client = IpcClient::new(&path, IpcToken::generate())
            .with_timeout(Duration::from_millis(100));
        let err = client.get_state().await.unwrap_err();
        assert!(matches!(
            err,
            IpcClientError::Protocol(ProtocolError::Timeout(_))
        ));
        server.await.unwrap();
    }
}
