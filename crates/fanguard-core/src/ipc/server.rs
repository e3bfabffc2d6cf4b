//! IPC server: framed JSON requests over a Unix domain socket.
//!
//! One accept task plus one task per connection. Connections reach the
//! control loop only through the bounded command queue and the snapshot
//! watch, so a misbehaving client can never block the loop.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fanguard_config::AppConfig;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::frame::{self, ProtocolError};
use super::types::{ErrorKind, Request, RequestFrame, Response};
use crate::auth::{Authenticated, IpcToken, PeerInfo, PeerSession};
use crate::control::{ControlCommand, SnapshotReceiver};
use crate::daemon::ShutdownSignal;

/// Socket file mode: owner and group may connect.
pub const SOCKET_MODE: u32 = 0o660;

/// Framing limits and timeouts.
#[derive(Debug, Clone, Copy)]
pub struct IpcLimits {
    pub max_frame_bytes: usize,
    pub request_timeout: Duration,
    pub reply_timeout: Duration,
}

impl IpcLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_frame_bytes: config.daemon.max_frame_bytes,
            request_timeout: Duration::from_millis(config.daemon.request_timeout_ms),
            reply_timeout: Duration::from_millis(config.daemon.reply_timeout_ms),
        }
    }
}

/// Shared state accessible to every connection task.
pub struct IpcState {
    pub snapshots: SnapshotReceiver,
    pub commands: mpsc::Sender<ControlCommand>,
    pub token: IpcToken,
    pub limits: IpcLimits,
}

/// Bind the socket, removing a stale socket file left by a previous run.
///
/// Fails with `AddrInUse` when another daemon is answering on the path.
pub async fn bind(socket_path: &Path) -> io::Result<UnixListener> {
    if socket_path.exists() {
        if UnixStream::connect(socket_path).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("another daemon is listening on {}", socket_path.display()),
            ));
        }
        debug!(path = %socket_path.display(), "Removing stale socket");
        std::fs::remove_file(socket_path)?;
    }

    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(listener)
}

/// Serve IPC on `socket_path` until the shutdown signal.
///
/// Open connections are given the request timeout to finish after shutdown
/// is signalled, then aborted. The socket file is removed on exit.
pub async fn serve(
    socket_path: &Path,
    state: Arc<IpcState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> io::Result<()> {
    let listener = bind(socket_path).await?;
    info!(path = %socket_path.display(), "IPC server listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("IPC server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown_rx.resubscribe();
                    connections.spawn(handle_connection(stream, state, shutdown));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept IPC connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(state.limits.request_timeout, drain).await.is_err() {
        warn!(open = connections.len(), "Aborting IPC connections still open after shutdown");
        connections.abort_all();
    }

    std::fs::remove_file(socket_path).ok();
    Ok(())
}

fn peer_info(stream: &UnixStream) -> PeerInfo {
    match stream.peer_cred() {
        Ok(cred) => PeerInfo {
            uid: Some(cred.uid()),
            pid: cred.pid(),
        },
        Err(_) => PeerInfo::default(),
    }
}

/// Whether a request needs the rest of the connection.
enum Flow {
    Continue,
    Close,
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<IpcState>,
    mut shutdown: broadcast::Receiver<ShutdownSignal>,
) {
    let peer = peer_info(&stream);
    debug!(%peer, "IPC connection opened");
    let (mut reader, mut writer) = stream.into_split();
    let limits = state.limits;

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            r = frame::recv::<_, RequestFrame>(&mut reader, limits.max_frame_bytes, limits.request_timeout) => r,
        };

        let request = match received {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                reject(&mut writer, &e, limits.max_frame_bytes, peer).await;
                break;
            }
        };

        let session = match PeerSession::new(peer).authenticate(&request.token, &state.token) {
            Ok(session) => session,
            Err(_) => {
                reject(&mut writer, &ProtocolError::Unauthorized, limits.max_frame_bytes, peer).await;
                break;
            }
        };

        let flow = match dispatch(&session, &request.request, &state, &mut reader, &mut writer, &mut shutdown).await {
            Ok(flow) => flow,
            Err(e) => {
                debug!(%peer, error = %e, "IPC connection ended");
                Flow::Close
            }
        };
        if matches!(flow, Flow::Close) {
            break;
        }
    }

    debug!(%peer, "IPC connection closed");
}

/// Report a protocol error to the peer when the transport allows it.
async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, err: &ProtocolError, max: usize, peer: PeerInfo) {
    warn!(%peer, error = %err, "Rejecting IPC request");
    if let Some(kind) = err.kind() {
        let response = Response::error(kind, err.to_string());
        if let Err(e) = frame::write_frame(writer, &response, max).await {
            debug!(%peer, error = %e, "Could not deliver error response");
        }
    }
}

async fn dispatch(
    session: &PeerSession<Authenticated>,
    request: &Request,
    state: &IpcState,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut broadcast::Receiver<ShutdownSignal>,
) -> Result<Flow, ProtocolError> {
    let max = state.limits.max_frame_bytes;
    debug!(peer = %session.peer(), request = request.name(), "IPC request");

    match request {
        Request::GetState => {
            let snapshot = Arc::clone(&state.snapshots.borrow());
            frame::write_frame(writer, &Response::snapshot(&snapshot), max).await?;
            Ok(Flow::Continue)
        }
        Request::SetPolicy { policy } => {
            let response = set_policy(session, policy, state).await;
            frame::write_frame(writer, &response, max).await?;
            Ok(Flow::Continue)
        }
        Request::Subscribe => {
            subscribe(session, state, reader, writer, shutdown).await?;
            Ok(Flow::Close)
        }
    }
}

async fn set_policy(
    session: &PeerSession<Authenticated>,
    policy: &fanguard_config::ControlPolicy,
    state: &IpcState,
) -> Response {
    if let Err(e) = policy.validate() {
        info!(peer = %session.peer(), error = %e, "Rejected invalid policy");
        return Response::from(&e);
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let command = ControlCommand::SetPolicy {
        policy: Box::new(policy.clone()),
        reply: reply_tx,
    };
    match state.commands.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(peer = %session.peer(), "Command queue full");
            return Response::error(ErrorKind::Busy, "command queue is full, retry later");
        }
        Err(TrySendError::Closed(_)) => {
            return Response::error(ErrorKind::Unavailable, "control loop is not running");
        }
    }

    match tokio::time::timeout(state.limits.reply_timeout, reply_rx).await {
        Ok(Ok(Ok(()))) => {
            info!(peer = %session.peer(), "Policy updated via IPC");
            Response::Ack
        }
        Ok(Ok(Err(e))) => Response::from(e),
        Ok(Err(_)) => Response::error(ErrorKind::Unavailable, "control loop stopped before applying the policy"),
        Err(_) => Response::error(
            ErrorKind::Timeout,
            format!(
                "control loop did not apply the policy within {:?}",
                state.limits.reply_timeout
            ),
        ),
    }
}

/// Stream snapshots until the client hangs up, the loop's watch closes or
/// the daemon shuts down.
async fn subscribe(
    session: &PeerSession<Authenticated>,
    state: &IpcState,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut broadcast::Receiver<ShutdownSignal>,
) -> Result<(), ProtocolError> {
    let max = state.limits.max_frame_bytes;
    let mut snapshots = state.snapshots.clone();
    let mut last_generation = None;
    let mut hangup = [0u8; 1];
    info!(peer = %session.peer(), "Subscription started");

    loop {
        let snapshot = Arc::clone(&snapshots.borrow_and_update());
        if last_generation.is_none_or(|g| snapshot.generation > g) {
            last_generation = Some(snapshot.generation);
            frame::write_frame(writer, &Response::snapshot(&snapshot), max).await?;
        }

        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            // Subscribers only listen; any input or EOF ends the stream.
            _ = reader.read(&mut hangup) => break,
        }
    }

    debug!(peer = %session.peer(), "Subscription ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_sets_mode_and_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run/fanguard.sock");

        let listener = bind(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);

        // Live listener: refuse to steal the path.
        let err = bind(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        // Dead listener leaves a stale file behind.
        drop(listener);
        assert!(path.exists());
        let _listener = bind(&path).await.unwrap();
    }

    #[test]
    fn test_limits_from_config() {
        let mut config = AppConfig::default();
        config.daemon.request_timeout_ms = 250;
        let limits = IpcLimits::from_config(&config);
        assert_eq!(limits.request_timeout, Duration::from_millis(250));
        assert_eq!(limits.max_frame_bytes, 64 * 1024);
    }
}
