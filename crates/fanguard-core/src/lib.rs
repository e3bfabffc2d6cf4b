#![deny(unsafe_code)]

//! fanguard core runtime.
//!
//! The privileged half of fanguard: a control loop that owns the fan
//! hardware, applies the active temperature policy every tick, and falls
//! back to a fixed safety duty whenever it cannot trust the readings. Local
//! unprivileged clients observe and reconfigure it over an authenticated
//! Unix-socket IPC channel.

/// Shared-token authentication for IPC peers and local identity detection.
pub mod auth;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Control loop, hysteresis trackers and published runtime state.
pub mod control;
/// Daemon wiring, signal handling and exit codes.
pub mod daemon;
/// Hardware adapter and fan drivers.
pub mod hardware;
/// Length-prefixed JSON IPC: codec, server and client.
pub mod ipc;
/// Tracing subscriber setup.
pub mod logging;

pub use auth::{IpcToken, LocalIdentity};
pub use control::{LoopState, RuntimeSnapshot};
pub use daemon::{Daemon, DaemonError, ShutdownSignal};
pub use hardware::{AdapterError, FanDriver, HardwareAdapter};
pub use ipc::{IpcClient, IpcClientError};
