//! Daemon IPC: framed JSON over a Unix domain socket.
//!
//! The daemon exposes three operations to local clients: read the latest
//! state, replace the policy, and follow state updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐        Unix socket         ┌──────────────┐   mpsc    ┌──────────────┐
//! │   CLI    │───────────────────────────▶│  IPC Server  │──────────▶│ Control Loop │
//! │          │  u32 length + JSON frames  │ (task/conn)  │◀──────────│              │
//! └──────────┘                            └──────────────┘   watch   └──────────────┘
//! ```

pub mod client;
pub mod frame;
pub mod server;
pub mod types;

pub use client::{IpcClient, IpcClientError, SnapshotStream};
pub use frame::ProtocolError;
pub use server::{IpcLimits, IpcState};
pub use types::*;
