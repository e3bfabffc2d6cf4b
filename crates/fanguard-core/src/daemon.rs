//! Daemon process: startup checks, task wiring and graceful shutdown.
//!
//! ```text
//!            ┌──────────────┐  mpsc<ControlCommand>  ┌──────────────┐
//!  clients ─▶│  IPC server  │───────────────────────▶│ control loop │──▶ adapter
//!            │ (per-conn    │◀───────────────────────│ (owns the    │
//!            │  tasks)      │ watch<RuntimeSnapshot> │  hardware)   │
//!            └──────────────┘                        └──────────────┘
//!                   ▲                                       ▲
//!                   └──────── broadcast<ShutdownSignal> ────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fanguard_config::{AppConfig, ConfigError, PolicyStore};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::auth::{IpcToken, LocalIdentity};
use crate::build_info;
use crate::control::{ControlError, ControlLoop, LoopSettings};
use crate::hardware::{AdapterSettings, FanDriver, HardwareAdapter, driver_from_config};
use crate::ipc::server::{self, IpcLimits, IpcState};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

// ── Exit codes (sysexits.h) ─────────────────────────────────────────────

/// Hardware could not be acquired (`EX_UNAVAILABLE`).
pub const EXIT_ADAPTER_UNAVAILABLE: u8 = 69;
/// Internal error or task panic (`EX_SOFTWARE`).
pub const EXIT_UNHANDLED_FAULT: u8 = 70;
/// Daemon configuration unreadable or invalid (`EX_CONFIG`).
pub const EXIT_CONFIG_CORRUPT: u8 = 78;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("hardware unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("configuration corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("unhandled fault: {0}")]
    UnhandledFault(String),
}

impl DaemonError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::AdapterUnavailable(_) => EXIT_ADAPTER_UNAVAILABLE,
            DaemonError::ConfigCorrupt(_) => EXIT_CONFIG_CORRUPT,
            DaemonError::UnhandledFault(_) => EXIT_UNHANDLED_FAULT,
        }
    }
}

impl From<ConfigError> for DaemonError {
    fn from(e: ConfigError) -> Self {
        DaemonError::ConfigCorrupt(e.to_string())
    }
}

impl From<ControlError> for DaemonError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::AdapterUnavailable { .. } => DaemonError::AdapterUnavailable(e.to_string()),
        }
    }
}

/// Refuse to drive real hardware without root.
pub fn check_privilege(config: &AppConfig, identity: &LocalIdentity) -> Result<(), DaemonError> {
    if !config.hardware.require_privilege || identity.is_privileged {
        return Ok(());
    }
    Err(DaemonError::AdapterUnavailable(format!(
        "hardware access requires root, running as {} (uid {})",
        identity.username, identity.uid
    )))
}

/// The fanguard daemon.
pub struct Daemon {
    config: AppConfig,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl Daemon {
    /// Create a new daemon instance with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            shutdown_tx,
        }
    }

    /// Run with the driver selected by `[hardware]` until shutdown.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_with_driver(driver_from_config(&self.config)).await
    }

    /// Run with an explicit driver until shutdown.
    ///
    /// Returns once the control loop has applied the safety duty and
    /// released the hardware, and the IPC socket is gone.
    pub async fn run_with_driver(&self, driver: Box<dyn FanDriver>) -> Result<(), DaemonError> {
        let config = &self.config;
        info!(
            version = %build_info::version_string(),
            backend = %config.hardware.backend,
            socket = %config.daemon.socket_path,
            "fanguard daemon starting"
        );

        check_privilege(config, &LocalIdentity::detect())?;

        let token = IpcToken::load(Path::new(&config.auth.token_path))
            .await
            .map_err(|e| DaemonError::ConfigCorrupt(e.to_string()))?;

        let store = PolicyStore::new(&config.daemon.policy_path);
        let policy = store.load_or(config.default_policy()).await;

        let (command_tx, command_rx) = mpsc::channel(config.daemon.command_queue_depth);
        let adapter = HardwareAdapter::new(driver, AdapterSettings::from_config(config));
        let (control, snapshots) = ControlLoop::new(
            LoopSettings::from_config(config),
            policy,
            store,
            command_rx,
            adapter.driver_name(),
        );

        // Subscribe before spawning so an early shutdown is never missed.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut control_task = tokio::spawn(control.run(adapter, self.shutdown_tx.subscribe()));

        let ipc_state = Arc::new(IpcState {
            snapshots,
            commands: command_tx,
            token,
            limits: IpcLimits::from_config(config),
        });
        let socket_path = PathBuf::from(&config.daemon.socket_path);
        let ipc_shutdown = self.shutdown_tx.subscribe();
        let ipc_task = tokio::spawn(async move {
            if let Err(e) = server::serve(&socket_path, ipc_state, ipc_shutdown).await {
                error!(
                    path = %socket_path.display(),
                    error = %e,
                    "IPC server failed; fan control continues without IPC"
                );
            }
        });

        let finished = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
                None
            }
            _ = ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                None
            }
            _ = terminate() => {
                info!("SIGTERM received, initiating graceful shutdown");
                None
            }
            joined = &mut control_task => Some(joined),
        };
        let _ = self.shutdown_tx.send(ShutdownSignal);

        let joined = match finished {
            Some(joined) => joined,
            None => control_task.await,
        };
        if let Err(e) = ipc_task.await {
            warn!(error = %e, "IPC server task ended abnormally");
        }

        match joined {
            Ok(Ok(())) => {
                info!("Daemon stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Control loop failed");
                Err(e.into())
            }
            Err(e) => {
                error!(error = %e, "Control loop task aborted");
                Err(DaemonError::UnhandledFault(format!("control loop task: {e}")))
            }
        }
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}
