//! In-process daemon harness.
//!
//! [`TestDaemon`] runs a real [`Daemon`] on the simulated driver with its
//! socket, token and policy files in an owned temp directory. The directory
//! is deleted when the harness is dropped, even on panic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fanguard_config::{AppConfig, ControlPolicy, PolicyStore};
use fanguard_core::hardware::sim::{SimHandle, SimulatedDriver};
use fanguard_core::{Daemon, DaemonError, IpcClient, IpcToken, RuntimeSnapshot};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::config::TestConfigBuilder;

/// How long harness helpers wait before failing the test.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// A daemon running on the simulated driver for the duration of a test.
pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub sim: SimHandle,
    pub token: IpcToken,
    task: Option<JoinHandle<Result<(), DaemonError>>>,
    _temp_dir: TempDir,
}

impl TestDaemon {
    /// Start with the default test config.
    pub async fn start() -> Self {
        Self::start_with(TestConfigBuilder::new()).await
    }

    /// Start with a customised config.
    pub async fn start_with(builder: TestConfigBuilder) -> Self {
        Self::spawn(builder, None, |_| {}).await
    }

    /// Start with `policy` already persisted, after `setup` has scripted
    /// the simulated hardware.
    pub async fn spawn(
        builder: TestConfigBuilder,
        policy: Option<ControlPolicy>,
        setup: impl FnOnce(&SimHandle),
    ) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = builder.paths_in(temp_dir.path()).build();

        let token = IpcToken::generate();
        token
            .write(Path::new(&config.auth.token_path), false)
            .await
            .expect("failed to write test token");

        if let Some(policy) = policy {
            PolicyStore::new(&config.daemon.policy_path)
                .save(&policy)
                .await
                .expect("failed to persist test policy");
        }

        let (driver, sim) = SimulatedDriver::new();
        setup(&sim);

        let socket_path = PathBuf::from(&config.daemon.socket_path);
        let daemon = Arc::new(Daemon::new(config));
        let runner = Arc::clone(&daemon);
        let task = tokio::spawn(async move { runner.run_with_driver(Box::new(driver)).await });

        let started = tokio::time::timeout(WAIT_LIMIT, async {
            while !socket_path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(started.is_ok(), "daemon socket never appeared");

        Self {
            daemon,
            sim,
            token,
            task: Some(task),
            _temp_dir: temp_dir,
        }
    }

    pub fn config(&self) -> &AppConfig {
        self.daemon.config()
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.config().daemon.socket_path)
    }

    pub fn policy_path(&self) -> PathBuf {
        PathBuf::from(&self.config().daemon.policy_path)
    }

    /// Client holding the daemon's token.
    pub fn client(&self) -> IpcClient {
        IpcClient::new(self.socket_path(), self.token.clone())
    }

    /// Poll the daemon until `pred` holds for its snapshot.
    pub async fn wait_for(&self, pred: impl Fn(&RuntimeSnapshot) -> bool) -> RuntimeSnapshot {
        let client = self.client();
        let found = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                if let Ok(snapshot) = client.get_state().await {
                    if pred(&snapshot) {
                        return snapshot;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        found.expect("daemon never reached the expected state")
    }

    /// Request shutdown and wait for the daemon to exit.
    pub async fn stop(mut self) -> Result<(), DaemonError> {
        self.daemon.shutdown();
        let task = self.task.take().expect("daemon task already joined");
        tokio::time::timeout(WAIT_LIMIT, task)
            .await
            .expect("daemon did not stop in time")
            .expect("daemon task panicked")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.daemon.shutdown();
        }
    }
}
