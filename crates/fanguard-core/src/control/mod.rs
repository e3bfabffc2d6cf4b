//! Control loop: the single owner of the hardware adapter.
//!
//! ```text
//! Starting ──init ok──▶ Running ◀──clean tick── Degraded
//!    │                    │  └──N failing ticks──▶ ▲
//!    └──N init failures───┼────────────────────────┘
//!                         ▼
//!                   ShuttingDown ──safety applied──▶ Stopped
//! ```
//!
//! Each tick drains queued commands, reads every sensor, evaluates the
//! policy with hysteresis, writes duties and publishes a
//! [`RuntimeSnapshot`] through a watch channel.

pub mod state;
pub mod tracker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use fanguard_config::{AppConfig, ControlPolicy, FanChannel, PolicyStore, ValidationError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::daemon::ShutdownSignal;
use crate::hardware::{AdapterError, AdapterSettings, HardwareAdapter, Offline, Online};

pub use state::{AdapterHealth, ChannelStatus, LoopState, RuntimeSnapshot};
pub use tracker::ChannelTracker;

/// Receiving end of the snapshot watch.
pub type SnapshotReceiver = watch::Receiver<Arc<RuntimeSnapshot>>;

/// A request queued for the control loop.
#[derive(Debug)]
pub enum ControlCommand {
    /// Replace the active policy. The reply is sent once the policy is
    /// persisted and active, or rejected.
    SetPolicy {
        policy: Box<ControlPolicy>,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
}

/// Why a command was rejected by the loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to persist policy: {0}")]
    Storage(String),
}

/// Fatal control loop errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("hardware unavailable after {attempts} initialization attempts: {source}")]
    AdapterUnavailable {
        attempts: u32,
        #[source]
        source: AdapterError,
    },
}

/// Timing and thresholds for the loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub adapter: AdapterSettings,
    pub degraded_threshold: u32,
    pub degraded_interval: Duration,
    pub staleness_ticks: u32,
    pub init_failure_threshold: u32,
    pub init_max_attempts: u32,
    pub init_backoff_initial: Duration,
    pub init_backoff_max: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let c = &config.control;
        Self {
            adapter: AdapterSettings::from_config(config),
            degraded_threshold: c.degraded_threshold,
            degraded_interval: Duration::from_millis(c.degraded_interval_ms),
            staleness_ticks: c.staleness_ticks,
            init_failure_threshold: c.init_failure_threshold,
            init_max_attempts: c.init_max_attempts,
            init_backoff_initial: Duration::from_millis(c.init_backoff_initial_ms),
            init_backoff_max: Duration::from_millis(c.init_backoff_max_ms),
        }
    }
}

/// Why the loop stopped waiting between ticks.
enum Wake {
    Timer,
    Command(ControlCommand),
    Shutdown,
}

/// Owns the adapter, the active policy and the runtime state.
pub struct ControlLoop {
    settings: LoopSettings,
    policy: ControlPolicy,
    store: PolicyStore,
    commands: mpsc::Receiver<ControlCommand>,
    trackers: [ChannelTracker; 2],
    channels: [ChannelStatus; 2],
    state: LoopState,
    health: AdapterHealth,
    tick: u64,
    generation: u64,
    started_at: Instant,
    snapshots: watch::Sender<Arc<RuntimeSnapshot>>,
}

impl ControlLoop {
    /// Create the loop and the watch its snapshots are published on.
    pub fn new(
        settings: LoopSettings,
        policy: ControlPolicy,
        store: PolicyStore,
        commands: mpsc::Receiver<ControlCommand>,
        driver_name: &str,
    ) -> (Self, SnapshotReceiver) {
        let health = AdapterHealth {
            driver: driver_name.to_string(),
            ..Default::default()
        };
        let channels = FanChannel::ALL.map(ChannelStatus::new);
        let initial = RuntimeSnapshot {
            generation: 0,
            state: LoopState::Starting,
            channels: channels.to_vec(),
            policy: policy.clone(),
            health: health.clone(),
            version: crate::build_info::version_string(),
            uptime_secs: 0,
        };
        let (snapshots, rx) = watch::channel(Arc::new(initial));

        let this = Self {
            settings,
            policy,
            store,
            commands,
            trackers: Default::default(),
            channels,
            state: LoopState::Starting,
            health,
            tick: 0,
            generation: 0,
            started_at: Instant::now(),
            snapshots,
        };
        (this, rx)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn policy(&self) -> &ControlPolicy {
        &self.policy
    }

    /// Run until shutdown: initialize, tick, then apply the safety duty and
    /// release the hardware.
    pub async fn run(
        mut self,
        adapter: HardwareAdapter<Offline>,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> Result<(), ControlError> {
        let adapter = match self.start(adapter, &mut shutdown).await? {
            Some(online) => online,
            None => {
                self.set_state(LoopState::Stopped);
                self.publish();
                return Ok(());
            }
        };

        loop {
            self.tick(&adapter).await;

            let sleep = tokio::time::sleep(self.interval());
            tokio::pin!(sleep);
            let wake = tokio::select! {
                biased;
                _ = shutdown.recv() => Wake::Shutdown,
                Some(cmd) = self.commands.recv() => Wake::Command(cmd),
                _ = &mut sleep => Wake::Timer,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Command(cmd) => {
                    debug!("Command received between ticks, ticking early");
                    self.apply_command(cmd).await;
                }
                Wake::Timer => {}
            }
        }

        self.shutdown(adapter).await;
        Ok(())
    }

    /// Bring the adapter online, retrying with exponential backoff.
    ///
    /// Returns `Ok(None)` when shutdown was requested before the hardware
    /// came up.
    pub async fn start(
        &mut self,
        mut adapter: HardwareAdapter<Offline>,
        shutdown: &mut broadcast::Receiver<ShutdownSignal>,
    ) -> Result<Option<HardwareAdapter<Online>>, ControlError> {
        let mut backoff = self.settings.init_backoff_initial;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.health.init_attempts = attempt;

            match adapter.initialize().await {
                Ok(online) => {
                    info!(
                        driver = %online.driver_name(),
                        attempt,
                        "Hardware initialized, control loop running"
                    );
                    self.health.consecutive_failures = 0;
                    self.set_state(LoopState::Running);
                    self.publish();
                    return Ok(Some(online));
                }
                Err((offline, err)) => {
                    adapter = offline;
                    self.record_failures(1, Some(&err));
                    warn!(attempt, error = %err, "Hardware initialization failed");

                    if attempt >= self.settings.init_max_attempts {
                        error!(attempt, "Giving up on hardware initialization");
                        adapter.force_safety().await;
                        self.set_state(LoopState::Stopped);
                        self.publish();
                        return Err(ControlError::AdapterUnavailable {
                            attempts: attempt,
                            source: err,
                        });
                    }

                    if attempt >= self.settings.init_failure_threshold {
                        if self.state != LoopState::Degraded {
                            warn!(attempt, "Hardware still unavailable, entering degraded mode");
                            self.set_state(LoopState::Degraded);
                        }
                        if !adapter.force_safety().await {
                            debug!("Safety duty could not be applied while offline");
                        }
                    }
                    self.publish();
                }
            }

            let sleep = tokio::time::sleep(backoff);
            tokio::pin!(sleep);
            loop {
                let wake = tokio::select! {
                    biased;
                    _ = shutdown.recv() => Wake::Shutdown,
                    Some(cmd) = self.commands.recv() => Wake::Command(cmd),
                    _ = &mut sleep => Wake::Timer,
                };
                match wake {
                    Wake::Shutdown => {
                        info!("Shutdown requested during hardware initialization");
                        self.set_state(LoopState::ShuttingDown);
                        self.publish();
                        adapter.force_safety().await;
                        return Ok(None);
                    }
                    Wake::Command(cmd) => self.apply_command(cmd).await,
                    Wake::Timer => break,
                }
            }
            backoff = (backoff * 2).min(self.settings.init_backoff_max);
        }
    }

    /// One control cycle.
    pub async fn tick(&mut self, adapter: &HardwareAdapter<Online>) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.apply_command(cmd).await;
        }

        self.tick += 1;
        match self.state {
            LoopState::Degraded => self.degraded_tick(adapter).await,
            _ => self.running_tick(adapter).await,
        }
        self.publish();
    }

    async fn running_tick(&mut self, adapter: &HardwareAdapter<Online>) {
        let safety = self.settings.adapter.safety_duty;
        let mut failures = 0u32;
        let mut last_error = None;
        let mut values = [None; 2];
        let mut targets = [safety; 2];

        for channel in FanChannel::ALL {
            let i = channel.index();
            values[i] = match adapter.read_temperature(channel.sensor()).await {
                Ok(reading) => Some(self.trackers[i].record(
                    reading.value,
                    self.tick,
                    self.policy.smoothing_window,
                )),
                Err(e) => {
                    warn!(%channel, error = %e, "Temperature read failed");
                    failures += 1;
                    last_error = Some(e);
                    self.trackers[i].cached(self.tick, self.settings.staleness_ticks)
                }
            };

            let status = &mut self.channels[i];
            status.temperature = self.trackers[i].last_raw();
            status.reading_age_ticks = self.trackers[i].age(self.tick);
            status.smoothed = values[i];
        }

        for channel in FanChannel::ALL {
            let i = channel.index();
            let curve = self.policy.curve(channel);
            let own = match values[i] {
                Some(v) => self.trackers[i].target(curve, v).1,
                None => {
                    warn!(%channel, duty = safety, "No usable reading, requesting safety duty");
                    safety
                }
            };
            let cross = curve.cross.as_deref().map(|cross| {
                match values[channel.other().index()] {
                    Some(v) => self.trackers[i].cross_target(cross, v),
                    None => {
                        warn!(%channel, duty = safety, "No usable reading for the cross curve, requesting safety duty");
                        safety
                    }
                }
            });
            targets[i] = cross.map_or(own, |cross| own.max(cross));
            self.channels[i].band = self.trackers[i].band();
        }

        if self.policy.fan_sync {
            let max = targets.iter().copied().max().unwrap_or(safety);
            targets = [max; 2];
        }

        for channel in FanChannel::ALL {
            let i = channel.index();
            self.channels[i].target_duty = Some(targets[i]);
            match adapter.set_duty(channel, targets[i]).await {
                Ok(applied) => {
                    if self.channels[i].applied_duty != Some(applied) {
                        debug!(%channel, duty = applied, "Fan duty changed");
                    }
                    self.channels[i].applied_duty = Some(applied);
                }
                Err(e) => {
                    warn!(%channel, error = %e, "Fan duty write failed");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        self.record_failures(failures, last_error.as_ref());

        if self.health.consecutive_failures >= self.settings.degraded_threshold {
            warn!(
                consecutive_failures = self.health.consecutive_failures,
                "Hardware failure threshold reached, entering degraded mode"
            );
            self.set_state(LoopState::Degraded);
            self.apply_safety(adapter).await;
        }
    }

    async fn degraded_tick(&mut self, adapter: &HardwareAdapter<Online>) {
        let mut failures = 0u32;
        let mut last_error = None;

        for channel in FanChannel::ALL {
            let i = channel.index();
            match adapter.read_temperature(channel.sensor()).await {
                Ok(reading) => {
                    let v = self.trackers[i].record(
                        reading.value,
                        self.tick,
                        self.policy.smoothing_window,
                    );
                    self.channels[i].smoothed = Some(v);
                }
                Err(e) => {
                    debug!(%channel, error = %e, "Temperature read failed while degraded");
                    failures += 1;
                    last_error = Some(e);
                    self.channels[i].smoothed = None;
                }
            }
            self.channels[i].temperature = self.trackers[i].last_raw();
            self.channels[i].reading_age_ticks = self.trackers[i].age(self.tick);
        }

        let write_failures = self.apply_safety(adapter).await;
        failures += write_failures.len() as u32;
        if let Some(e) = write_failures.into_iter().last() {
            last_error = Some(e);
        }

        self.record_failures(failures, last_error.as_ref());

        if failures == 0 {
            info!("Hardware healthy again, resuming normal control");
            for tracker in &mut self.trackers {
                tracker.reset();
            }
            for status in &mut self.channels {
                status.band = None;
            }
            self.set_state(LoopState::Running);
        }
    }

    /// Write the safety duty everywhere and return the failed writes.
    async fn apply_safety(&mut self, adapter: &HardwareAdapter<Online>) -> Vec<AdapterError> {
        let safety = self.settings.adapter.safety_duty;
        let mut failed = Vec::new();
        for (channel, result) in FanChannel::ALL.into_iter().zip(adapter.apply_safety().await) {
            let status = &mut self.channels[channel.index()];
            status.target_duty = Some(safety);
            match result {
                Ok(applied) => status.applied_duty = Some(applied),
                Err(e) => {
                    warn!(%channel, error = %e, "Safety duty write failed");
                    failed.push(e);
                }
            }
        }
        failed
    }

    /// Enter `ShuttingDown`, apply the safety duty and release the adapter.
    pub async fn shutdown(&mut self, adapter: HardwareAdapter<Online>) {
        info!("Control loop shutting down");
        self.set_state(LoopState::ShuttingDown);
        self.publish();

        let safety = self.settings.adapter.safety_duty;
        let results = adapter.shutdown().await;
        for (channel, result) in FanChannel::ALL.into_iter().zip(results) {
            let status = &mut self.channels[channel.index()];
            status.target_duty = Some(safety);
            if let Ok(applied) = result {
                status.applied_duty = Some(applied);
            }
        }

        self.set_state(LoopState::Stopped);
        self.publish();
        info!(duty = safety, "Safety duty applied, hardware released");
    }

    async fn apply_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::SetPolicy { policy, reply } => {
                // The caller was already told the request timed out.
                if reply.is_closed() {
                    warn!("Dropping policy change whose caller timed out");
                    return;
                }
                let result = self.replace_policy(*policy).await;
                if reply.send(result).is_err() {
                    debug!("SetPolicy caller went away before the reply");
                }
                self.publish();
            }
        }
    }

    /// Validate, persist, then swap in a new policy.
    async fn replace_policy(&mut self, policy: ControlPolicy) -> Result<(), CommandError> {
        if let Err(e) = policy.validate() {
            warn!(error = %e, "Rejected policy");
            return Err(e.into());
        }
        if let Err(e) = self.store.save(&policy).await {
            error!(path = %self.store.path().display(), error = %e, "Failed to persist policy");
            return Err(CommandError::Storage(e.to_string()));
        }

        self.policy = policy;
        for tracker in &mut self.trackers {
            tracker.reset();
        }
        for status in &mut self.channels {
            status.band = None;
        }
        info!(
            sample_interval_ms = self.policy.sample_interval_ms,
            fan_sync = self.policy.fan_sync,
            "Policy replaced"
        );
        Ok(())
    }

    fn record_failures(&mut self, failures: u32, last_error: Option<&AdapterError>) {
        if failures == 0 {
            self.health.consecutive_failures = 0;
            return;
        }
        self.health.consecutive_failures += 1;
        self.health.total_failures += u64::from(failures);
        if let Some(e) = last_error {
            self.health.last_error = Some(e.to_string());
        }
    }

    fn interval(&self) -> Duration {
        match self.state {
            LoopState::Degraded => self.settings.degraded_interval,
            _ => Duration::from_millis(self.policy.sample_interval_ms),
        }
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Control loop state change");
            self.state = state;
        }
    }

    fn publish(&mut self) {
        self.generation += 1;
        let snapshot = RuntimeSnapshot {
            generation: self.generation,
            state: self.state,
            channels: self.channels.to_vec(),
            policy: self.policy.clone(),
            health: self.health.clone(),
            version: crate::build_info::version_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}
