//! Hardware adapter: the only path from the control loop to the fans.
//!
//! A [`FanDriver`] is the raw vendor interface: synchronous, possibly slow,
//! possibly failing. [`HardwareAdapter`] wraps it with:
//!
//! - typed errors ([`AdapterError`]) with a fixed set of variants,
//! - duty clamping to the configured `[floor, ceiling]`,
//! - a per-call timeout (calls run on the blocking pool),
//! - serialized access (one call in flight at a time),
//! - a drop guard that writes the safety duty if an online adapter is
//!   dropped without an explicit [`HardwareAdapter::shutdown`].
//!
//! The adapter follows a type-state lifecycle:
//!
//! ```text
//! HardwareAdapter<Offline> ──initialize()──▶ HardwareAdapter<Online> ──shutdown()──▶ (released)
//!        ▲        │
//!        └────────┘ on failure the offline adapter is handed back for retry
//! ```

/// Linux sysfs hwmon backend.
pub mod hwmon;
/// In-memory backend for tests and dry runs.
pub mod sim;

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use fanguard_config::policy::DeciCelsius;
use fanguard_config::{AppConfig, FanChannel, SensorId};
use tracing::{debug, error, warn};

pub use hwmon::HwmonDriver;
pub use sim::{SimHandle, SimulatedDriver};

/// Failure reported by a raw driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverFault {
    #[error("device not present: {0}")]
    NotPresent(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

/// The raw vendor interface.
///
/// Implementations may block. They are never called concurrently.
pub trait FanDriver: Send + 'static {
    /// Short backend name for logs and snapshots.
    fn name(&self) -> &str;

    /// Acquire the device.
    fn initialize(&mut self) -> Result<(), DriverFault>;

    /// Read a sensor in tenths of a degree Celsius.
    fn read_sensor(&mut self, sensor: SensorId) -> Result<DeciCelsius, DriverFault>;

    /// Command a fan duty in percent. `percent` is always within `[0, 100]`.
    fn set_duty(&mut self, channel: FanChannel, percent: u8) -> Result<(), DriverFault>;

    /// Release the device.
    fn shutdown(&mut self);
}

/// Normalized hardware errors seen by the control loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("hardware unavailable: {0}")]
    Unavailable(String),

    #[error("transient hardware failure: {0}")]
    Transient(String),

    #[error("implausible {sensor} reading: {value}")]
    InvalidReading { sensor: SensorId, value: DeciCelsius },
}

impl AdapterError {
    /// Stable short name used in snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Unavailable(_) => "unavailable",
            AdapterError::Transient(_) => "transient",
            AdapterError::InvalidReading { .. } => "invalid_reading",
        }
    }
}

impl From<DriverFault> for AdapterError {
    fn from(fault: DriverFault) -> Self {
        match fault {
            DriverFault::NotPresent(_) | DriverFault::PermissionDenied(_) => {
                AdapterError::Unavailable(fault.to_string())
            }
            DriverFault::Busy(_) | DriverFault::Io(_) => AdapterError::Transient(fault.to_string()),
        }
    }
}

/// A validated sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Temperature {
    pub sensor: SensorId,
    pub value: DeciCelsius,
    pub taken_at: Instant,
}

/// Inclusive duty bounds applied to every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyLimits {
    pub floor: u8,
    pub ceiling: u8,
}

impl DutyLimits {
    /// Bounds are normalized so that `floor <= ceiling <= 100`.
    pub fn new(floor: u8, ceiling: u8) -> Self {
        let ceiling = ceiling.min(100);
        Self {
            floor: floor.min(ceiling),
            ceiling,
        }
    }

    pub fn clamp(&self, percent: u8) -> u8 {
        percent.clamp(self.floor, self.ceiling)
    }
}

/// Adapter tuning taken from the daemon configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    pub limits: DutyLimits,
    pub safety_duty: u8,
    pub call_timeout: Duration,
}

impl AdapterSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let limits = DutyLimits::new(config.safety.floor_percent, config.safety.ceiling_percent);
        Self {
            limits,
            safety_duty: limits.clamp(config.safety.safety_percent),
            call_timeout: Duration::from_millis(config.control.adapter_timeout_ms),
        }
    }
}

/// Adapter state: driver not yet acquired.
pub struct Offline;

/// Adapter state: driver acquired, reads and writes allowed.
pub struct Online;

type SharedDriver = Arc<Mutex<Box<dyn FanDriver>>>;

/// Typed, clamped, time-bounded access to a [`FanDriver`].
pub struct HardwareAdapter<S> {
    driver: SharedDriver,
    name: String,
    settings: AdapterSettings,
    /// Set while online until a safety write is confirmed; arms the drop
    /// guard.
    armed: bool,
    _state: PhantomData<S>,
}

impl<S> HardwareAdapter<S> {
    /// Backend name of the wrapped driver.
    pub fn driver_name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    fn transition<T>(&mut self, armed: bool) -> HardwareAdapter<T> {
        self.armed = false;
        HardwareAdapter {
            driver: Arc::clone(&self.driver),
            name: self.name.clone(),
            settings: self.settings,
            armed,
            _state: PhantomData,
        }
    }

    /// Run one driver call on the blocking pool, bounded by the call timeout.
    async fn call<T, F>(&self, what: &'static str, f: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn FanDriver) -> Result<T, DriverFault> + Send + 'static,
    {
        // A previous call that timed out may still hold the driver.
        match self.driver.try_lock() {
            Ok(_) | Err(TryLockError::Poisoned(_)) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(AdapterError::Transient(format!(
                    "{what}: previous hardware call still in flight"
                )));
            }
        }

        let driver = Arc::clone(&self.driver);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = driver.lock().unwrap_or_else(PoisonError::into_inner);
            f(guard.as_mut())
        });

        match tokio::time::timeout(self.settings.call_timeout, task).await {
            Ok(Ok(result)) => result.map_err(AdapterError::from),
            Ok(Err(join)) => Err(AdapterError::Transient(format!("{what} panicked: {join}"))),
            Err(_) => Err(AdapterError::Transient(format!(
                "{what} timed out after {:?}",
                self.settings.call_timeout
            ))),
        }
    }
}

impl HardwareAdapter<Offline> {
    /// Wrap a driver. Nothing is touched until [`initialize`](Self::initialize).
    pub fn new(driver: Box<dyn FanDriver>, settings: AdapterSettings) -> Self {
        let name = driver.name().to_string();
        Self {
            driver: Arc::new(Mutex::new(driver)),
            name,
            settings,
            armed: false,
            _state: PhantomData,
        }
    }

    /// Acquire the device. On failure the offline adapter is returned so the
    /// caller can retry.
    #[allow(clippy::result_large_err)]
    pub async fn initialize(mut self) -> Result<HardwareAdapter<Online>, (Self, AdapterError)> {
        match self.call("initialize", |d| d.initialize()).await {
            Ok(()) => {
                debug!(driver = %self.name, "Hardware adapter online");
                Ok(self.transition(true))
            }
            Err(e) => Err((self, e)),
        }
    }

    /// Best-effort safety duty on every channel while the device is not
    /// initialized. Returns `true` if every write was accepted.
    pub async fn force_safety(&self) -> bool {
        let duty = self.settings.safety_duty;
        let mut all_ok = true;
        for channel in FanChannel::ALL {
            if let Err(e) = self
                .call("set_duty", move |d| d.set_duty(channel, duty))
                .await
            {
                debug!(%channel, error = %e, "Safety duty while offline failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

impl HardwareAdapter<Online> {
    /// Read one sensor, rejecting physically implausible values.
    pub async fn read_temperature(&self, sensor: SensorId) -> Result<Temperature, AdapterError> {
        let value = self
            .call("read_sensor", move |d| d.read_sensor(sensor))
            .await?;
        if !value.is_plausible() {
            return Err(AdapterError::InvalidReading { sensor, value });
        }
        Ok(Temperature {
            sensor,
            value,
            taken_at: Instant::now(),
        })
    }

    /// Command a duty. The value is clamped to the configured bounds; the
    /// clamped value is returned.
    pub async fn set_duty(&self, channel: FanChannel, percent: u8) -> Result<u8, AdapterError> {
        let duty = self.settings.limits.clamp(percent);
        self.call("set_duty", move |d| d.set_duty(channel, duty))
            .await?;
        Ok(duty)
    }

    /// Write the safety duty to every channel, attempting all of them even
    /// when one fails.
    pub async fn apply_safety(&self) -> [Result<u8, AdapterError>; 2] {
        let duty = self.settings.safety_duty;
        let mut results = [Ok(duty), Ok(duty)];
        for channel in FanChannel::ALL {
            results[channel.index()] = self.set_duty(channel, duty).await;
        }
        results
    }

    /// Apply the safety duty and release the device.
    ///
    /// Waits up to [`SHUTDOWN_WAIT_CALLS`] call timeouts for the driver, so
    /// a write from an abandoned call cannot land after the safety duty.
    /// The drop guard stays armed unless every safety write succeeded.
    pub async fn shutdown(mut self) -> [Result<u8, AdapterError>; 2] {
        let duty = self.settings.safety_duty;
        let budget = self.settings.call_timeout * SHUTDOWN_WAIT_CALLS;
        let driver = Arc::clone(&self.driver);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = driver.lock().unwrap_or_else(PoisonError::into_inner);
            let results = write_safety(guard.as_mut(), duty);
            if results.iter().all(Result::is_ok) {
                guard.shutdown();
            }
            results
        });

        let results = match tokio::time::timeout(budget, task).await {
            Ok(Ok(results)) => results,
            Ok(Err(join)) => {
                let e = AdapterError::Transient(format!("shutdown panicked: {join}"));
                [Err(e.clone()), Err(e)]
            }
            Err(_) => {
                let e = AdapterError::Transient(format!(
                    "driver still busy after {budget:?}, safety duty queued"
                ));
                [Err(e.clone()), Err(e)]
            }
        };

        for channel in FanChannel::ALL {
            if let Err(e) = &results[channel.index()] {
                error!(%channel, error = %e, "Failed to apply safety duty during shutdown");
            }
        }
        if results.iter().all(Result::is_ok) {
            self.armed = false;
        } else {
            warn!(driver = %self.name, "Safety duty not confirmed, leaving it to the drop guard");
        }
        results
    }
}

/// How many call timeouts [`HardwareAdapter::shutdown`] waits for a busy
/// driver before giving up.
pub const SHUTDOWN_WAIT_CALLS: u32 = 4;

/// Write `duty` to every channel, attempting all of them.
fn write_safety(driver: &mut dyn FanDriver, duty: u8) -> [Result<u8, AdapterError>; 2] {
    FanChannel::ALL.map(|channel| {
        driver
            .set_duty(channel, duty)
            .map(|()| duty)
            .map_err(AdapterError::from)
    })
}

/// Drop-guard body: safety duty everywhere, then release.
fn release_with_safety(driver: &mut dyn FanDriver, duty: u8) {
    for (channel, result) in FanChannel::ALL.into_iter().zip(write_safety(driver, duty)) {
        if let Err(e) = result {
            error!(%channel, error = %e, "Safety duty failed in drop guard");
        }
    }
    driver.shutdown();
}

impl<S> Drop for HardwareAdapter<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let duty = self.settings.safety_duty;
        match self.driver.try_lock() {
            Ok(mut guard) => {
                warn!(driver = %self.name, duty, "Adapter dropped without shutdown, applying safety duty");
                release_with_safety(guard.as_mut(), duty);
            }
            Err(TryLockError::Poisoned(p)) => {
                warn!(driver = %self.name, duty, "Adapter dropped after a driver panic, applying safety duty");
                release_with_safety(p.into_inner().as_mut(), duty);
            }
            Err(TryLockError::WouldBlock) => {
                // Wait for the in-flight call off the dropping thread.
                warn!(driver = %self.name, duty, "Adapter dropped while a call is in flight, deferring safety duty");
                let driver = Arc::clone(&self.driver);
                let spawned = std::thread::Builder::new()
                    .name("fanguard-safety".into())
                    .spawn(move || {
                        let mut guard = driver.lock().unwrap_or_else(PoisonError::into_inner);
                        release_with_safety(guard.as_mut(), duty);
                    });
                if let Err(e) = spawned {
                    error!(driver = %self.name, error = %e, "Could not start safety writer thread");
                }
            }
        }
    }
}

impl<S> fmt::Debug for HardwareAdapter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareAdapter")
            .field("driver", &self.name)
            .field("settings", &self.settings)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

/// Build the driver selected by `[hardware]`.
pub fn driver_from_config(config: &AppConfig) -> Box<dyn FanDriver> {
    match config.hardware.backend.as_str() {
        "simulated" => {
            let (driver, _handle) = SimulatedDriver::new();
            Box::new(driver)
        }
        _ => Box::new(HwmonDriver::from_config(&config.hardware)),
    }
}
