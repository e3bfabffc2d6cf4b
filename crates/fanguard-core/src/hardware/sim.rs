//! Simulated fan hardware.
//!
//! [`SimulatedDriver`] keeps its state behind a shared [`SimHandle`] so a
//! test (or the `--simulate` dry run) can script temperatures, inject
//! failures and inspect every duty the adapter wrote.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fanguard_config::policy::DeciCelsius;
use fanguard_config::{FanChannel, SensorId};

use super::{DriverFault, FanDriver};

const DEFAULT_TEMP: DeciCelsius = DeciCelsius::from_celsius(40);

#[derive(Debug)]
struct SimState {
    temps: [DeciCelsius; 2],
    duties: [Option<u8>; 2],
    duty_log: Vec<(FanChannel, u8)>,
    init_failures: u32,
    read_failures: [u32; 2],
    write_failures: u32,
    offline: bool,
    latency: Duration,
    initialized: bool,
    init_calls: u32,
    shutdown_calls: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            temps: [DEFAULT_TEMP; 2],
            duties: [None; 2],
            duty_log: Vec::new(),
            init_failures: 0,
            read_failures: [0; 2],
            write_failures: 0,
            offline: false,
            latency: Duration::ZERO,
            initialized: false,
            init_calls: 0,
            shutdown_calls: 0,
        }
    }
}

fn sensor_index(sensor: SensorId) -> usize {
    match sensor {
        SensorId::Cpu => 0,
        SensorId::Gpu => 1,
    }
}

/// Control and inspection handle for a [`SimulatedDriver`].
#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the value the next reads of `sensor` return.
    pub fn set_temp(&self, sensor: SensorId, value: DeciCelsius) {
        self.lock().temps[sensor_index(sensor)] = value;
    }

    /// Set both sensors at once.
    pub fn set_all_temps(&self, value: DeciCelsius) {
        self.lock().temps = [value; 2];
    }

    /// Fail the next `n` initialization attempts.
    pub fn fail_init(&self, n: u32) {
        self.lock().init_failures = n;
    }

    /// Fail the next `n` reads of every sensor.
    pub fn fail_reads(&self, n: u32) {
        self.lock().read_failures = [n; 2];
    }

    /// Fail the next `n` reads of one sensor.
    pub fn fail_sensor(&self, sensor: SensorId, n: u32) {
        self.lock().read_failures[sensor_index(sensor)] = n;
    }

    /// Fail the next `n` duty writes.
    pub fn fail_writes(&self, n: u32) {
        self.lock().write_failures = n;
    }

    /// Make every call report the device as missing.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Last duty written to `channel`.
    pub fn duty(&self, channel: FanChannel) -> Option<u8> {
        self.lock().duties[channel.index()]
    }

    /// Every successful write, in order.
    pub fn duty_log(&self) -> Vec<(FanChannel, u8)> {
        self.lock().duty_log.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn init_calls(&self) -> u32 {
        self.lock().init_calls
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.lock().shutdown_calls
    }
}

/// In-memory [`FanDriver`].
#[derive(Debug)]
pub struct SimulatedDriver {
    handle: SimHandle,
}

impl SimulatedDriver {
    pub fn new() -> (Self, SimHandle) {
        let handle = SimHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }

    fn pause(&self) {
        let latency = self.handle.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }
}

impl FanDriver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn initialize(&mut self) -> Result<(), DriverFault> {
        self.pause();
        let mut state = self.handle.lock();
        state.init_calls += 1;
        if state.offline {
            return Err(DriverFault::NotPresent("simulated device offline".into()));
        }
        if state.init_failures > 0 {
            state.init_failures -= 1;
            return Err(DriverFault::NotPresent("simulated init failure".into()));
        }
        state.initialized = true;
        Ok(())
    }

    fn read_sensor(&mut self, sensor: SensorId) -> Result<DeciCelsius, DriverFault> {
        self.pause();
        let mut state = self.handle.lock();
        if state.offline {
            return Err(DriverFault::NotPresent("simulated device offline".into()));
        }
        let i = sensor_index(sensor);
        if state.read_failures[i] > 0 {
            state.read_failures[i] -= 1;
            return Err(DriverFault::Io(format!("simulated {sensor} read failure")));
        }
        Ok(state.temps[i])
    }

    fn set_duty(&mut self, channel: FanChannel, percent: u8) -> Result<(), DriverFault> {
        self.pause();
        let mut state = self.handle.lock();
        if state.offline {
            return Err(DriverFault::NotPresent("simulated device offline".into()));
        }
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(DriverFault::Busy(format!("simulated {channel} write failure")));
        }
        state.duties[channel.index()] = Some(percent);
        state.duty_log.push((channel, percent));
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.handle.lock();
        state.initialized = false;
        state.shutdown_calls += 1;
    }
}
