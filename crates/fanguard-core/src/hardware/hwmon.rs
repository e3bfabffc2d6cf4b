//! Linux hwmon backend.
//!
//! Temperatures come from `tempN_input` files (millidegrees Celsius) and
//! duties go to `pwmN` files (0-255). Initialization switches each PWM
//! output to manual mode through its `pwmN_enable` sibling when present.

use std::io;
use std::path::{Path, PathBuf};

use fanguard_config::policy::DeciCelsius;
use fanguard_config::{FanChannel, HardwareConfig, SensorId};
use tracing::debug;

use super::{DriverFault, FanDriver};

/// `pwmN_enable` value selecting manual control.
const PWM_MODE_MANUAL: &str = "1";

/// Sysfs-backed [`FanDriver`].
#[derive(Debug, Clone)]
pub struct HwmonDriver {
    cpu_temp: Option<PathBuf>,
    gpu_temp: Option<PathBuf>,
    cpu_pwm: Option<PathBuf>,
    gpu_pwm: Option<PathBuf>,
}

impl HwmonDriver {
    pub fn from_config(config: &HardwareConfig) -> Self {
        Self {
            cpu_temp: config.cpu_temp_path.as_ref().map(PathBuf::from),
            gpu_temp: config.gpu_temp_path.as_ref().map(PathBuf::from),
            cpu_pwm: config.cpu_pwm_path.as_ref().map(PathBuf::from),
            gpu_pwm: config.gpu_pwm_path.as_ref().map(PathBuf::from),
        }
    }

    fn temp_path(&self, sensor: SensorId) -> Result<&Path, DriverFault> {
        let path = match sensor {
            SensorId::Cpu => &self.cpu_temp,
            SensorId::Gpu => &self.gpu_temp,
        };
        path.as_deref()
            .ok_or_else(|| DriverFault::NotPresent(format!("no {sensor} temperature path configured")))
    }

    fn pwm_path(&self, channel: FanChannel) -> Result<&Path, DriverFault> {
        let path = match channel {
            FanChannel::Cpu => &self.cpu_pwm,
            FanChannel::Gpu => &self.gpu_pwm,
        };
        path.as_deref()
            .ok_or_else(|| DriverFault::NotPresent(format!("no {channel} pwm path configured")))
    }
}

fn fault(path: &Path, e: io::Error) -> DriverFault {
    let msg = format!("{}: {e}", path.display());
    match e.kind() {
        io::ErrorKind::NotFound => DriverFault::NotPresent(msg),
        io::ErrorKind::PermissionDenied => DriverFault::PermissionDenied(msg),
        io::ErrorKind::WouldBlock | io::ErrorKind::ResourceBusy => DriverFault::Busy(msg),
        _ => DriverFault::Io(msg),
    }
}

fn enable_path(pwm: &Path) -> PathBuf {
    let mut name = pwm.as_os_str().to_os_string();
    name.push("_enable");
    PathBuf::from(name)
}

/// Convert a percentage to the 0-255 PWM scale.
pub fn percent_to_pwm(percent: u8) -> u8 {
    (u16::from(percent.min(100)) * 255 / 100) as u8
}

/// Parse a `tempN_input` value (millidegrees) into tenths of a degree.
pub fn parse_millidegrees(raw: &str) -> Result<DeciCelsius, String> {
    let milli: i64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("unreadable temperature {raw:?}: {e}"))?;
    i32::try_from(milli / 100)
        .map(DeciCelsius)
        .map_err(|_| format!("temperature {milli} out of range"))
}

impl FanDriver for HwmonDriver {
    fn name(&self) -> &str {
        "hwmon"
    }

    fn initialize(&mut self) -> Result<(), DriverFault> {
        for sensor in [SensorId::Cpu, SensorId::Gpu] {
            let path = self.temp_path(sensor)?;
            std::fs::metadata(path).map_err(|e| fault(path, e))?;
        }
        for channel in FanChannel::ALL {
            let pwm = self.pwm_path(channel)?;
            std::fs::metadata(pwm).map_err(|e| fault(pwm, e))?;
            let enable = enable_path(pwm);
            if enable.exists() {
                std::fs::write(&enable, PWM_MODE_MANUAL).map_err(|e| fault(&enable, e))?;
            }
        }
        debug!("hwmon paths verified, PWM outputs in manual mode");
        Ok(())
    }

    fn read_sensor(&mut self, sensor: SensorId) -> Result<DeciCelsius, DriverFault> {
        let path = self.temp_path(sensor)?;
        let raw = std::fs::read_to_string(path).map_err(|e| fault(path, e))?;
        parse_millidegrees(&raw).map_err(|msg| DriverFault::Io(format!("{}: {msg}", path.display())))
    }

    fn set_duty(&mut self, channel: FanChannel, percent: u8) -> Result<(), DriverFault> {
        let path = self.pwm_path(channel)?;
        std::fs::write(path, percent_to_pwm(percent).to_string()).map_err(|e| fault(path, e))
    }

    fn shutdown(&mut self) {
        debug!("hwmon driver released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, HwmonDriver) {
        let tmp = TempDir::new().unwrap();
        let p = |name: &str| tmp.path().join(name).to_string_lossy().into_owned();
        for name in ["temp1_input", "temp2_input", "pwm1", "pwm2", "pwm1_enable"] {
            std::fs::write(tmp.path().join(name), "0\n").unwrap();
        }
        let config = HardwareConfig {
            backend: "hwmon".into(),
            require_privilege: false,
            cpu_temp_path: Some(p("temp1_input")),
            gpu_temp_path: Some(p("temp2_input")),
            cpu_pwm_path: Some(p("pwm1")),
            gpu_pwm_path: Some(p("pwm2")),
        };
        (tmp, HwmonDriver::from_config(&config))
    }

    #[test]
    fn test_percent_to_pwm() {
        assert_eq!(percent_to_pwm(0), 0);
        assert_eq!(percent_to_pwm(50), 127);
        assert_eq!(percent_to_pwm(100), 255);
        assert_eq!(percent_to_pwm(200), 255);
    }

    #[test]
    fn test_parse_millidegrees() {
        assert_eq!(parse_millidegrees("45000\n").unwrap(), DeciCelsius(450));
        assert_eq!(parse_millidegrees("72560").unwrap(), DeciCelsius(725));
        assert_eq!(parse_millidegrees("-5000").unwrap(), DeciCelsius(-50));
        assert!(parse_millidegrees("n/a").is_err());
    }

    #[test]
    fn test_initialize_sets_manual_mode() {
        let (tmp, mut driver) = fixture();
        driver.initialize().unwrap();
        let mode = std::fs::read_to_string(tmp.path().join("pwm1_enable")).unwrap();
        assert_eq!(mode, "1");
        assert!(!tmp.path().join("pwm2_enable").exists());
    }

    #[test]
    fn test_read_and_write() {
        let (tmp, mut driver) = fixture();
        std::fs::write(tmp.path().join("temp2_input"), "61500\n").unwrap();
        assert_eq!(driver.read_sensor(SensorId::Gpu).unwrap(), DeciCelsius(615));

        driver.set_duty(FanChannel::Cpu, 60).unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("pwm1")).unwrap();
        assert_eq!(raw, "153");
    }

    #[test]
    fn test_missing_path_is_not_present() {
        let mut driver = HwmonDriver::from_config(&HardwareConfig::default());
        assert!(matches!(
            driver.initialize(),
            Err(DriverFault::NotPresent(_))
        ));

        let (tmp, mut driver) = fixture();
        std::fs::remove_file(tmp.path().join("temp1_input")).unwrap();
        assert!(matches!(
            driver.read_sensor(SensorId::Cpu),
            Err(DriverFault::NotPresent(_))
        ));
    }

    #[test]
    fn test_garbage_reading_is_io_fault() {
        let (tmp, mut driver) = fixture();
        std::fs::write(tmp.path().join("temp1_input"), "garbage").unwrap();
        assert!(matches!(
            driver.read_sensor(SensorId::Cpu),
            Err(DriverFault::Io(_))
        ));
    }
}
