#![deny(unsafe_code)]

//! Configuration loading, fan policy model, and policy persistence for fanguard.
//!
//! Loads the daemon's TOML configuration and validates it. Provides the
//! [`AppConfig`] type as the central configuration structure, the [`policy`]
//! module with the temperature → duty model the control loop runs, and the
//! [`store`] module that persists the active policy across restarts.

/// Temperature breakpoint policy with hysteresis.
pub mod policy;
/// File-backed persistence for the active policy.
pub mod store;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use policy::{ControlPolicy, FanChannel, SensorId, ValidationError};
pub use store::PolicyStore;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// IPC socket, persisted policy and queue settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Control loop timing and failure thresholds.
    #[serde(default)]
    pub control: ControlConfig,

    /// Duty-cycle bounds.
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Hardware backend selection.
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// IPC authentication.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Configuration for the daemon process and its IPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket the IPC server binds.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Where the active policy is persisted.
    #[serde(default = "default_policy_path")]
    pub policy_path: String,

    /// Pending commands accepted before clients get `busy`.
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,

    /// Largest accepted IPC frame body.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Time allowed to finish reading a started request frame.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Time a `set_policy` caller waits for the control loop to apply it.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            policy_path: default_policy_path(),
            command_queue_depth: default_command_queue_depth(),
            max_frame_bytes: default_max_frame_bytes(),
            request_timeout_ms: default_request_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

fn default_socket_path() -> String {
    "/run/fanguard/fanguard.sock".to_string()
}

fn default_policy_path() -> String {
    "/var/lib/fanguard/policy.toml".to_string()
}

fn default_command_queue_depth() -> usize {
    16
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_reply_timeout_ms() -> u64 {
    15_000
}

/// Control loop timing and failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Consecutive failing ticks before entering `Degraded`.
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,

    /// Tick interval while `Degraded`.
    #[serde(default = "default_degraded_interval_ms")]
    pub degraded_interval_ms: u64,

    /// Missed cycles after which a cached reading is no longer used.
    #[serde(default = "default_staleness_ticks")]
    pub staleness_ticks: u32,

    /// Upper bound on a single hardware call.
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,

    /// Consecutive init failures before reporting `Degraded`.
    #[serde(default = "default_init_failure_threshold")]
    pub init_failure_threshold: u32,

    /// Init attempts before the process gives up.
    #[serde(default = "default_init_max_attempts")]
    pub init_max_attempts: u32,

    /// First init retry delay; doubles on each failure.
    #[serde(default = "default_init_backoff_initial_ms")]
    pub init_backoff_initial_ms: u64,

    /// Cap on the init retry delay.
    #[serde(default = "default_init_backoff_max_ms")]
    pub init_backoff_max_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: default_degraded_threshold(),
            degraded_interval_ms: default_degraded_interval_ms(),
            staleness_ticks: default_staleness_ticks(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            init_failure_threshold: default_init_failure_threshold(),
            init_max_attempts: default_init_max_attempts(),
            init_backoff_initial_ms: default_init_backoff_initial_ms(),
            init_backoff_max_ms: default_init_backoff_max_ms(),
        }
    }
}

fn default_degraded_threshold() -> u32 {
    3
}

fn default_degraded_interval_ms() -> u64 {
    5_000
}

fn default_staleness_ticks() -> u32 {
    3
}

fn default_adapter_timeout_ms() -> u64 {
    1_000
}

fn default_init_failure_threshold() -> u32 {
    3
}

fn default_init_max_attempts() -> u32 {
    20
}

fn default_init_backoff_initial_ms() -> u64 {
    500
}

fn default_init_backoff_max_ms() -> u64 {
    30_000
}

/// Duty-cycle bounds enforced on every write to the hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Lowest duty ever written while the service runs.
    #[serde(default = "default_floor_percent")]
    pub floor_percent: u8,

    /// Highest duty ever written.
    #[serde(default = "default_ceiling_percent")]
    pub ceiling_percent: u8,

    /// Duty applied on failure, shutdown, and by the default policy.
    #[serde(default = "default_safety_percent")]
    pub safety_percent: u8,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            floor_percent: default_floor_percent(),
            ceiling_percent: default_ceiling_percent(),
            safety_percent: default_safety_percent(),
        }
    }
}

fn default_floor_percent() -> u8 {
    20
}

fn default_ceiling_percent() -> u8 {
    100
}

fn default_safety_percent() -> u8 {
    100
}

/// Hardware backend selection.
///
/// ## TOML Example
///
/// ```toml
/// [hardware]
/// backend = "hwmon"
/// cpu_temp_path = "/sys/class/hwmon/hwmon3/temp1_input"
/// gpu_temp_path = "/sys/class/hwmon/hwmon5/temp1_input"
/// cpu_pwm_path = "/sys/class/hwmon/hwmon4/pwm1"
/// gpu_pwm_path = "/sys/class/hwmon/hwmon4/pwm2"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Backend: "hwmon" or "simulated".
    #[serde(default = "default_hardware_backend")]
    pub backend: String,

    /// Refuse to start without root privileges.
    #[serde(default = "default_require_privilege")]
    pub require_privilege: bool,

    #[serde(default)]
    pub cpu_temp_path: Option<String>,

    #[serde(default)]
    pub gpu_temp_path: Option<String>,

    #[serde(default)]
    pub cpu_pwm_path: Option<String>,

    #[serde(default)]
    pub gpu_pwm_path: Option<String>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: default_hardware_backend(),
            require_privilege: default_require_privilege(),
            cpu_temp_path: None,
            gpu_temp_path: None,
            cpu_pwm_path: None,
            gpu_pwm_path: None,
        }
    }
}

fn default_hardware_backend() -> String {
    "hwmon".to_string()
}

fn default_require_privilege() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "full" or "compact".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

/// IPC authentication configuration.
///
/// Clients must present the token stored at `token_path`. The file is
/// created at install time (`fanguard token generate`) and readable only by
/// the service account and the users allowed to control the fans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_path")]
    pub token_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
        }
    }
}

fn default_token_path() -> String {
    "/etc/fanguard/ipc.token".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// The policy used when nothing valid has been persisted: every fan at
    /// the safety duty.
    pub fn default_policy(&self) -> ControlPolicy {
        ControlPolicy::fixed(self.safety.safety_percent)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.daemon;
        if d.socket_path.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.socket_path must not be empty".to_string(),
            ));
        }
        if d.policy_path.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.policy_path must not be empty".to_string(),
            ));
        }
        if d.command_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "daemon.command_queue_depth must be at least 1".to_string(),
            ));
        }
        if !(1024..=16 * 1024 * 1024).contains(&d.max_frame_bytes) {
            return Err(ConfigError::Validation(format!(
                "daemon.max_frame_bytes must be in [1024, 16777216], got {}",
                d.max_frame_bytes
            )));
        }
        if d.request_timeout_ms == 0 || d.reply_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "daemon timeouts must be non-zero".to_string(),
            ));
        }

        let c = &self.control;
        if c.degraded_threshold == 0 {
            return Err(ConfigError::Validation(
                "control.degraded_threshold must be at least 1".to_string(),
            ));
        }
        if c.degraded_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "control.degraded_interval_ms must be non-zero".to_string(),
            ));
        }
        if c.staleness_ticks == 0 {
            return Err(ConfigError::Validation(
                "control.staleness_ticks must be at least 1".to_string(),
            ));
        }
        if c.adapter_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "control.adapter_timeout_ms must be non-zero".to_string(),
            ));
        }
        if c.init_failure_threshold == 0 || c.init_max_attempts < c.init_failure_threshold {
            return Err(ConfigError::Validation(format!(
                "control.init_max_attempts ({}) must be >= init_failure_threshold ({}) >= 1",
                c.init_max_attempts, c.init_failure_threshold
            )));
        }
        if c.init_backoff_initial_ms == 0 || c.init_backoff_initial_ms > c.init_backoff_max_ms {
            return Err(ConfigError::Validation(format!(
                "control.init_backoff_initial_ms must be in [1, {}], got {}",
                c.init_backoff_max_ms, c.init_backoff_initial_ms
            )));
        }

        let s = &self.safety;
        if s.ceiling_percent > 100 {
            return Err(ConfigError::Validation(format!(
                "safety.ceiling_percent must be at most 100, got {}",
                s.ceiling_percent
            )));
        }
        if s.floor_percent == 0 || s.floor_percent > s.ceiling_percent {
            return Err(ConfigError::Validation(format!(
                "safety.floor_percent must be in [1, {}], got {}",
                s.ceiling_percent, s.floor_percent
            )));
        }
        if s.safety_percent < s.floor_percent || s.safety_percent > s.ceiling_percent {
            return Err(ConfigError::Validation(format!(
                "safety.safety_percent must be in [{}, {}], got {}",
                s.floor_percent, s.ceiling_percent, s.safety_percent
            )));
        }

        let valid_backends = ["hwmon", "simulated"];
        if !valid_backends.contains(&self.hardware.backend.as_str()) {
            return Err(ConfigError::Validation(format!(
                "hardware.backend must be one of {:?}, got {:?}",
                valid_backends, self.hardware.backend
            )));
        }

        let valid_formats = ["full", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.format must be one of {:?}, got {:?}",
                valid_formats, self.logging.format
            )));
        }

        if self.auth.token_path.is_empty() {
            return Err(ConfigError::Validation(
                "auth.token_path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
