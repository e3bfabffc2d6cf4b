//! Configuration builders for tests.
//!
//! [`TestConfigBuilder`] starts from a config that can run unprivileged
//! against the simulated backend, with fast timings so tests do not wait on
//! production intervals.

use std::path::Path;

use fanguard_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .paths_in(tmp.path())
///     .degraded_threshold(2)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.hardware.backend = "simulated".to_string();
        config.hardware.require_privilege = false;
        config.control.adapter_timeout_ms = 500;
        config.control.degraded_interval_ms = 250;
        config.control.init_backoff_initial_ms = 10;
        config.control.init_backoff_max_ms = 50;
        config.daemon.request_timeout_ms = 1_000;
        config.daemon.reply_timeout_ms = 5_000;
        Self { config }
    }

    /// Put the socket, policy and token files under `dir`.
    pub fn paths_in(mut self, dir: &Path) -> Self {
        self.config.daemon.socket_path = dir.join("fanguard.sock").display().to_string();
        self.config.daemon.policy_path = dir.join("policy.toml").display().to_string();
        self.config.auth.token_path = dir.join("ipc.token").display().to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn command_queue_depth(mut self, depth: usize) -> Self {
        self.config.daemon.command_queue_depth = depth;
        self
    }

    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.config.daemon.max_frame_bytes = max;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.daemon.request_timeout_ms = ms;
        self
    }

    pub fn reply_timeout_ms(mut self, ms: u64) -> Self {
        self.config.daemon.reply_timeout_ms = ms;
        self
    }

    pub fn degraded_threshold(mut self, n: u32) -> Self {
        self.config.control.degraded_threshold = n;
        self
    }

    pub fn staleness_ticks(mut self, n: u32) -> Self {
        self.config.control.staleness_ticks = n;
        self
    }

    pub fn init_attempts(mut self, failure_threshold: u32, max_attempts: u32) -> Self {
        self.config.control.init_failure_threshold = failure_threshold;
        self.config.control.init_max_attempts = max_attempts;
        self
    }

    pub fn safety(mut self, floor: u8, ceiling: u8, safety: u8) -> Self {
        self.config.safety.floor_percent = floor;
        self.config.safety.ceiling_percent = ceiling;
        self.config.safety.safety_percent = safety;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_valid_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = TestConfigBuilder::new()
            .paths_in(tmp.path())
            .degraded_threshold(2)
            .safety(25, 90, 90)
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.control.degraded_threshold, 2);
        assert!(config.daemon.socket_path.ends_with("fanguard.sock"));
        assert!(!config.hardware.require_privilege);
    }
}
