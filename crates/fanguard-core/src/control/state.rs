//! Published runtime state.

use std::fmt;

use fanguard_config::policy::DeciCelsius;
use fanguard_config::{ControlPolicy, FanChannel};
use serde::{Deserialize, Serialize};

/// Control loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Degraded => "degraded",
            LoopState::ShuttingDown => "shutting_down",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-channel view of the last tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: FanChannel,
    /// Last good raw reading.
    pub temperature: Option<DeciCelsius>,
    /// Value the curve was evaluated against this tick; `None` when no
    /// usable reading existed and the safety duty was requested instead.
    pub smoothed: Option<DeciCelsius>,
    /// Ticks since `temperature` was taken.
    pub reading_age_ticks: Option<u64>,
    /// Current hysteresis band (0 = base).
    pub band: Option<usize>,
    pub target_duty: Option<u8>,
    pub applied_duty: Option<u8>,
}

impl ChannelStatus {
    pub fn new(channel: FanChannel) -> Self {
        Self {
            channel,
            temperature: None,
            smoothed: None,
            reading_age_ticks: None,
            band: None,
            target_duty: None,
            applied_duty: None,
        }
    }
}

/// Hardware health as seen by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub driver: String,
    pub last_error: Option<String>,
    /// Consecutive ticks (or init attempts) with at least one failure.
    pub consecutive_failures: u32,
    /// Failed hardware calls since start.
    pub total_failures: u64,
    pub init_attempts: u32,
}

/// Immutable view of the daemon published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Strictly increasing per publication.
    pub generation: u64,
    pub state: LoopState,
    pub channels: Vec<ChannelStatus>,
    pub policy: ControlPolicy,
    pub health: AdapterHealth,
    pub version: String,
    pub uptime_secs: u64,
}

impl RuntimeSnapshot {
    pub fn channel(&self, channel: FanChannel) -> Option<&ChannelStatus> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> RuntimeSnapshot {
        let mut cpu = ChannelStatus::new(FanChannel::Cpu);
        cpu.temperature = Some(DeciCelsius(655));
        cpu.applied_duty = Some(60);
        RuntimeSnapshot {
            generation: 7,
            state: LoopState::ShuttingDown,
            channels: vec![cpu, ChannelStatus::new(FanChannel::Gpu)],
            policy: ControlPolicy::fixed(100),
            health: AdapterHealth {
                driver: "simulated".into(),
                ..Default::default()
            },
            version: "0.1.0".into(),
            uptime_secs: 12,
        }
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["state"], "shutting_down");
        assert_eq!(json["channels"][0]["channel"], "cpu");
        assert_eq!(json["channels"][0]["temperature"], 65.5);
        assert!(json["channels"][1]["temperature"].is_null());
        assert_eq!(json["health"]["driver"], "simulated");
    }

    #[test]
    fn test_snapshot_deserializes() {
        let snap = snapshot();
        let text = serde_json::to_string(&snap).unwrap();
        let back: RuntimeSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.channel(FanChannel::Cpu).unwrap().applied_duty, Some(60));
    }

    #[test]
    fn test_loop_state_display() {
        assert_eq!(LoopState::Degraded.to_string(), "degraded");
        assert_eq!(LoopState::ShuttingDown.to_string(), "shutting_down");
    }
}
