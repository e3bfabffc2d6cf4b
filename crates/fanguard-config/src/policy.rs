//! Fan control policy: temperature breakpoints with hysteresis.
//!
//! A [`ControlPolicy`] holds one [`ChannelCurve`] per [`FanChannel`]. Each
//! curve is a base duty plus an ordered list of [`Band`]s. A band is entered
//! when the temperature rises strictly above its `rise` threshold and left
//! when the temperature falls strictly below its `fall` threshold, so a
//! channel sitting between those two values keeps its duty.
//!
//! A curve may also carry a `cross` curve evaluated on the other channel's
//! sensor. The fan then runs at the higher of the two duties, so GPU heat
//! can spin up the CPU fan without syncing every fan.
//!
//! ```toml
//! sample_interval_ms = 2000
//!
//! [channels.cpu]
//! base_duty = 30
//!
//! [[channels.cpu.bands]]
//! rise = 50.0
//! fall = 45.0
//! duty = 60
//!
//! [channels.cpu.cross]
//! base_duty = 0
//!
//! [[channels.cpu.cross.bands]]
//! rise = 75.0
//! fall = 70.0
//! duty = 80
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowest temperature a sensor can plausibly report, in tenths of °C.
pub const MIN_PLAUSIBLE_DECI_C: i32 = -400;

/// Highest temperature a sensor can plausibly report, in tenths of °C.
pub const MAX_PLAUSIBLE_DECI_C: i32 = 1500;

/// Shortest accepted sampling interval.
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 250;

/// Longest accepted sampling interval.
pub const MAX_SAMPLE_INTERVAL_MS: u64 = 60_000;

/// Upper bound on bands per channel.
pub const MAX_BANDS: usize = 16;

/// Upper bound on the moving-average window.
pub const MAX_SMOOTHING_WINDOW: u32 = 60;

/// A temperature in tenths of a degree Celsius.
///
/// Serialized as a plain number of degrees (`70.5`), rounded to the nearest
/// tenth on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct DeciCelsius(pub i32);

impl DeciCelsius {
    /// Build from whole degrees.
    pub const fn from_celsius(degrees: i32) -> Self {
        Self(degrees * 10)
    }

    /// Value in degrees as a float.
    pub fn as_celsius(self) -> f64 {
        f64::from(self.0) / 10.0
    }

    /// Whether the value lies in the physically plausible sensor range.
    pub fn is_plausible(self) -> bool {
        (MIN_PLAUSIBLE_DECI_C..=MAX_PLAUSIBLE_DECI_C).contains(&self.0)
    }
}

impl TryFrom<f64> for DeciCelsius {
    type Error = String;

    fn try_from(degrees: f64) -> Result<Self, Self::Error> {
        if !degrees.is_finite() {
            return Err(format!("temperature must be finite, got {degrees}"));
        }
        let tenths = (degrees * 10.0).round();
        if tenths < f64::from(i32::MIN) || tenths > f64::from(i32::MAX) {
            return Err(format!("temperature {degrees} is out of range"));
        }
        Ok(Self(tenths as i32))
    }
}

impl From<DeciCelsius> for f64 {
    fn from(t: DeciCelsius) -> Self {
        t.as_celsius()
    }
}

impl fmt::Display for DeciCelsius {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°C", self.as_celsius())
    }
}

/// Temperature sensor sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorId {
    Cpu,
    Gpu,
}

impl SensorId {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorId::Cpu => "cpu",
            SensorId::Gpu => "gpu",
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical fan. The set is fixed at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanChannel {
    Cpu,
    Gpu,
}

impl FanChannel {
    /// Every channel, in application order.
    pub const ALL: [FanChannel; 2] = [FanChannel::Cpu, FanChannel::Gpu];

    /// The sensor that drives this channel.
    pub fn sensor(self) -> SensorId {
        match self {
            FanChannel::Cpu => SensorId::Cpu,
            FanChannel::Gpu => SensorId::Gpu,
        }
    }

    /// The channel whose sensor feeds this channel's cross curve.
    pub fn other(self) -> FanChannel {
        match self {
            FanChannel::Cpu => FanChannel::Gpu,
            FanChannel::Gpu => FanChannel::Cpu,
        }
    }

    /// Zero-based index, stable across releases.
    pub fn index(self) -> usize {
        match self {
            FanChannel::Cpu => 0,
            FanChannel::Gpu => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FanChannel::Cpu => "cpu",
            FanChannel::Gpu => "gpu",
        }
    }
}

impl fmt::Display for FanChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a policy was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed policy: {0}")]
    MalformedPolicy(String),

    #[error("unsafe threshold: {0}")]
    UnsafeThreshold(String),
}

/// One step of a channel's breakpoint table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// Enter this band when the temperature rises strictly above this value.
    pub rise: DeciCelsius,
    /// Leave this band when the temperature falls strictly below this value.
    pub fall: DeciCelsius,
    /// Duty cycle in percent while in this band.
    pub duty: u8,
}

impl Band {
    pub fn new(rise: DeciCelsius, fall: DeciCelsius, duty: u8) -> Self {
        Self { rise, fall, duty }
    }
}

/// Breakpoint table for a single fan channel.
///
/// Band index `0` is the base band (below every threshold); index `i >= 1`
/// refers to `bands[i - 1]`. A curve with no bands is a fixed duty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCurve {
    /// Duty below the first band's rise threshold.
    pub base_duty: u8,
    /// Bands ordered by increasing temperature.
    #[serde(default)]
    pub bands: Vec<Band>,
    /// Curve on the other channel's sensor. Cannot itself have a cross
    /// curve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross: Option<Box<ChannelCurve>>,
}

impl ChannelCurve {
    /// A curve with the given breakpoints and no cross curve.
    pub fn new(base_duty: u8, bands: Vec<Band>) -> Self {
        Self {
            base_duty,
            bands,
            cross: None,
        }
    }

    /// A curve that always requests the same duty.
    pub fn fixed(duty: u8) -> Self {
        Self::new(duty, Vec::new())
    }

    /// Attach a cross curve.
    pub fn with_cross(mut self, cross: ChannelCurve) -> Self {
        self.cross = Some(Box::new(cross));
        self
    }

    /// Number of bands including the base band.
    pub fn band_count(&self) -> usize {
        self.bands.len() + 1
    }

    /// Duty for a band index; out-of-range indices map to the top band.
    pub fn duty_for(&self, band: usize) -> u8 {
        match band {
            0 => self.base_duty,
            i => self
                .bands
                .get(i - 1)
                .or_else(|| self.bands.last())
                .map(|b| b.duty)
                .unwrap_or(self.base_duty),
        }
    }

    /// Band for a channel with no history: the highest band whose rise
    /// threshold the temperature strictly exceeds.
    pub fn initial_band(&self, temp: DeciCelsius) -> usize {
        self.bands
            .iter()
            .take_while(|b| temp > b.rise)
            .count()
    }

    /// Next band given the current one, applying hysteresis.
    ///
    /// Climbs while the temperature is strictly above the next band's rise
    /// threshold, otherwise descends while it is strictly below the current
    /// band's fall threshold.
    pub fn step(&self, current: usize, temp: DeciCelsius) -> usize {
        let mut band = current.min(self.bands.len());

        while band < self.bands.len() && temp > self.bands[band].rise {
            band += 1;
        }
        if band != current.min(self.bands.len()) {
            return band;
        }
        while band > 0 && temp < self.bands[band - 1].fall {
            band -= 1;
        }
        band
    }

    fn validate(&self, label: &str) -> Result<(), ValidationError> {
        if self.base_duty > 100 {
            return Err(ValidationError::MalformedPolicy(format!(
                "{label}.base_duty must be at most 100, got {}",
                self.base_duty
            )));
        }
        if self.bands.len() > MAX_BANDS {
            return Err(ValidationError::MalformedPolicy(format!(
                "{label} has {} bands, at most {MAX_BANDS} allowed",
                self.bands.len()
            )));
        }

        let mut prev: Option<&Band> = None;
        for (i, band) in self.bands.iter().enumerate() {
            if band.duty > 100 {
                return Err(ValidationError::MalformedPolicy(format!(
                    "{label}.bands[{i}].duty must be at most 100, got {}",
                    band.duty
                )));
            }
            for (name, value) in [("rise", band.rise), ("fall", band.fall)] {
                if !value.is_plausible() {
                    return Err(ValidationError::UnsafeThreshold(format!(
                        "{label}.bands[{i}].{name} = {value} is outside the sensor range"
                    )));
                }
            }
            if band.rise <= band.fall {
                return Err(ValidationError::MalformedPolicy(format!(
                    "{label}.bands[{i}]: rise ({}) must be greater than fall ({})",
                    band.rise, band.fall
                )));
            }

            let prev_duty = prev.map(|p| p.duty).unwrap_or(self.base_duty);
            if band.duty < prev_duty {
                return Err(ValidationError::UnsafeThreshold(format!(
                    "{label}.bands[{i}].duty ({}) is lower than the band below it ({prev_duty})",
                    band.duty
                )));
            }

            if let Some(p) = prev {
                if band.rise <= p.rise || band.fall <= p.fall {
                    return Err(ValidationError::MalformedPolicy(format!(
                        "{label}.bands[{i}]: thresholds must be strictly increasing \
                         (rise {} after {}, fall {} after {})",
                        band.rise, p.rise, band.fall, p.fall
                    )));
                }
            }
            prev = Some(band);
        }

        if let Some(cross) = &self.cross {
            if cross.cross.is_some() {
                return Err(ValidationError::MalformedPolicy(format!(
                    "{label}.cross cannot have its own cross curve"
                )));
            }
            cross.validate(&format!("{label}.cross"))?;
        }
        Ok(())
    }
}

/// Curves for every fan channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChannels {
    pub cpu: ChannelCurve,
    pub gpu: ChannelCurve,
}

impl PolicyChannels {
    pub fn get(&self, channel: FanChannel) -> &ChannelCurve {
        match channel {
            FanChannel::Cpu => &self.cpu,
            FanChannel::Gpu => &self.gpu,
        }
    }

    pub fn get_mut(&mut self, channel: FanChannel) -> &mut ChannelCurve {
        match channel {
            FanChannel::Cpu => &mut self.cpu,
            FanChannel::Gpu => &mut self.gpu,
        }
    }
}

/// The complete temperature → duty policy applied by the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPolicy {
    /// Time between control ticks.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Moving-average window over raw readings (1 disables smoothing).
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: u32,

    /// Drive every fan at the highest duty any channel asks for.
    #[serde(default)]
    pub fan_sync: bool,

    pub channels: PolicyChannels,
}

fn default_sample_interval_ms() -> u64 {
    2000
}

fn default_smoothing_window() -> u32 {
    1
}

impl ControlPolicy {
    /// A policy that holds every channel at one duty.
    pub fn fixed(duty: u8) -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            smoothing_window: default_smoothing_window(),
            fan_sync: false,
            channels: PolicyChannels {
                cpu: ChannelCurve::fixed(duty),
                gpu: ChannelCurve::fixed(duty),
            },
        }
    }

    /// Curve for one channel.
    pub fn curve(&self, channel: FanChannel) -> &ChannelCurve {
        self.channels.get(channel)
    }

    /// Check breakpoint ordering, hysteresis margins and ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(MIN_SAMPLE_INTERVAL_MS..=MAX_SAMPLE_INTERVAL_MS).contains(&self.sample_interval_ms) {
            return Err(ValidationError::MalformedPolicy(format!(
                "sample_interval_ms must be in [{MIN_SAMPLE_INTERVAL_MS}, {MAX_SAMPLE_INTERVAL_MS}], got {}",
                self.sample_interval_ms
            )));
        }
        if self.smoothing_window == 0 || self.smoothing_window > MAX_SMOOTHING_WINDOW {
            return Err(ValidationError::MalformedPolicy(format!(
                "smoothing_window must be in [1, {MAX_SMOOTHING_WINDOW}], got {}",
                self.smoothing_window
            )));
        }
        for channel in FanChannel::ALL {
            self.curve(channel).validate(&format!("channels.{channel}"))?;
        }
        Ok(())
    }

    /// Parse and validate a policy from TOML.
    pub fn parse_toml(s: &str) -> Result<Self, crate::ConfigError> {
        let policy: ControlPolicy = toml::from_str(s)?;
        policy
            .validate()
            .map_err(|e| crate::ConfigError::Validation(e.to_string()))?;
        Ok(policy)
    }
}
