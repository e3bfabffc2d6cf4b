//! Per-channel reading history and hysteresis band.

use std::collections::VecDeque;

use fanguard_config::policy::{ChannelCurve, DeciCelsius};

/// Smoothing window, cached reading and current band for one channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelTracker {
    band: Option<usize>,
    /// Band of the cross curve, tracked on the other channel's reading.
    cross_band: Option<usize>,
    window: VecDeque<DeciCelsius>,
    /// Last raw reading and the tick it was taken on.
    last_raw: Option<(DeciCelsius, u64)>,
    /// Last smoothed value and the tick it was computed on.
    last_good: Option<(DeciCelsius, u64)>,
}

impl ChannelTracker {
    /// Record a fresh reading and return the smoothed value.
    ///
    /// The average of the last `window` readings, rounded toward negative
    /// infinity.
    pub fn record(&mut self, raw: DeciCelsius, tick: u64, window: u32) -> DeciCelsius {
        let window = window.max(1) as usize;
        self.window.push_back(raw);
        while self.window.len() > window {
            self.window.pop_front();
        }
        let sum: i64 = self.window.iter().map(|t| i64::from(t.0)).sum();
        let avg = sum.div_euclid(self.window.len() as i64);
        let smoothed = DeciCelsius(avg as i32);
        self.last_raw = Some((raw, tick));
        self.last_good = Some((smoothed, tick));
        smoothed
    }

    /// Cached smoothed value, if it is at most `staleness_ticks` old.
    pub fn cached(&self, tick: u64, staleness_ticks: u32) -> Option<DeciCelsius> {
        self.last_good
            .filter(|(_, at)| tick.saturating_sub(*at) <= u64::from(staleness_ticks))
            .map(|(value, _)| value)
    }

    /// Evaluate `curve` at `value`, moving the band with hysteresis.
    /// Returns the new band and its duty.
    pub fn target(&mut self, curve: &ChannelCurve, value: DeciCelsius) -> (usize, u8) {
        let band = advance(&mut self.band, curve, value);
        (band, curve.duty_for(band))
    }

    /// Evaluate this channel's cross curve at the other channel's value.
    /// Hysteresis is tracked separately from the own curve.
    pub fn cross_target(&mut self, cross: &ChannelCurve, value: DeciCelsius) -> u8 {
        let band = advance(&mut self.cross_band, cross, value);
        cross.duty_for(band)
    }

    /// Forget the bands and smoothing history. Cached readings survive.
    pub fn reset(&mut self) {
        self.band = None;
        self.cross_band = None;
        self.window.clear();
    }

    pub fn band(&self) -> Option<usize> {
        self.band
    }

    pub fn last_raw(&self) -> Option<DeciCelsius> {
        self.last_raw.map(|(value, _)| value)
    }

    /// Ticks since the last good reading.
    pub fn age(&self, tick: u64) -> Option<u64> {
        self.last_raw.map(|(_, at)| tick.saturating_sub(at))
    }
}

fn advance(slot: &mut Option<usize>, curve: &ChannelCurve, value: DeciCelsius) -> usize {
    let band = match *slot {
        None => curve.initial_band(value),
        Some(current) => curve.step(current, value),
    };
    *slot = Some(band);
    band
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanguard_config::policy::Band;
    use pretty_assertions::assert_eq;

    fn c(deg: i32) -> DeciCelsius {
        DeciCelsius::from_celsius(deg)
    }

    #[test]
    fn test_window_of_one_passes_through() {
        let mut t = ChannelTracker::default();
        assert_eq!(t.record(c(45), 1, 1), c(45));
        assert_eq!(t.record(c(72), 2, 1), c(72));
    }

    #[test]
    fn test_moving_average_floors() {
        let mut t = ChannelTracker::default();
        assert_eq!(t.record(DeciCelsius(500), 1, 3), DeciCelsius(500));
        assert_eq!(t.record(DeciCelsius(501), 2, 3), DeciCelsius(500));
        assert_eq!(t.record(DeciCelsius(510), 3, 3), DeciCelsius(503));
        // Oldest value drops out.
        assert_eq!(t.record(DeciCelsius(520), 4, 3), DeciCelsius(510));
        assert_eq!(t.record(DeciCelsius(-5), 5, 1), DeciCelsius(-5));
        let mut neg = ChannelTracker::default();
        neg.record(DeciCelsius(-1), 1, 2);
        assert_eq!(neg.record(DeciCelsius(-2), 2, 2), DeciCelsius(-2));
    }

    #[test]
    fn test_cached_respects_staleness() {
        let mut t = ChannelTracker::default();
        assert_eq!(t.cached(1, 3), None);
        t.record(c(60), 10, 1);
        assert_eq!(t.cached(10, 3), Some(c(60)));
        assert_eq!(t.cached(13, 3), Some(c(60)));
        assert_eq!(t.cached(14, 3), None);
        assert_eq!(t.age(14), Some(4));
    }

    #[test]
    fn test_target_uses_hysteresis() {
        let curve = ChannelCurve::new(
            30,
            vec![Band::new(c(50), c(45), 60), Band::new(c(70), c(65), 100)],
        );
        let mut t = ChannelTracker::default();
        assert_eq!(t.target(&curve, c(72)), (2, 100));
        assert_eq!(t.target(&curve, c(68)), (2, 100));
        assert_eq!(t.target(&curve, c(60)), (1, 60));
        t.reset();
        assert_eq!(t.band(), None);
        assert_eq!(t.target(&curve, c(68)), (1, 60));
    }

    #[test]
    fn test_cross_band_is_independent() {
        let own = ChannelCurve::fixed(30);
        let cross = ChannelCurve::new(0, vec![Band::new(c(75), c(70), 80)]);
        let mut t = ChannelTracker::default();

        assert_eq!(t.target(&own, c(40)), (0, 30));
        assert_eq!(t.cross_target(&cross, c(76)), 80);
        assert_eq!(t.cross_target(&cross, c(71)), 80);
        assert_eq!(t.band(), Some(0));
        assert_eq!(t.cross_target(&cross, DeciCelsius(699)), 0);

        t.cross_target(&cross, c(76));
        t.reset();
        assert_eq!(t.cross_target(&cross, c(72)), 0);
    }
}
