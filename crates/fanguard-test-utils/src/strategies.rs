//! `proptest` strategies for policies and sensor readings.
//!
//! [`valid_curve`] and [`valid_policy`] only produce values that pass
//! [`ControlPolicy::validate`]. [`invalid_policy`] takes a valid policy and
//! breaks exactly one rule. [`any_policy`] makes no promises at all.

use fanguard_config::ControlPolicy;
use fanguard_config::policy::{
    Band, ChannelCurve, DeciCelsius, MAX_SAMPLE_INTERVAL_MS, MAX_SMOOTHING_WINDOW,
    MIN_SAMPLE_INTERVAL_MS, PolicyChannels,
};
use proptest::prelude::*;

/// A breakpoint table with strictly increasing thresholds, a positive
/// hysteresis margin on every band and non-decreasing duties.
pub fn valid_curve() -> impl Strategy<Value = ChannelCurve> {
    // Steps between rises are wider than any margin, so falls increase too.
    (
        0u8..=100,
        -300i32..300,
        prop::collection::vec((51i32..150, 1i32..50, 0u8..25), 0..6),
    )
        .prop_map(|(base_duty, start, steps)| {
            let mut rise = start;
            let mut duty = base_duty;
            let bands = steps
                .into_iter()
                .map(|(step, margin, bump)| {
                    rise += step;
                    duty = duty.saturating_add(bump).min(100);
                    Band::new(DeciCelsius(rise), DeciCelsius(rise - margin), duty)
                })
                .collect();
            ChannelCurve::new(base_duty, bands)
        })
}

/// A policy that passes validation.
pub fn valid_policy() -> impl Strategy<Value = ControlPolicy> {
    (
        valid_curve(),
        valid_curve(),
        prop::option::of(valid_curve()),
        any::<bool>(),
        MIN_SAMPLE_INTERVAL_MS..=MAX_SAMPLE_INTERVAL_MS,
        1u32..=MAX_SMOOTHING_WINDOW,
    )
        .prop_map(|(cpu, gpu, cross, fan_sync, sample_interval_ms, smoothing_window)| {
            let cpu = match cross {
                Some(cross) => cpu.with_cross(cross),
                None => cpu,
            };
            ControlPolicy {
                sample_interval_ms,
                smoothing_window,
                fan_sync,
                channels: PolicyChannels { cpu, gpu },
            }
        })
}

/// One way of breaking a valid policy.
#[derive(Debug, Clone, Copy)]
pub enum Corruption {
    RiseNotAboveFall,
    DutyAbove100,
    DutyDecreases,
    ThresholdOutOfRange,
    ThresholdsOutOfOrder,
    IntervalOutOfRange,
    ZeroSmoothingWindow,
    NestedCross,
}

fn corruption() -> impl Strategy<Value = Corruption> {
    prop_oneof![
        Just(Corruption::RiseNotAboveFall),
        Just(Corruption::DutyAbove100),
        Just(Corruption::DutyDecreases),
        Just(Corruption::ThresholdOutOfRange),
        Just(Corruption::ThresholdsOutOfOrder),
        Just(Corruption::IntervalOutOfRange),
        Just(Corruption::ZeroSmoothingWindow),
        Just(Corruption::NestedCross),
    ]
}

/// Apply `corruption` to the CPU curve of `policy`.
pub fn corrupt(mut policy: ControlPolicy, corruption: Corruption) -> ControlPolicy {
    let curve = &mut policy.channels.cpu;
    let top = curve.bands.last().map(|b| b.rise.0).unwrap_or(0);
    let top_duty = curve.bands.last().map(|b| b.duty).unwrap_or(curve.base_duty);
    match corruption {
        Corruption::RiseNotAboveFall => {
            curve
                .bands
                .push(Band::new(DeciCelsius(top + 100), DeciCelsius(top + 100), 100));
        }
        Corruption::DutyAbove100 => curve.base_duty = 101,
        Corruption::DutyDecreases => {
            curve.base_duty = curve.base_duty.max(1);
            curve.bands = vec![Band::new(
                DeciCelsius(500),
                DeciCelsius(450),
                curve.base_duty - 1,
            )];
        }
        Corruption::ThresholdOutOfRange => {
            curve
                .bands
                .push(Band::new(DeciCelsius(2000), DeciCelsius(1900), 100));
        }
        Corruption::ThresholdsOutOfOrder => {
            curve.bands.push(Band::new(DeciCelsius(top + 100), DeciCelsius(top + 50), top_duty));
            curve.bands.push(Band::new(DeciCelsius(top + 90), DeciCelsius(top + 60), top_duty));
        }
        Corruption::IntervalOutOfRange => policy.sample_interval_ms = MIN_SAMPLE_INTERVAL_MS - 1,
        Corruption::ZeroSmoothingWindow => policy.smoothing_window = 0,
        Corruption::NestedCross => {
            let cross = ChannelCurve::fixed(10).with_cross(ChannelCurve::fixed(20));
            curve.cross = Some(Box::new(cross));
        }
    }
    policy
}

/// A policy that breaks exactly one validation rule.
pub fn invalid_policy() -> impl Strategy<Value = ControlPolicy> {
    (valid_policy(), corruption()).prop_map(|(policy, c)| corrupt(policy, c))
}

fn any_curve() -> impl Strategy<Value = ChannelCurve> {
    (
        any::<u8>(),
        prop::collection::vec((-3000i32..3000, -3000i32..3000, any::<u8>()), 0..20),
    )
        .prop_map(|(base_duty, raw)| {
            let bands = raw
                .into_iter()
                .map(|(rise, fall, duty)| Band::new(DeciCelsius(rise), DeciCelsius(fall), duty))
                .collect();
            ChannelCurve::new(base_duty, bands)
        })
}

/// Arbitrary field values, valid or not.
pub fn any_policy() -> impl Strategy<Value = ControlPolicy> {
    (
        any_curve(),
        any_curve(),
        any::<bool>(),
        0u64..120_000,
        0u32..100,
    )
        .prop_map(|(cpu, gpu, fan_sync, sample_interval_ms, smoothing_window)| ControlPolicy {
            sample_interval_ms,
            smoothing_window,
            fan_sync,
            channels: PolicyChannels { cpu, gpu },
        })
}

/// Sensor readings, including implausible ones the adapter rejects.
pub fn reading() -> impl Strategy<Value = DeciCelsius> {
    prop_oneof![
        9 => (-400i32..=1500).prop_map(DeciCelsius),
        1 => prop_oneof![-3000i32..-401, 1501i32..3000].prop_map(DeciCelsius),
    ]
}
