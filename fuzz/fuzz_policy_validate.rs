//! Fuzz target for policy parsing, validation and band tracking.
//!
//! Run with: cargo +nightly fuzz run fuzz_policy_validate
//!
//! Any policy that validates is then walked through a temperature sweep:
//! band indices must stay in range and duties must never exceed 100 %.

#![no_main]

use fanguard_config::policy::DeciCelsius;
use fanguard_config::{ControlPolicy, FanChannel};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(policy) = ControlPolicy::parse_toml(s) else {
        return;
    };

    for channel in FanChannel::ALL {
        let curve = policy.curve(channel);
        let mut band = curve.initial_band(DeciCelsius(0));
        for t in (-400..=1500).step_by(7).chain((-400..=1500).rev().step_by(11)) {
            band = curve.step(band, DeciCelsius(t));
            assert!(band < curve.band_count());
            assert!(curve.duty_for(band) <= 100);
        }
    }
});
