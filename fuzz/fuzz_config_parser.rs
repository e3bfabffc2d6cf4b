//! Fuzz target for the daemon configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`; parsing plus validation must
//! never panic, and anything accepted must survive a TOML round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = fanguard_config::AppConfig::parse(s) {
        if let Ok(text) = toml::to_string(&config) {
            assert!(fanguard_config::AppConfig::parse(&text).is_ok());
        }
    }
});
