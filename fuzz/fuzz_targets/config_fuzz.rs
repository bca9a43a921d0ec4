//! Fuzz config parsing and validation.
//!
//! Arbitrary TOML must produce a config or a `ConfigError`, never a panic.
//!
//! Run with: cargo +nightly fuzz run config_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use strata_core::StrataConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = StrataConfig::from_toml(input) {
        if config.validate().is_ok() {
            for attempt in 0..=config.realtime.reconnect.max_attempts.min(64) {
                let delay = config.realtime.reconnect.delay_for(attempt);
                assert!(delay.as_millis() <= u128::from(config.realtime.reconnect.max_ms));
            }
        }
    }
});
