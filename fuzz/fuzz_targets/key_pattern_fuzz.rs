//! Fuzz the key and pattern grammar.
//!
//! Input is split at the first newline into a pattern and a key. Parsing
//! must never panic, and a successful match must agree with the pattern's
//! literal prefix.
//!
//! Run with: cargo +nightly fuzz run key_pattern_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use strata_core::{CacheKey, KeyPattern};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (raw_pattern, raw_key) = input.split_once('\n').unwrap_or((input, input));

    let key = CacheKey::parse(raw_key).ok();
    if let Some(key) = &key {
        // Every key is also a literal pattern that matches itself.
        let exact = KeyPattern::parse(key.as_str()).expect("key should parse as a pattern");
        assert!(exact.is_literal());
        assert!(exact.matches(key));
        assert_eq!(exact.as_key().as_ref(), Some(key));
    }

    if let Ok(pattern) = KeyPattern::parse(raw_pattern) {
        assert_eq!(pattern.as_str(), raw_pattern);
        if let Some(key) = &key {
            if pattern.matches(key) {
                assert!(
                    key.as_str().starts_with(&pattern.literal_prefix()),
                    "{key} matched {pattern} but lacks its prefix"
                );
            }
        }
    }
});
