//! Fuzz target for the TOML configuration and schema parsers.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text through `AppConfig::parse()`, `SchemaConfig::parse()`
//! and registry construction, none of which may panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let _ = cpdk_config::AppConfig::parse(s);
    if let Ok(schema) = cpdk_config::SchemaConfig::parse(s) {
        let _ = cpdk_core::Registry::from_schema(&schema);
    }
});
