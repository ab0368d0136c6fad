//! Fuzz target for request decoding and dispatch.
//!
//! Run with: cargo +nightly fuzz run fuzz_request_decode
//!
//! Every input must produce a response; malformed ones come back as
//! `MALFORMED_REQUEST` rather than a panic.

#![no_main]

use std::sync::Arc;

use cpdk_config::SchemaConfig;
use cpdk_core::{Capabilities, CommandProcessor, Publisher, Registry, Store};
use libfuzzer_sys::fuzz_target;

const SCHEMA: &str = r#"
[[entity]]
name = "Server"

[[entity.field]]
name = "port"
kind = "integer"

[[entity.field]]
name = "enabled"
kind = "boolean"
negative_cmd = "disabled"

[[entity.relationship]]
name = "peers"
target = "Server"
"#;

fuzz_target!(|data: &[u8]| {
    let schema = SchemaConfig::parse(SCHEMA).unwrap();
    let registry = Arc::new(Registry::from_schema(&schema).unwrap());
    let mut store = Store::open(":memory:", registry).unwrap();
    store.sync_schema().unwrap();
    let mut processor = CommandProcessor::new(store, Publisher::new(16));

    let response = processor.handle_raw(data, Capabilities::TRUSTED);
    assert!(response.is_ok() || response.code.is_some());
});
