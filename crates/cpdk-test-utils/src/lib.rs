#![deny(unsafe_code)]

//! Shared test utilities for the CPDK workspace.
//!
//! Provides reusable fixtures, config builders, an in-process daemon
//! harness, and tracing helpers so that individual crate tests stay concise
//! and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! cpdk-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod schema;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::TestDaemon;
pub use schema::{SAMPLE_SCHEMA, sample_schema};
