//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::Path;

use cpdk_config::{AppConfig, SchemaConfig};

/// Fluent builder for [`AppConfig`] in tests.
///
/// Starts from the defaults with an in-memory store.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .sockets_in(dir.path())
///     .schema(sample_schema())
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.store.path = ":memory:".to_string();
        Self { config }
    }

    /// Put all three sockets under `dir`.
    pub fn sockets_in(mut self, dir: &Path) -> Self {
        let socket = |name: &str| dir.join(name).to_string_lossy().into_owned();
        self.config.daemon.cli_socket = socket("cli.sock");
        self.config.daemon.peer_socket = socket("peer.sock");
        self.config.daemon.publish_socket = socket("events.sock");
        self
    }

    pub fn store_path(mut self, path: &str) -> Self {
        self.config.store.path = path.to_string();
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.daemon.queue_depth = depth;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.daemon.event_buffer = capacity;
        self
    }

    pub fn cli_allows_daemon_managed(mut self, allow: bool) -> Self {
        self.config.channels.cli.allow_daemon_managed = allow;
        self
    }

    pub fn peer_allows_daemon_managed(mut self, allow: bool) -> Self {
        self.config.channels.peer.allow_daemon_managed = allow;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn schema(mut self, schema: SchemaConfig) -> Self {
        self.config.schema = schema;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
