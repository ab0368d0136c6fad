//! Daemon test harness.
//!
//! [`TestDaemon`] runs the full daemon (registry, store, worker, and all
//! three sockets) inside the test's runtime, with its sockets in a private
//! temp directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cpdk_config::AppConfig;
use cpdk_core::{Daemon, DaemonClient, DaemonError};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::config::TestConfigBuilder;
use crate::schema::sample_schema;

const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// A running daemon scoped to one test.
///
/// The daemon is asked to shut down and the temp directory is deleted when
/// this value is dropped, guaranteeing cleanup even on panic.
pub struct TestDaemon {
    daemon: Arc<Daemon>,
    handle: Option<JoinHandle<Result<(), DaemonError>>>,
    temp_dir: TempDir,
}

impl TestDaemon {
    /// Sample schema, in-memory store, default channel capabilities.
    pub async fn start() -> Self {
        Self::start_with(|builder| builder).await
    }

    /// Like [`TestDaemon::start`], with the config adjusted by `customise`.
    /// Socket paths are always placed in the harness's temp directory.
    pub async fn start_with(
        customise: impl FnOnce(TestConfigBuilder) -> TestConfigBuilder,
    ) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let builder = TestConfigBuilder::new().schema(sample_schema());
        let config = customise(builder).sockets_in(temp_dir.path()).build();
        Self::spawn(config, temp_dir).await
    }

    /// Load the daemon's config from a TOML file written into the temp
    /// directory (so relative `registry.schema_path` values resolve there),
    /// optionally alongside a schema file named `schema.toml`.
    pub async fn with_toml(config_toml: &str, schema_toml: Option<&str>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        if let Some(schema) = schema_toml {
            tokio::fs::write(temp_dir.path().join("schema.toml"), schema)
                .await
                .expect("failed to write test schema");
        }
        let config_path = temp_dir.path().join("cpdk.toml");
        tokio::fs::write(&config_path, config_toml)
            .await
            .expect("failed to write test config");

        let loaded = AppConfig::load(&config_path)
            .await
            .expect("failed to parse test config");
        let config = TestConfigBuilder::new()
            .schema(loaded.schema.clone())
            .store_path(&loaded.store.path)
            .cli_allows_daemon_managed(loaded.channels.cli.allow_daemon_managed)
            .peer_allows_daemon_managed(loaded.channels.peer.allow_daemon_managed)
            .sockets_in(temp_dir.path())
            .build();
        Self::spawn(config, temp_dir).await
    }

    async fn spawn(config: AppConfig, temp_dir: TempDir) -> Self {
        let daemon = Arc::new(Daemon::new(config));
        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { runner.run().await });

        let harness = Self {
            daemon,
            handle: Some(handle),
            temp_dir,
        };
        harness.wait_ready().await;
        harness
    }

    async fn wait_ready(&self) {
        let clients = [self.cli(), self.peer(), self.events()];
        let ready = async {
            for client in &clients {
                while client.health().await.is_err() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        tokio::time::timeout(READY_TIMEOUT, ready)
            .await
            .expect("daemon sockets did not come up");
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Client on the interactive (CLI) channel.
    pub fn cli(&self) -> DaemonClient {
        DaemonClient::new(&self.daemon.config().daemon.cli_socket)
    }

    /// Client on the trusted peer channel.
    pub fn peer(&self) -> DaemonClient {
        DaemonClient::new(&self.daemon.config().daemon.peer_socket)
    }

    /// Client on the publish socket.
    pub fn events(&self) -> DaemonClient {
        DaemonClient::new(&self.daemon.config().daemon.publish_socket)
    }

    /// Shut down and wait for the daemon to finish.
    pub async fn stop(mut self) -> Result<(), DaemonError> {
        self.daemon.shutdown();
        match self.handle.take() {
            Some(handle) => handle.await.expect("daemon task panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.daemon.shutdown();
        }
    }
}
