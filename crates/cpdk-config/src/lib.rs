#![deny(unsafe_code)]

//! Configuration loading and validation for the CPDK control-plane daemon.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure,
//! and the [`schema`] module describing the entity types the daemon serves.

/// Declarative entity/field/relationship description.
pub mod schema;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use schema::{EntityConfig, FieldConfig, RelationshipConfig, SchemaConfig};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon sockets and queue sizing.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Persisted store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-channel capability flags.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where the schema comes from when it is not inline.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Inline schema (`[[schema.entity]]`). Replaced by the file named in
    /// `registry.schema_path` when that is set.
    #[serde(default)]
    pub schema: SchemaConfig,
}

/// Configuration for the daemon's transport front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Request/reply socket for interactive CLI callers.
    #[serde(default = "default_cli_socket")]
    pub cli_socket: String,

    /// Request/reply socket for trusted peer processes.
    #[serde(default = "default_peer_socket")]
    pub peer_socket: String,

    /// One-way change-notification socket.
    #[serde(default = "default_publish_socket")]
    pub publish_socket: String,

    /// Pending requests buffered per request channel.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Notifications buffered per subscriber before it starts losing events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cli_socket: default_cli_socket(),
            peer_socket: default_peer_socket(),
            publish_socket: default_publish_socket(),
            queue_depth: default_queue_depth(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_cli_socket() -> String {
    "/tmp/cpdk-cli.sock".to_string()
}

fn default_peer_socket() -> String {
    "/tmp/cpdk-peer.sock".to_string()
}

fn default_publish_socket() -> String {
    "/tmp/cpdk-events.sock".to_string()
}

fn default_queue_depth() -> usize {
    64
}

fn default_event_buffer() -> usize {
    1024
}

/// Persisted store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `:memory:` keeps everything in-process.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "cpdk.db".to_string()
}

/// Capability flags for both request channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Channel used by external CLIs.
    #[serde(default = "default_cli_channel")]
    pub cli: ChannelConfig,

    /// Channel used by trusted peer processes.
    #[serde(default = "default_peer_channel")]
    pub peer: ChannelConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            cli: default_cli_channel(),
            peer: default_peer_channel(),
        }
    }
}

/// Capability flags for a single request channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether create/delete of daemon-managed types and writes to
    /// display-only fields are permitted on this channel.
    #[serde(default)]
    pub allow_daemon_managed: bool,
}

fn default_cli_channel() -> ChannelConfig {
    ChannelConfig {
        allow_daemon_managed: false,
    }
}

fn default_peer_channel() -> ChannelConfig {
    ChannelConfig {
        allow_daemon_managed: true,
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "cpdk_core=trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Schema source configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Standalone schema file. Relative paths resolve against the
    /// directory of the config file that names them.
    #[serde(default)]
    pub schema_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    ///
    /// When `registry.schema_path` is set the schema file is read as well and
    /// replaces any inline schema.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: AppConfig = toml::from_str(&content)?;

        if let Some(schema_path) = config.resolve_schema_path(path) {
            tracing::debug!(path = %schema_path.display(), "Loading schema file");
            config.schema = SchemaConfig::load(&schema_path).await?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// `registry.schema_path` is not followed here; use [`AppConfig::load`].
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_schema_path(&self, config_path: &Path) -> Option<PathBuf> {
        let schema_path = PathBuf::from(self.registry.schema_path.as_deref()?);
        if schema_path.is_absolute() {
            return Some(schema_path);
        }
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(schema_path))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sockets = [
            ("daemon.cli_socket", &self.daemon.cli_socket),
            ("daemon.peer_socket", &self.daemon.peer_socket),
            ("daemon.publish_socket", &self.daemon.publish_socket),
        ];
        for (key, value) in sockets {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{key} must not be empty")));
            }
        }
        if self.daemon.cli_socket == self.daemon.peer_socket
            || self.daemon.cli_socket == self.daemon.publish_socket
            || self.daemon.peer_socket == self.daemon.publish_socket
        {
            return Err(ConfigError::Validation(
                "daemon sockets must use three distinct paths".to_string(),
            ));
        }
        if self.daemon.queue_depth == 0 {
            return Err(ConfigError::Validation(
                "daemon.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.daemon.event_buffer == 0 {
            return Err(ConfigError::Validation(
                "daemon.event_buffer must be at least 1".to_string(),
            ));
        }
        if self.store.path.is_empty() {
            return Err(ConfigError::Validation(
                "store.path must not be empty".to_string(),
            ));
        }
        if self.logging.level.is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }

        self.schema.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.cli_socket, "/tmp/cpdk-cli.sock");
        assert_eq!(config.daemon.queue_depth, 64);
        assert_eq!(config.store.path, "cpdk.db");
        assert_eq!(config.logging.level, "info");
        assert!(config.schema.entities.is_empty());
    }

    #[test]
    fn test_default_channel_capabilities() {
        let config = AppConfig::default();
        assert!(!config.channels.cli.allow_daemon_managed);
        assert!(config.channels.peer.allow_daemon_managed);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.daemon.event_buffer, 1024);
        assert!(config.channels.peer.allow_daemon_managed);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            cli_socket = "/run/cpdk/cli.sock"
            peer_socket = "/run/cpdk/peer.sock"
            publish_socket = "/run/cpdk/events.sock"
            queue_depth = 8

            [store]
            path = ":memory:"

            [channels.cli]
            allow_daemon_managed = true

            [logging]
            level = "debug"

            [[schema.entity]]
            name = "Server"

            [[schema.entity.field]]
            name = "port"
            kind = "integer"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.daemon.cli_socket, "/run/cpdk/cli.sock");
        assert_eq!(config.daemon.queue_depth, 8);
        assert_eq!(config.store.path, ":memory:");
        assert!(config.channels.cli.allow_daemon_managed);
        // Peer table omitted: keeps its default.
        assert!(config.channels.peer.allow_daemon_managed);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.schema.entities.len(), 1);
        assert_eq!(config.schema.entities[0].fields[0].kind, "integer");
    }

    #[test]
    fn test_validation_rejects_shared_socket() {
        let toml = r#"
            [daemon]
            cli_socket = "/tmp/one.sock"
            peer_socket = "/tmp/one.sock"
        "#;
        let result = AppConfig::parse(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_empty_socket() {
        let toml = r#"
            [daemon]
            publish_socket = ""
        "#;
        let err = AppConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("daemon.publish_socket"));
    }

    #[test]
    fn test_validation_rejects_zero_queue_depth() {
        let toml = r#"
            [daemon]
            queue_depth = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_event_buffer() {
        let toml = r#"
            [daemon]
            event_buffer = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_store_path() {
        let toml = r#"
            [store]
            path = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cpdk.toml");
        tokio::fs::write(&path, b"[store]\npath = \"/var/lib/cpdk/cpdk.db\"\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.store.path, "/var/lib/cpdk/cpdk.db");
    }

    #[tokio::test]
    async fn test_load_follows_relative_schema_path() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("cpdk.toml");
        let schema_path = tmp.path().join("models.toml");
        tokio::fs::write(
            &config_path,
            b"[registry]\nschema_path = \"models.toml\"\n\n[[schema.entity]]\nname = \"Ignored\"\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            &schema_path,
            b"[[entity]]\nname = \"VirtualServer\"\n\n[[entity.field]]\nname = \"port\"\nkind = \"integer\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&config_path).await.unwrap();
        assert_eq!(config.schema.entities.len(), 1);
        assert_eq!(config.schema.entities[0].name, "VirtualServer");
    }

    #[tokio::test]
    async fn test_load_missing_schema_file() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("cpdk.toml");
        tokio::fs::write(&config_path, b"[registry]\nschema_path = \"absent.toml\"\n")
            .await
            .unwrap();

        let result = AppConfig::load(&config_path).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(result.is_err());
    }

    // ── Error display ─────────────────────────────────────────────────

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::parse(&rendered).unwrap();
        assert_eq!(parsed.daemon.peer_socket, config.daemon.peer_socket);
    }
}
