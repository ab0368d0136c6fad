#![deny(unsafe_code)]

//! cpdk CLI: runs the daemon and talks to a running one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cpdk_config::AppConfig;
use cpdk_core::{DaemonClient, Registry, Request, Response, Store, Verb};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// cpdk: schema-driven control-plane configuration daemon.
#[derive(Parser)]
#[command(name = "cpdk", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "cpdk.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Send commands over the peer socket instead of the CLI socket.
    #[arg(long, global = true)]
    peer: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start the cpdk daemon.
    Start,

    /// Create any missing tables for the configured schema.
    Syncdb,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Print the entity types the schema declares.
    Schema,

    /// Check that the daemon answers on the selected socket.
    Health,

    /// Look up an instance by name.
    Get { entity: String, name: String },

    /// Return an instance, creating it first if needed.
    GetOrCreate { entity: String, name: String },

    /// Create a new instance.
    Create { entity: String, name: String },

    /// Set a field. Omitting VALUE sets a boolean field to true.
    Modify {
        entity: String,
        name: String,
        field: String,
        /// Sent as text and converted to the field's kind by the daemon;
        /// `null` clears the field.
        value: Option<String>,
    },

    /// Delete an instance.
    Delete { entity: String, name: String },

    /// Delete every instance of a type.
    DeleteAll { entity: String },

    /// List all instances of a type, or one by name.
    List { entity: String, name: Option<String> },

    /// Relate an instance to a target instance.
    AddRef {
        entity: String,
        name: String,
        relationship: String,
        target: String,
    },

    /// Remove a relationship edge.
    DelRef {
        entity: String,
        name: String,
        relationship: String,
        target: String,
    },

    /// Print change notifications as they are published.
    Watch {
        /// Only show changes to this entity type.
        topic: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await;

    // RUST_LOG wins, then -v, then the configured level.
    let filter = match (cli.verbose, &config) {
        (0, Ok(config)) => config.logging.level.clone(),
        (0, Err(_)) => "info".to_string(),
        (1, _) => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config?;
    match cli.command {
        Commands::Start => cmd_start(config).await,
        Commands::Syncdb => cmd_syncdb(&config),
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
        Commands::Schema => cmd_schema(&config),
        Commands::Health => cmd_health(&client(&config, cli.peer)).await,
        Commands::Watch { topic } => cmd_watch(&config, topic.as_deref()).await,
        command => {
            let request = request_for(&command).context("not a daemon command")?;
            cmd_send(&client(&config, cli.peer), &request).await
        }
    }
}

async fn cmd_start(config: AppConfig) -> Result<()> {
    info!("Starting cpdk daemon");
    let daemon = cpdk_core::Daemon::new(config);
    daemon.run().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn cmd_syncdb(config: &AppConfig) -> Result<()> {
    let registry = Arc::new(Registry::from_schema(&config.schema)?);
    let mut store = Store::open(&config.store.path, Arc::clone(&registry))?;
    store.sync_schema()?;
    println!(
        "Synced {} entity types into '{}'.",
        registry.len(),
        config.store.path
    );
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

fn cmd_schema(config: &AppConfig) -> Result<()> {
    let registry = Registry::from_schema(&config.schema)?;
    print!("{}", describe(&registry));
    Ok(())
}

async fn cmd_health(client: &DaemonClient) -> Result<()> {
    let health = client.health().await?;
    println!(
        "{} ({} channel): cpdk {} ({}, {})",
        health.status, health.channel, health.version, health.git_hash, health.build_profile
    );
    Ok(())
}

async fn cmd_send(client: &DaemonClient, request: &Request) -> Result<()> {
    let response = client.send(request).await?;
    println!("{}", render(&response)?);
    if !response.is_ok() {
        bail!(
            "{} failed: {}",
            request.t,
            response.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_watch(config: &AppConfig, topic: Option<&str>) -> Result<()> {
    let client = DaemonClient::new(&config.daemon.publish_socket);
    let mut subscription = client.subscribe(topic).await?;
    info!(topic = ?topic, "watching for changes");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = subscription.next_event() => match event? {
                Some(event) => println!("{}", event.to_wire()?),
                None => return Ok(()),
            },
        }
    }
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

fn client(config: &AppConfig, peer: bool) -> DaemonClient {
    if peer {
        DaemonClient::new(&config.daemon.peer_socket)
    } else {
        DaemonClient::new(&config.daemon.cli_socket)
    }
}

/// The protocol request a client subcommand sends, or `None` for commands
/// that run locally.
fn request_for(command: &Commands) -> Option<Request> {
    let request = match command {
        Commands::Get { entity, name } => Request::new(Verb::Get, entity).name(name),
        Commands::GetOrCreate { entity, name } => {
            Request::new(Verb::GetOrCreate, entity).name(name)
        }
        Commands::Create { entity, name } => Request::new(Verb::Create, entity).name(name),
        Commands::Modify {
            entity,
            name,
            field,
            value,
        } => {
            let mut request = Request::new(Verb::Modify, entity).name(name).field(field);
            request.fv = value.as_deref().map(parse_value);
            request
        }
        Commands::Delete { entity, name } => Request::new(Verb::Delete, entity).name(name),
        Commands::DeleteAll { entity } => Request::new(Verb::DeleteAll, entity),
        Commands::List { entity, name } => {
            let mut request = Request::new(Verb::List, entity);
            request.on = name.clone();
            request
        }
        Commands::AddRef {
            entity,
            name,
            relationship,
            target,
        } => Request::new(Verb::AddRef, entity)
            .name(name)
            .relationship(relationship)
            .value(target.as_str()),
        Commands::DelRef {
            entity,
            name,
            relationship,
            target,
        } => Request::new(Verb::DelRef, entity)
            .name(name)
            .relationship(relationship)
            .value(target.as_str()),
        _ => return None,
    };
    Some(request)
}

/// Arguments go out as text so a string field keeps `8080` verbatim; the
/// daemon parses text for every other kind.
fn parse_value(raw: &str) -> Value {
    match raw {
        "null" => Value::Null,
        _ => Value::String(raw.to_string()),
    }
}

fn render(response: &Response) -> Result<String> {
    if let Some(message) = &response.message {
        let code = response.code.as_deref().unwrap_or("ERROR");
        return Ok(format!("error [{code}]: {message}"));
    }
    match &response.result {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(result) => Ok(serde_json::to_string_pretty(result)?),
        None => Ok("ok".to_string()),
    }
}

fn describe(registry: &Registry) -> String {
    let mut out = String::new();
    for entity in registry.entities() {
        let managed = if entity.daemon_managed {
            " (daemon-managed)"
        } else {
            ""
        };
        out.push_str(&format!("{} [{}]{managed}\n", entity.name, entity.table));
        for field in &entity.fields {
            let mut line = format!("  {}: {}", field.name, field.kind);
            if let Some(alias) = &field.negative_cmd {
                line.push_str(&format!(" (negate: {alias})"));
            }
            if field.display_only {
                line.push_str(" (display-only)");
            }
            out.push_str(&line);
            out.push('\n');
        }
        for rel in &entity.relationships {
            let mut line = format!(
                "  {} -> {} ({})",
                rel.name,
                rel.target,
                rel.cardinality.as_str()
            );
            if let Some(inverse) = &rel.inverse {
                line.push_str(&format!(" inverse {inverse}"));
            }
            if rel.read_only {
                line.push_str(" (read-only)");
            }
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}
