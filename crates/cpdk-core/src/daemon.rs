//! Core daemon process: startup, the single worker loop, and shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cpdk_config::AppConfig;

use crate::processor::{Capabilities, CommandProcessor};
use crate::publisher::Publisher;
use crate::registry::{Registry, RegistryError};
use crate::store::{Store, StoreError};
use crate::transport::server::{self, Job, Lane};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("schema rejected: {0}")]
    Registry(#[from] RegistryError),

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The cpdk daemon.
pub struct Daemon {
    config: AppConfig,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    publisher: Publisher,
}

impl Daemon {
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let publisher = Publisher::new(config.daemon.event_buffer);
        Self {
            config,
            shutdown_tx,
            publisher,
        }
    }

    /// Build the registry and store, bind all three sockets, and serve until
    /// shutdown is requested (Ctrl-C, SIGTERM, or [`Daemon::shutdown`]).
    pub async fn run(&self) -> Result<(), DaemonError> {
        let daemon = &self.config.daemon;
        info!(
            cli = %daemon.cli_socket,
            peer = %daemon.peer_socket,
            publish = %daemon.publish_socket,
            store = %self.config.store.path,
            "cpdk daemon starting"
        );

        let registry = Arc::new(Registry::from_schema(&self.config.schema)?);
        let mut store = Store::open(&self.config.store.path, Arc::clone(&registry))?;
        store.sync_schema()?;
        info!(entities = registry.len(), "schema synced");

        let processor = CommandProcessor::new(store, self.publisher.clone());
        let (cli_tx, cli_rx) = mpsc::channel(daemon.queue_depth);
        let (peer_tx, peer_rx) = mpsc::channel(daemon.queue_depth);
        let worker = Worker {
            processor,
            cli_rx,
            peer_rx,
            cli_caps: self.config.channels.cli.into(),
            peer_caps: self.config.channels.peer.into(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        let mut servers = JoinSet::new();
        let sockets = [
            (
                &daemon.cli_socket,
                server::command_router(Lane::Cli, cli_tx),
            ),
            (
                &daemon.peer_socket,
                server::command_router(Lane::Peer, peer_tx),
            ),
            (
                &daemon.publish_socket,
                server::publish_router(self.publisher.clone(), self.shutdown_tx.clone()),
            ),
        ];
        for (path, app) in sockets {
            let path = PathBuf::from(path);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown_tx = self.shutdown_tx.clone();
            servers.spawn(async move {
                let result = server::serve(&path, app, shutdown_rx).await;
                if let Err(e) = &result {
                    warn!(path = %path.display(), error = %e, "transport server failed");
                    let _ = shutdown_tx.send(ShutdownSignal);
                }
                result
            });
        }

        let signals = tokio::spawn(forward_signals(self.shutdown_tx.clone()));
        worker.run().await;
        let _ = self.shutdown_tx.send(ShutdownSignal);
        signals.abort();

        let mut first_error = None;
        while let Some(joined) = servers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!(error = %e, "transport task aborted"),
            }
        }

        info!("Daemon stopped");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Request a graceful shutdown. The worker finishes the request in
    /// progress, if any, before stopping.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// Handle for observing published change events in-process.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

async fn forward_signals(shutdown_tx: broadcast::Sender<ShutdownSignal>) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, initiating graceful shutdown");
        }
        _ = terminate => {
            warn!("SIGTERM received, initiating graceful shutdown");
        }
    }
    let _ = shutdown_tx.send(ShutdownSignal);
}

/// The single logical worker: owns the processor and drains both request
/// lanes one job at a time.
pub struct Worker {
    processor: CommandProcessor,
    cli_rx: mpsc::Receiver<Job>,
    peer_rx: mpsc::Receiver<Job>,
    cli_caps: Capabilities,
    peer_caps: Capabilities,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

impl Worker {
    pub fn new(
        processor: CommandProcessor,
        cli: (mpsc::Receiver<Job>, Capabilities),
        peer: (mpsc::Receiver<Job>, Capabilities),
        shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) -> Self {
        Self {
            processor,
            cli_rx: cli.0,
            peer_rx: peer.0,
            cli_caps: cli.1,
            peer_caps: peer.1,
            shutdown_rx,
        }
    }

    /// Round-robin over the CLI and peer lanes until shutdown. Each pass
    /// polls both lanes without blocking; only when both are empty does the
    /// worker park until either has work or shutdown arrives.
    pub async fn run(mut self) {
        info!("worker started");
        loop {
            match self.shutdown_rx.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }

            let mut served = false;
            match self.cli_rx.try_recv() {
                Ok(job) => {
                    self.serve(Lane::Cli, job);
                    served = true;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
            match self.peer_rx.try_recv() {
                Ok(job) => {
                    self.serve(Lane::Peer, job);
                    served = true;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
            }
            if served {
                tokio::task::yield_now().await;
                continue;
            }

            let next = tokio::select! {
                _ = self.shutdown_rx.recv() => None,
                Some(job) = self.cli_rx.recv() => Some((Lane::Cli, job)),
                Some(job) = self.peer_rx.recv() => Some((Lane::Peer, job)),
                else => None,
            };
            match next {
                Some((lane, job)) => self.serve(lane, job),
                None => break,
            }
        }
        info!("worker stopped");
    }

    fn serve(&mut self, lane: Lane, job: Job) {
        let caps = match lane {
            Lane::Cli => self.cli_caps,
            Lane::Peer => self.peer_caps,
        };
        let response = self.processor.handle_raw(&job.payload, caps);
        if job.reply.send(response).is_err() {
            debug!(%lane, "caller went away before the reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response, Verb};
    use axum::body::Bytes;
    use cpdk_config::SchemaConfig;
    use tokio::sync::oneshot;

    const SCHEMA: &str = r#"
        [[entity]]
        name = "Interface"
        daemon_managed = true

        [[entity]]
        name = "VirtualServer"

        [[entity.field]]
        name = "port"
        kind = "integer"
    "#;

    fn processor() -> CommandProcessor {
        let schema = SchemaConfig::parse(SCHEMA).unwrap();
        let registry = Arc::new(Registry::from_schema(&schema).unwrap());
        let mut store = Store::open(":memory:", registry).unwrap();
        store.sync_schema().unwrap();
        CommandProcessor::new(store, Publisher::new(16))
    }

    fn job(request: &Request) -> (Job, oneshot::Receiver<Response>) {
        let (reply, rx) = oneshot::channel();
        let payload = Bytes::from(serde_json::to_vec(request).unwrap());
        (Job { payload, reply }, rx)
    }

    #[test]
    fn test_daemon_creation() {
        let daemon = Daemon::new(AppConfig::default());
        assert_eq!(daemon.config().daemon.queue_depth, 64);
        assert_eq!(daemon.publisher().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_daemon_shutdown() {
        let daemon = Daemon::new(AppConfig::default());

        // Shutdown should not panic
        daemon.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_schema_fails_startup() {
        let mut config = AppConfig::default();
        config.store.path = ":memory:".to_string();
        config.schema = SchemaConfig::parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "pools"
            target = "Pool"
        "#,
        )
        .unwrap();
        let result = Daemon::new(config).run().await;
        assert!(matches!(result, Err(DaemonError::Registry(_))));
    }

    #[tokio::test]
    async fn test_worker_applies_lane_capabilities() {
        let (cli_tx, cli_rx) = mpsc::channel(4);
        let (peer_tx, peer_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = Worker::new(
            processor(),
            (cli_rx, Capabilities::default()),
            (peer_rx, Capabilities::TRUSTED),
            shutdown_rx,
        );
        let handle = tokio::spawn(worker.run());

        let create = Request::new(Verb::Create, "Interface").name("eth0");
        let (cli_job, cli_reply) = job(&create);
        cli_tx.send(cli_job).await.unwrap();
        let denied = cli_reply.await.unwrap();
        assert_eq!(denied.code.as_deref(), Some("PERMISSION_DENIED"));

        let (peer_job, peer_reply) = job(&create);
        peer_tx.send(peer_job).await.unwrap();
        assert!(peer_reply.await.unwrap().is_ok());

        shutdown_tx.send(ShutdownSignal).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_drains_both_lanes() {
        let (cli_tx, cli_rx) = mpsc::channel(8);
        let (peer_tx, peer_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // Queue work on both lanes before the worker starts.
        let mut replies = Vec::new();
        for i in 0..3 {
            let (j, r) = job(&Request::new(Verb::Create, "VirtualServer").name(format!("cli{i}")));
            cli_tx.send(j).await.unwrap();
            replies.push(r);
            let (j, r) = job(&Request::new(Verb::Create, "VirtualServer").name(format!("peer{i}")));
            peer_tx.send(j).await.unwrap();
            replies.push(r);
        }

        let worker = Worker::new(
            processor(),
            (cli_rx, Capabilities::default()),
            (peer_rx, Capabilities::TRUSTED),
            shutdown_rx,
        );
        let handle = tokio::spawn(worker.run());

        let mut ids = Vec::new();
        for reply in replies {
            let response = reply.await.unwrap();
            assert!(response.is_ok());
            ids.push(response.id.unwrap());
        }
        // Interleaved service: cli0, peer0, cli1, peer1, ...
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

        shutdown_tx.send(ShutdownSignal).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_survives_garbage() {
        let (cli_tx, cli_rx) = mpsc::channel(4);
        let (_peer_tx, peer_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = Worker::new(
            processor(),
            (cli_rx, Capabilities::default()),
            (peer_rx, Capabilities::TRUSTED),
            shutdown_rx,
        );
        let handle = tokio::spawn(worker.run());

        let (reply, rx) = oneshot::channel();
        cli_tx
            .send(Job {
                payload: Bytes::from_static(b"\xff\xfe garbage"),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().code.as_deref(), Some("MALFORMED_REQUEST"));

        let (j, r) = job(&Request::new(Verb::List, "VirtualServer"));
        cli_tx.send(j).await.unwrap();
        assert!(r.await.unwrap().is_ok());

        shutdown_tx.send(ShutdownSignal).unwrap();
        handle.await.unwrap();
    }
}
