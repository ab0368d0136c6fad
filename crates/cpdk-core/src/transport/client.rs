//! Daemon client: speaks HTTP/1.1 to a daemon socket with `hyper`.
//!
//! One client targets one socket: point it at the CLI or peer socket to send
//! commands, or at the publish socket to subscribe to change events.

use std::path::PathBuf;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::UnixStream;
use tracing::debug;

use super::types::*;
use crate::protocol::{ChangeEvent, Request, Response, Verb};
use crate::registry::is_identifier;

/// Errors from the daemon client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("daemon returned error: {0}")]
    Daemon(String),

    #[error("invalid topic {0:?}: topics are entity type names")]
    InvalidTopic(String),
}

/// Client for one daemon socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Whether the socket file exists (the daemon is likely running).
    pub fn daemon_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Open a connection and send one request, returning the response head
    /// and a streaming body.
    async fn open(
        &self,
        method: hyper::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<hyper::Response<Incoming>, ClientError> {
        if !self.daemon_available() {
            return Err(ClientError::NotRunning(self.socket_path.clone()));
        }

        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| ClientError::Connect {
                    path: self.socket_path.clone(),
                    source: e,
                })?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| ClientError::Request(format!("HTTP handshake failed: {e}")))?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "daemon connection closed with error");
            }
        });

        debug!(%method, path, "daemon request");

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
            .map_err(|e| ClientError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClientError::Request(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = collect(resp).await?;
            if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&body) {
                return Err(ClientError::Daemon(err.error));
            }
            return Err(ClientError::Request(format!("unexpected status: {status}")));
        }
        Ok(resp)
    }

    // ── Protocol ───────────────────────────────────────────────────────

    /// Send one protocol request. Protocol-level failures come back as an
    /// `error` [`Response`], not as `Err`.
    pub async fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ClientError::Parse(format!("failed to encode request: {e}")))?;
        self.send_raw(payload).await
    }

    /// Send pre-encoded request bytes.
    pub async fn send_raw(&self, payload: Vec<u8>) -> Result<Response, ClientError> {
        let resp = self
            .open(hyper::Method::POST, "/command", Some(payload))
            .await?;
        let body = collect(resp).await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Parse(format!("command: {e}")))
    }

    pub async fn get(&self, entity: &str, name: &str) -> Result<Response, ClientError> {
        self.send(&Request::new(Verb::Get, entity).name(name)).await
    }

    pub async fn get_or_create(&self, entity: &str, name: &str) -> Result<Response, ClientError> {
        self.send(&Request::new(Verb::GetOrCreate, entity).name(name))
            .await
    }

    pub async fn create(&self, entity: &str, name: &str) -> Result<Response, ClientError> {
        self.send(&Request::new(Verb::Create, entity).name(name)).await
    }

    /// Set `field`. `None` sends no value, which sets a boolean to true.
    pub async fn modify(
        &self,
        entity: &str,
        name: &str,
        field: &str,
        value: Option<Value>,
    ) -> Result<Response, ClientError> {
        let mut request = Request::new(Verb::Modify, entity).name(name).field(field);
        request.fv = value;
        self.send(&request).await
    }

    pub async fn delete(&self, entity: &str, name: &str) -> Result<Response, ClientError> {
        self.send(&Request::new(Verb::Delete, entity).name(name)).await
    }

    pub async fn delete_all(&self, entity: &str) -> Result<Response, ClientError> {
        self.send(&Request::new(Verb::DeleteAll, entity)).await
    }

    pub async fn list(&self, entity: &str, name: Option<&str>) -> Result<Response, ClientError> {
        let mut request = Request::new(Verb::List, entity);
        request.on = name.map(str::to_string);
        self.send(&request).await
    }

    pub async fn add_ref(
        &self,
        entity: &str,
        name: &str,
        relationship: &str,
        target: &str,
    ) -> Result<Response, ClientError> {
        self.send(
            &Request::new(Verb::AddRef, entity)
                .name(name)
                .relationship(relationship)
                .value(target),
        )
        .await
    }

    pub async fn del_ref(
        &self,
        entity: &str,
        name: &str,
        relationship: &str,
        target: &str,
    ) -> Result<Response, ClientError> {
        self.send(
            &Request::new(Verb::DelRef, entity)
                .name(name)
                .relationship(relationship)
                .value(target),
        )
        .await
    }

    // ── Other endpoints ────────────────────────────────────────────────

    /// Health check: is the daemon running and responsive?
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let resp = self.open(hyper::Method::GET, "/health", None).await?;
        let body = collect(resp).await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Parse(format!("health: {e}")))
    }

    /// Subscribe to change events. Only events published after this returns
    /// are delivered.
    pub async fn subscribe(&self, topic: Option<&str>) -> Result<Subscription, ClientError> {
        let path = match topic {
            Some(topic) if !is_identifier(topic) => {
                return Err(ClientError::InvalidTopic(topic.to_string()));
            }
            Some(topic) => format!("/events?topic={topic}"),
            None => "/events".to_string(),
        };
        let resp = self.open(hyper::Method::GET, &path, None).await?;
        Ok(Subscription {
            body: resp.into_body(),
            buf: Vec::new(),
        })
    }
}

async fn collect(resp: hyper::Response<Incoming>) -> Result<Bytes, ClientError> {
    resp.into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| ClientError::Request(format!("failed to read response body: {e}")))
}

/// A live event stream from the publish socket.
pub struct Subscription {
    body: Incoming,
    buf: Vec<u8>,
}

impl Subscription {
    /// Next change event, or `None` once the daemon closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<ChangeEvent>, ClientError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = std::str::from_utf8(&line[..pos])
                    .map_err(|e| ClientError::Parse(format!("event: {e}")))?;
                if text.trim().is_empty() {
                    continue;
                }
                return ChangeEvent::from_wire(text)
                    .map(Some)
                    .map_err(|e| ClientError::Parse(format!("event: {e}")));
            }

            match self.body.frame().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ClientError::Request(format!("event stream: {e}"))),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buf.extend_from_slice(&data);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = DaemonClient::new("/tmp/test-cpdk-client.sock");
        assert!(!client.daemon_available());
    }

    #[tokio::test]
    async fn test_client_not_running_error() {
        let client = DaemonClient::new("/tmp/nonexistent-cpdk.sock");
        let result = client.health().await;
        assert!(matches!(result, Err(ClientError::NotRunning(_))));
        let result = client.get("Server", "s1").await;
        assert!(matches!(result, Err(ClientError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_non_identifier_topic() {
        let client = DaemonClient::new("/tmp/nonexistent-cpdk.sock");
        for topic in ["a b", "Server&topic=x", "", "1st"] {
            let result = client.subscribe(Some(topic)).await;
            assert!(
                matches!(&result, Err(ClientError::InvalidTopic(t)) if t == topic),
                "{topic:?}"
            );
        }
        // A well-formed topic gets as far as connecting.
        let result = client.subscribe(Some("VirtualServer")).await;
        assert!(matches!(result, Err(ClientError::NotRunning(_))));
    }
}
