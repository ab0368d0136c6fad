//! Notification publisher: fire-and-forget fan-out of change events.
//!
//! Each event is encoded once and handed to every live subscriber through a
//! `broadcast` channel. There is no persistence or replay: a subscriber only
//! sees events published after it subscribed, and one that falls more than
//! the channel capacity behind loses the overflow.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::protocol::ChangeEvent;

/// Errors from publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode change event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One encoded notification and the topic it was published on.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: Arc<str>,
    /// Wire form, newline-terminated.
    pub line: Arc<str>,
}

/// Cloneable publishing handle.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Published>,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish one event on the topic named by its entity type. Returns how
    /// many subscribers it reached; zero is not an error.
    pub fn publish(&self, event: &ChangeEvent) -> Result<usize, PublishError> {
        let mut line = event.to_wire()?;
        line.push('\n');
        let published = Published {
            topic: Arc::from(event.entity.as_str()),
            line: Arc::from(line),
        };
        let reached = self.tx.send(published).unwrap_or(0);
        debug!(
            entity = %event.entity,
            op = ?event.payload.op,
            subscribers = reached,
            "change event published"
        );
        Ok(reached)
    }

    /// Raw receiver over every topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }

    /// Encoded lines for one topic, or for every topic when `topic` is
    /// `None`.
    pub fn stream(&self, topic: Option<String>) -> impl Stream<Item = Arc<str>> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(p) if topic.as_deref().is_none_or(|t| &*p.topic == t) => Some(p.line),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber fell behind; events dropped");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
