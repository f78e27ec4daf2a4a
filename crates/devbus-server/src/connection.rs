//! A live consumer of a server bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Outbound queue depth per consumer.
pub const CONSUMER_QUEUE: usize = 1024;

/// Transport a consumer is attached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Bidirectional socket peer.
    Socket,
    /// One-way `text/event-stream` subscriber.
    EventStream,
}

/// A socket peer or event-stream subscriber receiving fan-out.
pub struct Consumer {
    /// Unique connection ID.
    pub id: String,
    /// Peer-supplied `clientId`, if any.
    pub peer: Option<String>,
    /// Transport kind.
    pub kind: ConsumerKind,
    tx: mpsc::Sender<Arc<String>>,
    /// When this consumer was added.
    pub connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl Consumer {
    /// Create a consumer with a fresh connection ID.
    pub fn new(kind: ConsumerKind, peer: Option<String>, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            peer,
            kind,
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Identity used to skip this consumer's own frames during fan-out.
    pub fn origin(&self) -> &str {
        self.peer.as_deref().unwrap_or(&self.id)
    }

    /// Whether `origin` names this consumer.
    pub fn is_origin(&self, origin: &str) -> bool {
        self.id == origin || self.peer.as_deref() == Some(origin)
    }

    /// Queue a frame for delivery.
    ///
    /// Returns `false` if the queue is full or the consumer is gone, and
    /// increments the dropped message counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total frames dropped for this consumer.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Consumer age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
