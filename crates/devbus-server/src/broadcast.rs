//! The connection set and fan-out.
//!
//! Membership changes happen from request handlers and from `Drop` guards,
//! so the set uses a synchronous lock that is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::connection::{Consumer, ConsumerKind};

/// Live consumers of one server bus.
pub struct ConnectionSet {
    consumers: RwLock<HashMap<String, Arc<Consumer>>>,
}

impl ConnectionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// Add a consumer. Returns its connection ID.
    pub fn add(&self, consumer: Consumer) -> String {
        let id = consumer.id.clone();
        debug!(conn_id = %id, kind = ?consumer.kind, peer = ?consumer.peer, "consumer added");
        let _ = self.consumers.write().insert(id.clone(), Arc::new(consumer));
        id
    }

    /// Remove a consumer by ID. Removing an absent ID is a no-op.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.consumers.write().remove(id).is_some();
        if removed {
            debug!(conn_id = %id, "consumer removed");
        }
        removed
    }

    /// Deliver `frame` to every consumer except the one `origin` names.
    ///
    /// Returns the number of consumers the frame was queued for.
    pub fn fan_out(&self, frame: &Arc<String>, origin: Option<&str>) -> usize {
        let consumers = self.consumers.read();
        let mut delivered = 0;
        for consumer in consumers.values() {
            if origin.is_some_and(|o| consumer.is_origin(o)) {
                continue;
            }
            if consumer.send(Arc::clone(frame)) {
                delivered += 1;
            } else {
                warn!(
                    conn_id = %consumer.id,
                    dropped = consumer.drop_count(),
                    "failed to queue frame for consumer"
                );
            }
        }
        delivered
    }

    /// Drop every consumer, closing their outbound queues.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.consumers.write().drain().collect();
        drained.len()
    }

    /// Number of live consumers.
    pub fn connection_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Number of live consumers of one kind.
    pub fn count_of(&self, kind: ConsumerKind) -> usize {
        self.consumers
            .read()
            .values()
            .filter(|c| c.kind == kind)
            .count()
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a consumer from its set when dropped.
pub struct ConsumerGuard {
    set: Arc<ConnectionSet>,
    id: String,
}

impl ConsumerGuard {
    /// Guard `id` in `set`.
    pub fn new(set: Arc<ConnectionSet>, id: String) -> Self {
        Self { set, id }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let _ = self.set.remove(&self.id);
    }
}
