//! In-process publish/subscribe.
//!
//! Every event, whether produced locally or received from a remote bus,
//! flows through a [`LocalDispatcher`]. Handlers run synchronously on the
//! publishing thread in registration order. The channel table lock is
//! released before any handler runs, so handlers may publish, subscribe,
//! or unsubscribe re-entrantly.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::warn;

use crate::constants::ALL_EVENTS_CHANNEL;
use crate::envelope::Envelope;

/// A subscriber callback.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

/// Channel-keyed synchronous event dispatcher.
pub struct LocalDispatcher {
    channels: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl LocalDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register `handler` for `channel`.
    pub fn subscribe<F>(self: &Arc<Self>, channel: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .write()
            .entry(channel.clone())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        Subscription {
            dispatcher: Arc::downgrade(self),
            channel,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Register `handler` for every published event.
    pub fn subscribe_all<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe(ALL_EVENTS_CHANNEL, handler)
    }

    /// Deliver to listeners of `envelope.event_type`, then to all-events listeners.
    pub fn publish(&self, envelope: &Envelope) {
        let _ = self.deliver(&envelope.event_type, envelope);
        if envelope.event_type != ALL_EVENTS_CHANNEL {
            let _ = self.deliver(ALL_EVENTS_CHANNEL, envelope);
        }
    }

    /// Deliver to listeners of a control channel only.
    ///
    /// Returns the number of handlers invoked.
    pub fn notify(&self, channel: &str, envelope: &Envelope) -> usize {
        self.deliver(channel, envelope)
    }

    /// Number of handlers registered on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.channels.write().clear();
    }

    fn deliver(&self, channel: &str, envelope: &Envelope) -> usize {
        let handlers: Vec<Handler> = match self.channels.read().get(channel) {
            Some(regs) => regs.iter().map(|r| Arc::clone(&r.handler)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                warn!(
                    channel,
                    event_type = %envelope.event_type,
                    "event handler panicked, continuing delivery"
                );
            }
        }
        handlers.len()
    }

    fn remove(&self, channel: &str, id: u64) {
        let mut channels = self.channels.write();
        if let Some(regs) = channels.get_mut(channel) {
            regs.retain(|r| r.id != id);
            if regs.is_empty() {
                let _ = channels.remove(channel);
            }
        }
    }
}

/// Handle returned by [`LocalDispatcher::subscribe`].
///
/// Dropping it keeps the registration alive; call [`unsubscribe`](Self::unsubscribe)
/// to remove it.
pub struct Subscription {
    dispatcher: Weak<LocalDispatcher>,
    channel: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the registration. Safe to call repeatedly and after the
    /// dispatcher is gone.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(&self.channel, self.id);
        }
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has not been called yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
