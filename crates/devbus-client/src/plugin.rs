//! `PluginEventClient`: a plugin's namespaced view of the bus.
//!
//! A plugin only names its events; the client rewrites them to
//! `"<pluginId>:<name>"` and talks to whichever [`ClientEventBus`] serves
//! the same target through the control channels:
//!
//! 1. a connect request goes out on `devtools-connect`
//! 2. a listening bus answers synchronously on `devtools-connect-success`
//! 3. from then on envelopes travel on `devtools-dispatch-event`
//!
//! Until a bus answers, emissions queue. Attempts repeat every
//! `reconnect_every_ms` up to [`MAX_CONNECT_ATTEMPTS`]; after that the
//! client waits for the next `emit` or `on` before trying once more.
//!
//! [`ClientEventBus`]: crate::ClientEventBus

use std::collections::VecDeque;
use std::sync::Arc;

use devbus_core::constants::{
    CONNECT_CHANNEL, CONNECT_SUCCESS_CHANNEL, DISPATCH_CHANNEL, MAX_CONNECT_ATTEMPTS,
};
use devbus_core::{DebugLog, Envelope, EventKey, LocalDispatcher, Subscription, global_target};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PluginClientConfig;
use crate::state::{ConnectionState, RetryBudget};

const LOG_PREFIX: &str = "[devbus:plugin]";

/// Options for [`PluginEventClient::on_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OnOptions {
    /// Also receive this client's own emissions synchronously, with or
    /// without a bus.
    pub with_event_target: bool,
}

/// Handle returned by the plugin subscription methods.
///
/// May cover several registrations; [`unsubscribe`](Self::unsubscribe)
/// removes all of them and is safe to call repeatedly.
#[derive(Debug, Default)]
pub struct ScopedSubscription {
    parts: Vec<Subscription>,
}

impl ScopedSubscription {
    /// Remove every registration.
    pub fn unsubscribe(&self) {
        for part in &self.parts {
            part.unsubscribe();
        }
    }

    /// Whether any registration is still live.
    pub fn is_active(&self) -> bool {
        self.parts.iter().any(Subscription::is_active)
    }
}

/// Per-plugin event client.
pub struct PluginEventClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: PluginClientConfig,
    target: Arc<LocalDispatcher>,
    private: Arc<LocalDispatcher>,
    log: DebugLog,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    queue: VecDeque<Envelope>,
    budget: RetryBudget,
    generation: u64,
    ack: Option<Subscription>,
    retry: Option<JoinHandle<()>>,
}

impl PluginEventClient {
    /// A client on the global target.
    pub fn new(config: PluginClientConfig) -> Self {
        Self::with_target(config, global_target())
    }

    /// A client on `target`.
    pub fn with_target(config: PluginClientConfig, target: Arc<LocalDispatcher>) -> Self {
        let log = DebugLog::new(config.debug, LOG_PREFIX);
        log.log(format_args!("{} created", config.plugin_id));
        Self {
            inner: Arc::new(Inner {
                config,
                target,
                private: LocalDispatcher::new(),
                log,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    queue: VecDeque::new(),
                    budget: RetryBudget::new(MAX_CONNECT_ATTEMPTS),
                    generation: 0,
                    ack: None,
                    retry: None,
                }),
            }),
        }
    }

    /// The namespace prefix.
    pub fn plugin_id(&self) -> &str {
        &self.inner.config.plugin_id
    }

    /// Configuration.
    pub fn config(&self) -> &PluginClientConfig {
        &self.inner.config
    }

    /// Structured key for `name` in this plugin's namespace.
    pub fn key(&self, name: &str) -> EventKey {
        EventKey::new(self.plugin_id(), name)
    }

    /// Subscribe to `name` in this plugin's namespace.
    pub fn on<F>(&self, name: &str, handler: F) -> ScopedSubscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.on_with(name, handler, OnOptions::default())
    }

    /// Subscribe to `name` with options.
    ///
    /// Handlers receive the envelope as sent: `event_type` is the wire name
    /// and [`Envelope::event_name`] gives `name` back.
    pub fn on_with<F>(&self, name: &str, handler: F, options: OnOptions) -> ScopedSubscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        if !self.inner.config.enabled {
            return ScopedSubscription::default();
        }
        let wire = self.key(name).to_wire();
        let handler = Arc::new(handler);

        let mut parts = Vec::with_capacity(2);
        let shared = Arc::clone(&handler);
        parts.push(self.inner.target.subscribe(wire.clone(), move |e| shared(e)));
        if options.with_event_target {
            parts.push(self.inner.private.subscribe(wire, move |e| handler(e)));
        }

        self.inner.trigger_connect(true);
        ScopedSubscription { parts }
    }

    /// Emit `name` with `payload`. Queues while no bus has answered.
    pub fn emit(&self, name: &str, payload: Value) {
        if !self.inner.config.enabled {
            return;
        }
        let envelope = Envelope::scoped(&self.key(name), payload);
        self.inner.private.publish(&envelope);
        self.inner.send_or_queue(envelope);
    }

    /// Every event on the target, from any plugin.
    pub fn on_all<F>(&self, handler: F) -> ScopedSubscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        if !self.inner.config.enabled {
            return ScopedSubscription::default();
        }
        ScopedSubscription {
            parts: vec![self.inner.target.subscribe_all(handler)],
        }
    }

    /// Every event in this plugin's namespace.
    pub fn on_all_plugin_events<F>(&self, handler: F) -> ScopedSubscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        if !self.inner.config.enabled {
            return ScopedSubscription::default();
        }
        let plugin_id = self.inner.config.plugin_id.clone();
        let part = self.inner.target.subscribe_all(move |envelope| {
            if envelope.belongs_to(&plugin_id) {
                handler(envelope);
            }
        });
        ScopedSubscription { parts: vec![part] }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Connect attempts spent from the current budget.
    pub fn attempts(&self) -> u32 {
        self.inner.shared.lock().budget.used()
    }

    /// Envelopes waiting for a bus.
    pub fn queued_len(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Cancel pending retries and forget the bus. Queued envelopes stay.
    pub fn disconnect(&self) {
        let (ack, retry) = {
            let mut shared = self.inner.shared.lock();
            shared.generation += 1;
            shared.state = ConnectionState::Disconnected;
            shared.budget.reset();
            (shared.ack.take(), shared.retry.take())
        };
        if let Some(ack) = ack {
            ack.unsubscribe();
        }
        if let Some(retry) = retry {
            retry.abort();
        }
    }
}

impl Drop for PluginEventClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn send_or_queue(self: &Arc<Self>, envelope: Envelope) {
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connected {
                shared.queue.push_back(envelope);
                drop(shared);
                self.trigger_connect(true);
                return;
            }
        }
        self.flush(VecDeque::from([envelope]));
    }

    /// Hand envelopes to the bus in order. If nobody is listening any more,
    /// put the rest back at the head of the queue and reconnect.
    fn flush(self: &Arc<Self>, mut pending: VecDeque<Envelope>) {
        while let Some(envelope) = pending.pop_front() {
            if self.target.notify(DISPATCH_CHANNEL, &envelope) > 0 {
                continue;
            }
            pending.push_front(envelope);
            {
                let mut shared = self.shared.lock();
                pending.append(&mut shared.queue);
                shared.queue = std::mem::take(&mut pending);
                shared.state = ConnectionState::Disconnected;
            }
            debug!(plugin_id = %self.config.plugin_id, "bus went away, requeued");
            self.trigger_connect(true);
            return;
        }
    }

    fn trigger_connect(self: &Arc<Self>, explicit: bool) {
        let generation = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Disconnected {
                return;
            }
            if shared.budget.is_exhausted() {
                if !explicit {
                    return;
                }
                shared.budget.grant_one();
            }
            shared.state = ConnectionState::Connecting;
            shared.generation
        };
        self.listen_for_ack();
        self.attempt(generation);
    }

    fn listen_for_ack(self: &Arc<Self>) {
        let mut shared = self.shared.lock();
        if shared.ack.is_some() {
            return;
        }
        let client = Arc::downgrade(self);
        shared.ack = Some(self.target.subscribe(CONNECT_SUCCESS_CHANNEL, move |_| {
            if let Some(client) = client.upgrade() {
                client.on_connect_success();
            }
        }));
    }

    /// One connect request. A bus answers synchronously, so the outcome is
    /// known when `notify` returns.
    fn attempt(self: &Arc<Self>, generation: u64) {
        let attempt = {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.state != ConnectionState::Connecting {
                return;
            }
            let Some(attempt) = shared.budget.try_take() else {
                shared.state = ConnectionState::Disconnected;
                return;
            };
            attempt
        };
        let plugin_id = &self.config.plugin_id;
        self.log.log(format_args!(
            "{plugin_id} connect attempt {attempt}/{MAX_CONNECT_ATTEMPTS}"
        ));
        let request = Envelope::new(CONNECT_CHANNEL, json!({ "pluginId": plugin_id }));
        let _ = self.target.notify(CONNECT_CHANNEL, &request);

        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connecting {
            return;
        }
        if shared.budget.is_exhausted() {
            shared.state = ConnectionState::Disconnected;
            debug!(%plugin_id, attempts = attempt, "no bus answered, giving up");
            self.log.log(format_args!("{plugin_id} giving up after {attempt} attempts"));
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            shared.state = ConnectionState::Disconnected;
            return;
        };
        let client = Arc::clone(self);
        let delay = self.config.reconnect_interval();
        shared.retry = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            client.attempt(generation);
        }));
    }

    fn on_connect_success(self: &Arc<Self>) {
        let queued = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Connected {
                return;
            }
            shared.state = ConnectionState::Connected;
            shared.budget.reset();
            if let Some(retry) = shared.retry.take() {
                retry.abort();
            }
            std::mem::take(&mut shared.queue)
        };
        info!(plugin_id = %self.config.plugin_id, flushed = queued.len(), "plugin client connected");
        self.log.log(format_args!("{} connected", self.config.plugin_id));
        self.flush(queued);
    }
}
