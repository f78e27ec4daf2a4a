//! `ClientEventBus`: a local dispatcher with an optional bridge to a server bus.
//!
//! Every emitted envelope is published locally first. When bridging is on,
//! it is then sent over the active transport, or queued while the bus is
//! not connected. Queued envelopes go out in enqueue order the moment a
//! transport connects.
//!
//! The connect loop walks the strategy list (the last working strategy
//! first), spending one unit of the retry budget per round and sleeping
//! `reconnect_every_ms` between rounds. An exhausted budget leaves the bus
//! `Disconnected` until an `emit` asks for one more attempt.

use std::collections::VecDeque;
use std::sync::Arc;

use devbus_core::constants::{CONNECT_CHANNEL, CONNECT_SUCCESS_CHANNEL, DISPATCH_CHANNEL};
use devbus_core::{DebugLog, Envelope, LocalDispatcher, Subscription, global_target};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientBusConfig;
use crate::errors::{Result, TransportError};
use crate::state::{ConnectionState, RetryBudget};
use crate::transport::{
    ActiveTransport, InboundHandler, TransportKind, TransportStrategy, default_strategies,
};

const LOG_PREFIX: &str = "[devbus:client-bus]";

/// The client side of the devtools event bus.
pub struct ClientEventBus {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientBusConfig,
    client_id: String,
    target: Arc<LocalDispatcher>,
    strategies: Vec<Arc<dyn TransportStrategy>>,
    log: DebugLog,
    shared: Mutex<Shared>,
}

struct Shared {
    started: bool,
    state: ConnectionState,
    queue: VecDeque<Envelope>,
    budget: RetryBudget,
    transport: Option<ActiveTransport>,
    pinned: Option<usize>,
    generation: u64,
    subscriptions: Vec<Subscription>,
    connect_task: Option<JoinHandle<()>>,
}

impl ClientEventBus {
    /// A bus on the global target with the default strategies.
    pub fn new(config: ClientBusConfig) -> Self {
        Self::with_target(config, global_target())
    }

    /// A bus publishing into `target`.
    pub fn with_target(config: ClientBusConfig, target: Arc<LocalDispatcher>) -> Self {
        Self::with_strategies(config, target, default_strategies())
    }

    /// A bus with an explicit, ordered strategy list.
    pub fn with_strategies(
        config: ClientBusConfig,
        target: Arc<LocalDispatcher>,
        strategies: Vec<Arc<dyn TransportStrategy>>,
    ) -> Self {
        let client_id = Uuid::now_v7().to_string();
        let log = DebugLog::new(config.debug, LOG_PREFIX);
        log.log(format_args!(
            "created (client_id={client_id}, bridge={}, {}:{})",
            config.connect_to_server_bus, config.host, config.port
        ));
        let budget = RetryBudget::new(config.max_connect_attempts);
        Self {
            inner: Arc::new(Inner {
                config,
                client_id,
                target,
                strategies,
                log,
                shared: Mutex::new(Shared {
                    started: false,
                    state: ConnectionState::Disconnected,
                    queue: VecDeque::new(),
                    budget,
                    transport: None,
                    pinned: None,
                    generation: 0,
                    subscriptions: Vec::new(),
                    connect_task: None,
                }),
            }),
        }
    }

    /// Listen on the control channels and, when bridging, start connecting.
    ///
    /// Calling `start` on a started bus does nothing. Connecting needs a
    /// tokio runtime; without one the bus stays `Disconnected`.
    pub fn start(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.started {
                return;
            }
            shared.started = true;
            shared.budget.reset();
            shared.subscriptions = self.inner.bridge_local();
        }
        info!(
            client_id = %self.inner.client_id,
            bridge = self.inner.config.connect_to_server_bus,
            "client bus started"
        );
        self.inner.log.log("started");
        if self.inner.config.connect_to_server_bus {
            self.inner.trigger_connect(false);
        }
    }

    /// Drop the control-channel listeners, close the transport, and cancel
    /// the connect loop. Queued envelopes are kept for the next `start`.
    pub fn stop(&self) {
        let (subscriptions, transport, task) = {
            let mut shared = self.inner.shared.lock();
            if !shared.started {
                return;
            }
            shared.started = false;
            shared.generation += 1;
            shared.state = ConnectionState::Disconnected;
            (
                std::mem::take(&mut shared.subscriptions),
                shared.transport.take(),
                shared.connect_task.take(),
            )
        };
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(task) = task {
            task.abort();
        }
        info!(client_id = %self.inner.client_id, "client bus stopped");
        self.inner.log.log("stopped");
    }

    /// Publish locally, then send or queue for the server bus.
    pub fn emit(&self, envelope: Envelope) {
        self.inner.emit(envelope);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Envelopes waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Wire of the live transport, if connected.
    pub fn active_transport(&self) -> Option<TransportKind> {
        self.inner
            .shared
            .lock()
            .transport
            .as_ref()
            .map(ActiveTransport::kind)
    }

    /// Connect attempts spent from the current budget.
    pub fn attempts(&self) -> u32 {
        self.inner.shared.lock().budget.used()
    }

    /// Identifier sent to the server as `?clientId=`.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The dispatcher this bus publishes into.
    pub fn target(&self) -> &Arc<LocalDispatcher> {
        &self.inner.target
    }

    /// Configuration.
    pub fn config(&self) -> &ClientBusConfig {
        &self.inner.config
    }
}

impl Drop for ClientEventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    /// Serve dispatch requests and answer connect requests on the target.
    fn bridge_local(self: &Arc<Self>) -> Vec<Subscription> {
        let bus = Arc::downgrade(self);
        let dispatch = self.target.subscribe(DISPATCH_CHANNEL, move |envelope| {
            if let Some(bus) = bus.upgrade() {
                bus.emit(envelope.clone());
            }
        });

        let target = Arc::downgrade(&self.target);
        let connect = self.target.subscribe(CONNECT_CHANNEL, move |_| {
            if let Some(target) = target.upgrade() {
                let ack = Envelope::new(CONNECT_SUCCESS_CHANNEL, Value::Null);
                let _ = target.notify(CONNECT_SUCCESS_CHANNEL, &ack);
            }
        });
        vec![dispatch, connect]
    }

    fn emit(self: &Arc<Self>, envelope: Envelope) {
        self.target.publish(&envelope);
        if !self.config.connect_to_server_bus {
            return;
        }

        let pending = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Connected {
                if let Some(transport) = &shared.transport {
                    match transport.send(&envelope) {
                        Ok(()) => return,
                        Err(e) => debug!(error = %e, "send failed, queueing"),
                    }
                }
            }
            shared.queue.push_back(envelope);
            shared.queue.len()
        };
        self.log.log(format_args!("queued event ({pending} pending)"));
        self.trigger_connect(true);
    }

    /// Begin a connect loop unless one is running or the bus is connected.
    ///
    /// `explicit` requests may spend one attempt past an exhausted budget.
    fn trigger_connect(self: &Arc<Self>, explicit: bool) {
        let mut shared = self.shared.lock();
        self.spawn_connect(&mut shared, explicit);
    }

    fn spawn_connect(self: &Arc<Self>, shared: &mut Shared, explicit: bool) {
        if !shared.started
            || !self.config.connect_to_server_bus
            || shared.state != ConnectionState::Disconnected
        {
            return;
        }
        if shared.budget.is_exhausted() {
            if !explicit {
                return;
            }
            shared.budget.grant_one();
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, client bus cannot connect");
            return;
        };
        shared.state = ConnectionState::Connecting;
        let generation = shared.generation;
        shared.connect_task = Some(runtime.spawn(Arc::clone(self).connect_loop(generation)));
    }

    async fn connect_loop(self: Arc<Self>, generation: u64) {
        loop {
            let attempt = {
                let mut shared = self.shared.lock();
                if shared.generation != generation {
                    return;
                }
                let Some(attempt) = shared.budget.try_take() else {
                    shared.state = ConnectionState::Disconnected;
                    return;
                };
                attempt
            };
            self.log.log(format_args!(
                "connect attempt {attempt}/{}",
                self.config.max_connect_attempts
            ));

            match self.negotiate().await {
                Ok((index, transport)) => {
                    self.on_connected(generation, index, transport);
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "connect attempt failed");
                    self.log.log(format_args!("attempt {attempt} failed: {e}"));
                }
            }

            {
                let mut shared = self.shared.lock();
                if shared.generation != generation {
                    return;
                }
                if shared.budget.is_exhausted() {
                    shared.state = ConnectionState::Disconnected;
                    info!(
                        attempts = shared.budget.used(),
                        queued = shared.queue.len(),
                        "server bus unreachable, giving up until the next emit"
                    );
                    return;
                }
            }
            tokio::time::sleep(self.config.reconnect_interval()).await;
        }
    }

    /// Try the pinned strategy, then every other one in order.
    async fn negotiate(&self) -> Result<(usize, ActiveTransport)> {
        let pinned = self.shared.lock().pinned;
        let order: Vec<usize> = pinned
            .into_iter()
            .chain((0..self.strategies.len()).filter(|i| Some(*i) != pinned))
            .collect();

        let mut last = TransportError::NoStrategies;
        for index in order {
            let strategy = &self.strategies[index];
            match strategy
                .connect(&self.config, &self.client_id, self.inbound())
                .await
            {
                Ok(transport) => return Ok((index, transport)),
                Err(e) => {
                    debug!(transport = %strategy.kind(), error = %e, "transport unavailable");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn inbound(&self) -> InboundHandler {
        let target = Arc::clone(&self.target);
        Arc::new(move |envelope: Envelope| target.publish(&envelope))
    }

    fn on_connected(self: &Arc<Self>, generation: u64, index: usize, transport: ActiveTransport) {
        let kind = transport.kind();
        let closed = transport.closed();
        let flushed = {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                transport.close();
                return;
            }
            let mut flushed = 0usize;
            while let Some(envelope) = shared.queue.pop_front() {
                if let Err(e) = transport.send(&envelope) {
                    debug!(error = %e, "flush interrupted");
                    shared.queue.push_front(envelope);
                    break;
                }
                flushed += 1;
            }
            shared.pinned = Some(index);
            shared.budget.reset();
            shared.state = ConnectionState::Connected;
            shared.transport = Some(transport);
            flushed
        };
        info!(transport = %kind, flushed, "client bus connected");
        self.log
            .log(format_args!("connected via {kind}, flushed {flushed} queued event(s)"));

        let bus = Arc::clone(self);
        let _watch = tokio::spawn(async move {
            closed.await;
            bus.on_transport_closed(generation);
        });
    }

    fn on_transport_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.state != ConnectionState::Connected {
                return;
            }
            if let Some(transport) = shared.transport.take() {
                let unsent = transport.take_unsent();
                if !unsent.is_empty() {
                    debug!(count = unsent.len(), "requeueing undelivered events");
                }
                for envelope in unsent.into_iter().rev() {
                    shared.queue.push_front(envelope);
                }
            }
            shared.state = ConnectionState::Disconnected;
            shared.budget.reset();
            self.spawn_connect(&mut shared, false);
        }
        warn!("server bus connection lost, reconnecting");
        self.log.log("connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use devbus_core::constants::ALL_EVENTS_CHANNEL;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::transport::UnsentFrames;

    struct Refusing {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportStrategy for Refusing {
        fn kind(&self) -> TransportKind {
            TransportKind::WebSocket
        }

        async fn connect(
            &self,
            _config: &ClientBusConfig,
            _client_id: &str,
            _inbound: InboundHandler,
        ) -> Result<ActiveTransport> {
            let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Closed)
        }
    }

    type Link = (CancellationToken, InboundHandler, UnsentFrames);

    /// Connects instantly; outbound frames land in `frames`.
    struct Loopback {
        connects: Arc<AtomicUsize>,
        frames: mpsc::UnboundedSender<String>,
        links: Arc<Mutex<Vec<Link>>>,
    }

    #[async_trait]
    impl TransportStrategy for Loopback {
        fn kind(&self) -> TransportKind {
            TransportKind::EventStream
        }

        async fn connect(
            &self,
            _config: &ClientBusConfig,
            _client_id: &str,
            inbound: InboundHandler,
        ) -> Result<ActiveTransport> {
            let _ = self.connects.fetch_add(1, Ordering::SeqCst);
            let closed = CancellationToken::new();
            let transport =
                ActiveTransport::new(TransportKind::EventStream, self.frames.clone(), closed.clone());
            self.links
                .lock()
                .push((closed, inbound, transport.unsent_sink()));
            Ok(transport)
        }
    }

    struct Harness {
        connects: Arc<AtomicUsize>,
        frames: mpsc::UnboundedReceiver<String>,
        links: Arc<Mutex<Vec<Link>>>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<String> {
            let mut types = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                types.push(Envelope::decode(&frame).unwrap().event_type);
            }
            types
        }
    }

    fn loopback() -> (Arc<dyn TransportStrategy>, Harness) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        let links = Arc::new(Mutex::new(Vec::new()));
        let strategy = Loopback {
            connects: Arc::clone(&connects),
            frames: tx,
            links: Arc::clone(&links),
        };
        (
            Arc::new(strategy),
            Harness {
                connects,
                frames: rx,
                links,
            },
        )
    }

    fn refusing() -> (Arc<dyn TransportStrategy>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let strategy = Refusing {
            attempts: Arc::clone(&attempts),
        };
        (Arc::new(strategy), attempts)
    }

    fn bridged() -> ClientBusConfig {
        ClientBusConfig::bridged("127.0.0.1", 1)
    }

    fn bus(config: ClientBusConfig, strategies: Vec<Arc<dyn TransportStrategy>>) -> ClientEventBus {
        ClientEventBus::with_strategies(config, LocalDispatcher::new(), strategies)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn evt(name: &str) -> Envelope {
        Envelope::new(name, json!({}))
    }

    #[tokio::test(start_paused = true)]
    async fn emits_while_connecting_share_one_attempt() {
        let (strategy, attempts) = refusing();
        let bus = bus(bridged(), vec![strategy]);
        bus.start();
        for i in 0..5 {
            bus.emit(evt(&format!("e{i}")));
        }
        settle().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(bus.state(), ConnectionState::Connecting);
        assert_eq!(bus.queued_len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_automatic_attempts() {
        let (strategy, attempts) = refusing();
        let bus = bus(bridged(), vec![strategy]);
        bus.start();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(bus.attempts(), 5);
        assert_eq!(bus.state(), ConnectionState::Disconnected);

        bus.emit(evt("late"));
        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(bus.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(bus.queued_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_flushes_in_order_on_connect() {
        let (strategy, mut harness) = loopback();
        let bus = bus(bridged(), vec![strategy]);
        for name in ["a", "b", "c"] {
            bus.emit(evt(name));
        }
        assert_eq!(bus.queued_len(), 3);

        bus.start();
        settle().await;
        assert_eq!(bus.state(), ConnectionState::Connected);
        assert_eq!(bus.active_transport(), Some(TransportKind::EventStream));
        assert_eq!(harness.drain(), vec!["a", "b", "c"]);
        assert_eq!(bus.queued_len(), 0);

        bus.emit(evt("d"));
        assert_eq!(harness.drain(), vec!["d"]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_and_pins_the_working_strategy() {
        let (ws, ws_attempts) = refusing();
        let (sse, harness) = loopback();
        let bus = bus(bridged(), vec![ws, sse]);
        bus.start();
        settle().await;
        assert_eq!(bus.state(), ConnectionState::Connected);
        assert_eq!(ws_attempts.load(Ordering::SeqCst), 1);

        // Server drops the stream: reconnect tries the pinned strategy first.
        let (token, _, _) = harness.links.lock()[0].clone();
        token.cancel();
        settle().await;
        assert_eq!(bus.state(), ConnectionState::Connected);
        assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
        assert_eq!(ws_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_frames_are_requeued_ahead_of_later_emits() {
        let (strategy, mut harness) = loopback();
        let bus = bus(bridged(), vec![strategy]);
        bus.start();
        settle().await;
        bus.emit(evt("sent"));
        assert_eq!(harness.drain(), vec!["sent"]);

        // The I/O side failed to deliver two frames and closed.
        let (token, _, unsent) = harness.links.lock()[0].clone();
        unsent.lock().extend(
            ["lost-1", "lost-2"].map(|name| evt(name).encode().unwrap()),
        );
        token.cancel();
        settle().await;

        assert_eq!(bus.state(), ConnectionState::Connected);
        assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
        assert_eq!(harness.drain(), vec!["lost-1", "lost-2"]);
        assert_eq!(bus.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_envelopes_are_published_locally() {
        let (strategy, harness) = loopback();
        let bus = bus(bridged(), vec![strategy]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = bus.target().subscribe("remote:evt", move |e| {
            s.lock().push(e.payload.clone());
        });
        bus.start();
        settle().await;

        let (_, inbound, _) = harness.links.lock()[0].clone();
        inbound(Envelope::new("remote:evt", json!(42)));
        assert_eq!(*seen.lock(), vec![json!(42)]);
    }

    #[tokio::test]
    async fn dispatch_requests_publish_and_connect_requests_are_answered() {
        let (strategy, attempts) = refusing();
        let bus = bus(ClientBusConfig::default(), vec![strategy]);
        let target = Arc::clone(bus.target());
        bus.start();

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let _all = target.subscribe(ALL_EVENTS_CHANNEL, move |_| {
            let _ = s.fetch_add(1, Ordering::SeqCst);
        });
        let acks = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&acks);
        let _ack = target.subscribe(CONNECT_SUCCESS_CHANNEL, move |_| {
            let _ = a.fetch_add(1, Ordering::SeqCst);
        });

        let _ = target.notify(DISPATCH_CHANNEL, &evt("p:x"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.queued_len(), 0);

        let _ = target.notify(CONNECT_CHANNEL, &evt(CONNECT_CHANNEL));
        assert_eq!(acks.load(Ordering::SeqCst), 1);

        bus.stop();
        let _ = target.notify(CONNECT_CHANNEL, &evt(CONNECT_CHANNEL));
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bridging_disabled_never_connects_or_queues() {
        let (strategy, attempts) = refusing();
        let bus = bus(ClientBusConfig::default(), vec![strategy]);
        bus.start();
        bus.emit(evt("local-only"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(bus.queued_len(), 0);
        assert_eq!(bus.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_queue_and_restart_resets_budget() {
        let (strategy, attempts) = refusing();
        let bus = bus(bridged(), vec![strategy]);
        bus.start();
        bus.emit(evt("kept"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bus.attempts(), 5);

        bus.stop();
        bus.stop();
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        assert_eq!(bus.queued_len(), 1);

        bus.start();
        settle().await;
        assert_eq!(bus.attempts(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_the_transport() {
        let (strategy, harness) = loopback();
        let bus = bus(bridged(), vec![strategy]);
        bus.start();
        settle().await;
        let (token, _, _) = harness.links.lock()[0].clone();

        bus.stop();
        assert!(token.is_cancelled());
        assert_eq!(bus.active_transport(), None);
        settle().await;
        assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_without_runtime_stays_disconnected() {
        let (strategy, attempts) = refusing();
        let bus = bus(bridged(), vec![strategy]);
        bus.start();
        bus.emit(evt("x"));
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        assert_eq!(bus.queued_len(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn client_ids_are_unique() {
        let a = ClientEventBus::with_target(ClientBusConfig::default(), LocalDispatcher::new());
        let b = ClientEventBus::with_target(ClientBusConfig::default(), LocalDispatcher::new());
        assert_ne!(a.client_id(), b.client_id());
    }
}
