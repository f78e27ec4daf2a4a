//! `ServerEventBus`: terminates both transports and fans events out.

use std::sync::Arc;
use std::time::Instant;

use devbus_core::constants::{CONNECT_CHANNEL, CONNECT_SUCCESS_CHANNEL, DISPATCH_CHANNEL};
use devbus_core::{DebugLog, Envelope, LocalDispatcher, Mode, Subscription, global_target};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::broadcast::ConnectionSet;
use crate::config::ServerBusConfig;
use crate::errors::{Result, ServerBusError};
use crate::host::{HostServer, MountId};
use crate::registry::{Lease, ListenerRegistry};
use crate::routes::{self, BUS_PATHS, BusState};

const LOG_PREFIX: &str = "[devbus:server-bus]";

/// How the bus reaches its HTTP server.
enum Attachment {
    /// Lease a listener from a registry; owns its lifecycle share.
    Standalone(Arc<ListenerRegistry>),
    /// Mount onto a host-owned server; never closes it.
    Attached(Arc<HostServer>),
}

struct Running {
    server: Arc<HostServer>,
    mount: MountId,
    lease: Option<Lease>,
    port: u16,
    state: BusState,
    subscriptions: Vec<Subscription>,
}

/// The server side of the devtools event bus.
pub struct ServerEventBus {
    config: ServerBusConfig,
    attachment: Attachment,
    target: Arc<LocalDispatcher>,
    connections: Arc<ConnectionSet>,
    log: DebugLog,
    running: Mutex<Option<Running>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl ServerEventBus {
    /// A standalone bus leasing its listener from the process-wide registry.
    pub fn new(config: ServerBusConfig) -> Self {
        Self::build(config, Attachment::Standalone(ListenerRegistry::global()))
    }

    /// A standalone bus leasing from `registry`.
    pub fn with_registry(config: ServerBusConfig, registry: Arc<ListenerRegistry>) -> Self {
        Self::build(config, Attachment::Standalone(registry))
    }

    /// A bus attached to a host-owned server.
    pub fn attached(config: ServerBusConfig, host: Arc<HostServer>) -> Self {
        Self::build(config, Attachment::Attached(host))
    }

    /// Re-publish accepted envelopes into `target` instead of the global one.
    #[must_use]
    pub fn with_target(mut self, target: Arc<LocalDispatcher>) -> Self {
        self.target = target;
        self
    }

    fn build(config: ServerBusConfig, attachment: Attachment) -> Self {
        let log = DebugLog::new(config.debug, LOG_PREFIX);
        log.log(format_args!(
            "created (host={}, port={}, mode={:?})",
            config.host, config.port, config.mode
        ));
        Self {
            config,
            attachment,
            target: global_target(),
            connections: Arc::new(ConnectionSet::new()),
            log,
            running: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Bind or attach, mount the bus surfaces, and return the actual port.
    ///
    /// In [`Mode::Inert`] nothing is bound and the configured port is
    /// returned. Calling `start` on a running bus returns its port.
    pub async fn start(&self) -> Result<u16> {
        if self.config.mode == Mode::Inert {
            self.log.log("inert mode, start is a no-op");
            return Ok(self.config.port);
        }

        let _starting = self.start_lock.lock().await;
        if let Some(port) = self.port() {
            return Ok(port);
        }

        let (server, lease) = match &self.attachment {
            Attachment::Standalone(registry) => {
                let lease = registry.acquire(&self.config.host, self.config.port).await?;
                (Arc::clone(lease.server()), Some(lease))
            }
            Attachment::Attached(host) => (Arc::clone(host), None),
        };
        let Some(addr) = server.local_addr() else {
            if let Some(lease) = lease {
                lease.release();
            }
            return Err(ServerBusError::HostClosed);
        };

        let state = BusState {
            connections: Arc::clone(&self.connections),
            target: Arc::clone(&self.target),
            log: self.log.clone(),
            started_at: Instant::now(),
        };
        let subscriptions = self.bridge_local(&state);
        let mount = server.mount(&BUS_PATHS, routes::router(state.clone()));

        let port = addr.port();
        info!(port, attached = lease.is_none(), "server bus started");
        self.log.log(format_args!("listening on port {port}"));
        *self.running.lock() = Some(Running {
            server,
            mount,
            lease,
            port,
            state,
            subscriptions,
        });
        Ok(port)
    }

    /// Detach from the server and close every own connection.
    ///
    /// Standalone buses release their lease, closing the listener when no
    /// other bus holds it. Attached buses only unmount. The bus can be
    /// started again afterwards.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        for sub in &running.subscriptions {
            sub.unsubscribe();
        }
        let _ = running.server.unmount(running.mount);
        let closed = self.connections.close_all();
        if let Some(lease) = running.lease {
            lease.release();
        }
        info!(port = running.port, closed, "server bus stopped");
        self.log.log(format_args!("stopped, closed {closed} connection(s)"));
    }

    /// Fan `envelope` out to every consumer and publish it locally.
    pub fn emit(&self, envelope: &Envelope) -> usize {
        let state = self.running.lock().as_ref().map(|r| r.state.clone());
        state.map_or(0, |state| state.accept(envelope, None))
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|r| r.port)
    }

    /// Whether the bus is mounted on a server.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Live consumers.
    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    /// Configuration.
    pub fn config(&self) -> &ServerBusConfig {
        &self.config
    }

    /// Let same-process producers reach remote peers through the target.
    fn bridge_local(&self, state: &BusState) -> Vec<Subscription> {
        let dispatch_state = state.clone();
        let dispatch = self.target.subscribe(DISPATCH_CHANNEL, move |envelope| {
            let _ = dispatch_state.accept(envelope, None);
        });

        let target = Arc::downgrade(&self.target);
        let connect = self.target.subscribe(CONNECT_CHANNEL, move |_| {
            if let Some(target) = target.upgrade() {
                let ack = Envelope::new(CONNECT_SUCCESS_CHANNEL, Value::Null);
                let _ = target.notify(CONNECT_SUCCESS_CHANNEL, &ack);
            }
        });
        debug!("bridged local dispatch and connect channels");
        vec![dispatch, connect]
    }
}

impl Drop for ServerEventBus {
    fn drop(&mut self) {
        self.stop();
    }
}
