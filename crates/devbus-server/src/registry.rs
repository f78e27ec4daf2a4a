//! The listener registry (hot-reload guard).
//!
//! Standalone buses do not bind directly. They lease a [`HostServer`] keyed
//! by the requested `(host, port)`: the first lease binds, later leases for
//! the same key reuse the live server, and the server is closed when the
//! last lease is released. A reloaded module that starts a fresh bus on the
//! same port therefore attaches to the existing listener instead of opening
//! a second socket.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, ServerBusError};
use crate::host::HostServer;

type Key = (String, u16);

struct Entry {
    server: Arc<HostServer>,
    refs: usize,
}

static GLOBAL: LazyLock<Arc<ListenerRegistry>> = LazyLock::new(ListenerRegistry::new);

/// Refcounted `(host, port) → HostServer` store.
pub struct ListenerRegistry {
    entries: Mutex<HashMap<Key, Entry>>,
    bind_lock: tokio::sync::Mutex<()>,
}

impl ListenerRegistry {
    /// Create an isolated registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            bind_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Get or create the server for `(host, port)` and take a reference.
    ///
    /// A fresh bind that hits `EADDRINUSE` falls back to an OS-assigned port.
    pub async fn acquire(self: &Arc<Self>, host: &str, port: u16) -> Result<Lease> {
        let key = (host.to_owned(), port);
        // Serializes binds so two concurrent starts cannot both miss the entry.
        let _bind = self.bind_lock.lock().await;

        if let Some(server) = self.reuse(&key) {
            debug!(host, port, "reusing live listener");
            return Ok(self.lease(key, server));
        }

        let server = bind_with_fallback(host, port).await?;
        let _ = self.entries.lock().insert(
            key.clone(),
            Entry {
                server: Arc::clone(&server),
                refs: 1,
            },
        );
        Ok(self.lease(key, server))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding references for `(host, port)`.
    pub fn refs(&self, host: &str, port: u16) -> usize {
        self.entries
            .lock()
            .get(&(host.to_owned(), port))
            .map_or(0, |e| e.refs)
    }

    fn reuse(&self, key: &Key) -> Option<Arc<HostServer>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.server.is_closed() => {
                entry.refs += 1;
                Some(Arc::clone(&entry.server))
            }
            Some(_) => {
                let _ = entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn lease(self: &Arc<Self>, key: Key, server: Arc<HostServer>) -> Lease {
        Lease {
            registry: Arc::clone(self),
            key,
            server,
        }
    }

    fn release(&self, key: &Key, server: &Arc<HostServer>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        // A lease on a replaced server must not touch its successor.
        if !Arc::ptr_eq(&entry.server, server) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let _ = entries.remove(key);
        server.close();
        debug!(host = %key.0, port = key.1, "last lease released, listener closed");
    }
}

/// A reference to a registry-owned [`HostServer`].
///
/// Dropping the lease without calling [`release`](Self::release) keeps the
/// server alive.
pub struct Lease {
    registry: Arc<ListenerRegistry>,
    key: Key,
    server: Arc<HostServer>,
}

impl Lease {
    /// The leased server.
    pub fn server(&self) -> &Arc<HostServer> {
        &self.server
    }

    /// Give the reference back, closing the server if it was the last one.
    pub fn release(self) {
        self.registry.release(&self.key, &self.server);
    }
}

async fn bind_with_fallback(host: &str, port: u16) -> Result<Arc<HostServer>> {
    match HostServer::bind(host, port).await {
        Ok(server) => Ok(server),
        Err(e) if e.kind() == ErrorKind::AddrInUse && port != 0 => {
            warn!(host, port, "port in use, falling back to an OS-assigned port");
            let server = HostServer::bind(host, 0)
                .await
                .map_err(|source| ServerBusError::Bind {
                    host: host.to_owned(),
                    port: 0,
                    source,
                })?;
            info!(host, requested = port, addr = ?server.local_addr(), "bound fallback port");
            Ok(server)
        }
        Err(source) => Err(ServerBusError::Bind {
            host: host.to_owned(),
            port,
            source,
        }),
    }
}
