//! An HTTP server that buses attach to.
//!
//! A [`HostServer`] owns a bound listener and an axum router. Its own
//! routes (if any) are matched first; every other request is offered to
//! the mounted bus listeners, newest first, by exact path. Mounting and
//! unmounting never touches the listening socket, which is what lets a
//! bus detach from a server it does not own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Identifies one mounted listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MountId(u64);

struct Mount {
    id: MountId,
    paths: Vec<String>,
    router: Router,
}

/// A running HTTP server with dynamically mounted bus listeners.
pub struct HostServer {
    addr: SocketAddr,
    mounts: RwLock<Vec<Mount>>,
    next_mount: AtomicU64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl HostServer {
    /// Bind `host:port` and serve with no routes of its own.
    pub async fn bind(host: &str, port: u16) -> std::io::Result<Arc<Self>> {
        Self::bind_with(host, port, Router::new()).await
    }

    /// Bind `host:port` and serve `base` alongside mounted listeners.
    pub async fn bind_with(host: &str, port: u16, base: Router) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind((host, port)).await?;
        Self::serve(listener, base)
    }

    /// Serve an already bound listener.
    pub fn serve(listener: TcpListener, base: Router) -> std::io::Result<Arc<Self>> {
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let server = Arc::new_cyclic(|weak: &Weak<Self>| {
            let host = weak.clone();
            let app = base.fallback(move |req: Request| {
                let host = host.clone();
                async move { forward(&host, req).await }
            });
            let signal = shutdown.clone().cancelled_owned();
            let _task = tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(signal)
                    .await
                {
                    warn!(error = %e, "host server terminated with error");
                }
            });
            Self {
                addr,
                mounts: RwLock::new(Vec::new()),
                next_mount: AtomicU64::new(1),
                shutdown,
                closed: AtomicBool::new(false),
            }
        });

        info!(%addr, "host server listening");
        Ok(server)
    }

    /// Attach `router` for the given exact `paths`.
    pub fn mount(&self, paths: &[&str], router: Router) -> MountId {
        let id = MountId(self.next_mount.fetch_add(1, Ordering::Relaxed));
        self.mounts.write().push(Mount {
            id,
            paths: paths.iter().map(|p| (*p).to_owned()).collect(),
            router,
        });
        debug!(mount = id.0, ?paths, "listener mounted");
        id
    }

    /// Detach a listener. Returns `false` if it was not mounted.
    pub fn unmount(&self, id: MountId) -> bool {
        let mut mounts = self.mounts.write();
        let before = mounts.len();
        mounts.retain(|m| m.id != id);
        let removed = mounts.len() < before;
        if removed {
            debug!(mount = id.0, "listener unmounted");
        }
        removed
    }

    /// Number of mounted listeners.
    pub fn listener_count(&self) -> usize {
        self.mounts.read().len()
    }

    /// Bound address, or `None` once closed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        (!self.is_closed()).then_some(self.addr)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting connections and drop every mount.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.mounts.write().clear();
        info!(addr = %self.addr, "host server closed");
    }

    fn route_for(&self, path: &str) -> Option<Router> {
        self.mounts
            .read()
            .iter()
            .rev()
            .find(|m| m.paths.iter().any(|p| p == path))
            .map(|m| m.router.clone())
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn forward(host: &Weak<HostServer>, req: Request) -> Response {
    let Some(host) = host.upgrade() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let Some(router) = host.route_for(req.uri().path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    drop(host);
    match router.oneshot(req).await {
        Ok(resp) => resp,
        Err(never) => match never {},
    }
}
