//! Server bus error types.

use thiserror::Error;

/// Errors surfaced by [`ServerEventBus::start`](crate::ServerEventBus::start).
#[derive(Debug, Error)]
pub enum ServerBusError {
    /// Neither the preferred port nor an OS-assigned one could be bound.
    #[error("failed to bind {host}:{port}: {source}")]
    Bind {
        /// Requested host.
        host: String,
        /// Requested port.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// The host-provided server was closed before the bus attached.
    #[error("host server is closed")]
    HostClosed,
}

/// Result type for server bus operations.
pub type Result<T> = std::result::Result<T, ServerBusError>;
