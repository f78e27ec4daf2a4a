//! Transport error types.
//!
//! None of these reach callers of `emit` or `on`. The connect loop logs
//! them and moves on to the next strategy or the next attempt.

use devbus_core::CodecError;
use thiserror::Error;

/// Why a transport could not be opened or used.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket handshake failed.
    #[error("websocket connect to {url} failed: {source}")]
    WebSocket {
        /// Endpoint tried.
        url: String,
        /// Handshake error.
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    /// The event-stream request could not be sent.
    #[error("request to {url} failed: {source}")]
    Http {
        /// Endpoint tried.
        url: String,
        /// Client error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{url} answered {status}")]
    Status {
        /// Endpoint tried.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The handshake did not finish in time.
    #[error("connect to {url} timed out")]
    Timeout {
        /// Endpoint tried.
        url: String,
    },
    /// No strategy is configured.
    #[error("no transport strategies configured")]
    NoStrategies,
    /// The transport has shut down.
    #[error("transport closed")]
    Closed,
    /// An envelope could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
