//! # devbus-client
//!
//! Client side of the devtools event bus.
//!
//! - **`ClientEventBus`**: publishes locally and, when bridging, reaches a
//!   server bus over a WebSocket, falling back to an event stream plus POST
//! - **`PluginEventClient`**: namespaced `on`/`emit` for one plugin, with its
//!   own connect handshake and five-attempt retry
//! - **Transport strategies**: pluggable, tried in order, last winner first

#![deny(unsafe_code)]

pub mod bus;
pub mod config;
pub mod errors;
pub mod plugin;
pub mod sse;
pub mod state;
pub mod transport;

pub use bus::ClientEventBus;
pub use config::{ClientBusConfig, PluginClientConfig};
pub use errors::{Result, TransportError};
pub use plugin::{OnOptions, PluginEventClient, ScopedSubscription};
pub use state::{ConnectionState, RetryBudget};
pub use transport::{
    ActiveTransport, InboundHandler, SseStrategy, TransportKind, TransportStrategy,
    UnsentFrames, WebSocketStrategy, default_strategies,
};
