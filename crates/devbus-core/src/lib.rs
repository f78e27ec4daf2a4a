//! # devbus-core
//!
//! Shared vocabulary for the devtools event bus.
//!
//! - **Envelope**: the `{type, payload}` wire unit and its JSON codec
//! - **`EventKey`**: structured `<pluginId>:<name>` event names
//! - **`LocalDispatcher`**: in-process publish/subscribe every event flows through
//! - **Global target**: host-installable shared dispatcher with a process default
//! - **Mode**: `Active` / `Inert` runtime switch decided once at construction
//! - **Protocol**: `http` / `https` scheme family for the client bridge
//! - **Logging**: `tracing` subscriber setup and the fixed-prefix debug channel

#![deny(unsafe_code)]

pub mod constants;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod logging;
pub mod mode;
pub mod protocol;
pub mod target;

pub use dispatcher::{Handler, LocalDispatcher, Subscription};
pub use envelope::{Envelope, EventKey};
pub use errors::{CodecError, Result};
pub use logging::DebugLog;
pub use mode::Mode;
pub use protocol::Protocol;
pub use target::{clear_shared_target, global_target, install_shared_target};
