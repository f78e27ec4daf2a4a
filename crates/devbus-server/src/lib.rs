//! # devbus-server
//!
//! The server side of the devtools event bus.
//!
//! A [`ServerEventBus`] terminates three surfaces on one HTTP server
//! (socket upgrade, event stream, one-shot POST) and fans every accepted
//! envelope out to all live consumers except its origin.
//!
//! - **Standalone**: the bus leases a [`HostServer`] from a
//!   [`ListenerRegistry`], which binds once per `(host, port)`, falls back
//!   to an OS-assigned port on `EADDRINUSE`, and survives hot reloads.
//! - **Attached**: the bus mounts onto a host-owned [`HostServer`] and only
//!   ever unmounts itself.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod errors;
pub mod host;
pub mod registry;
pub mod routes;
pub mod server;

pub use broadcast::ConnectionSet;
pub use config::ServerBusConfig;
pub use errors::{Result, ServerBusError};
pub use host::{HostServer, MountId};
pub use registry::{Lease, ListenerRegistry};
pub use server::ServerEventBus;
