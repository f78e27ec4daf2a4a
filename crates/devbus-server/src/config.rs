//! Server bus configuration.

use devbus_core::Mode;
use devbus_core::constants::{DEFAULT_HOST, DEFAULT_PORT};
use devbus_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Configuration for a [`ServerEventBus`](crate::ServerEventBus).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerBusConfig {
    /// Host to bind in standalone mode (default `"localhost"`).
    pub host: String,
    /// Preferred port (default `4206`, `0` for auto-assign).
    pub port: u16,
    /// Emit `[devbus:server-bus]` diagnostic lines.
    pub debug: bool,
    /// `Inert` turns `start()` into a no-op.
    pub mode: Mode,
}

impl Default for ServerBusConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            debug: false,
            mode: Mode::detect(),
        }
    }
}

impl From<&ServerSettings> for ServerBusConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            debug: settings.debug,
            mode: settings.resolved_mode(),
        }
    }
}
