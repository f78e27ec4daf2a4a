//! Settings schema.
//!
//! Every section uses `#[serde(default)]` so a partial user file only
//! overrides the keys it names. Keys are camelCase on disk.

use devbus_core::constants::{DEFAULT_HOST, DEFAULT_PORT, MAX_CONNECT_ATTEMPTS};
use devbus_core::{Mode, Protocol};
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevbusSettings {
    /// Server bus.
    pub server: ServerSettings,
    /// Client bus bridge.
    pub client: ClientSettings,
    /// Plugin clients.
    pub plugin: PluginSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Server bus settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind host.
    pub host: String,
    /// Preferred port. `0` asks the OS for one.
    pub port: u16,
    /// Emit `[devbus:server-bus]` diagnostic lines.
    pub debug: bool,
    /// Forced runtime mode. Unset means build-profile detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
}

impl ServerSettings {
    /// The configured mode, or the build-profile default.
    pub fn resolved_mode(&self) -> Mode {
        self.mode.unwrap_or_else(Mode::detect)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            debug: false,
            mode: None,
        }
    }
}

/// Client bus settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Bridge the local dispatcher to a server bus.
    pub connect_to_server_bus: bool,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Scheme family.
    pub protocol: Protocol,
    /// Delay between automatic connect attempts.
    pub reconnect_every_ms: u64,
    /// Automatic attempts before the bus settles into `Disconnected`.
    pub max_connect_attempts: u32,
    /// Emit `[devbus:client-bus]` diagnostic lines.
    pub debug: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_to_server_bus: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            protocol: Protocol::Http,
            reconnect_every_ms: 1000,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
            debug: false,
        }
    }
}

/// Defaults applied to plugin clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Delay between connect attempts.
    pub reconnect_every_ms: u64,
    /// Emit `[devbus:plugin]` diagnostic lines.
    pub debug: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            reconnect_every_ms: 300,
            debug: false,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
