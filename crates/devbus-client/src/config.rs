//! Client bus and plugin client configuration.

use std::time::Duration;

use devbus_core::Protocol;
use devbus_core::constants::{
    CLIENT_ID_PARAM, DEFAULT_HOST, DEFAULT_PORT, MAX_CONNECT_ATTEMPTS, SEND_PATH, SSE_PATH, WS_PATH,
};
use devbus_settings::{ClientSettings, PluginSettings};
use serde::{Deserialize, Serialize};

/// Configuration for a [`ClientEventBus`](crate::ClientEventBus).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientBusConfig {
    /// Emit `[devbus:client-bus]` diagnostic lines.
    pub debug: bool,
    /// Bridge the local dispatcher to a server bus.
    pub connect_to_server_bus: bool,
    /// Server port.
    pub port: u16,
    /// Server host.
    pub host: String,
    /// Scheme family for every transport.
    pub protocol: Protocol,
    /// Delay between automatic connect attempts.
    pub reconnect_every_ms: u64,
    /// Automatic attempts before settling into `Disconnected`.
    pub max_connect_attempts: u32,
}

impl Default for ClientBusConfig {
    fn default() -> Self {
        Self {
            debug: false,
            connect_to_server_bus: false,
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.into(),
            protocol: Protocol::Http,
            reconnect_every_ms: 1000,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
        }
    }
}

impl ClientBusConfig {
    /// A bridging config for `host:port`.
    pub fn bridged(host: impl Into<String>, port: u16) -> Self {
        Self {
            connect_to_server_bus: true,
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Delay between automatic connect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_every_ms)
    }

    /// Socket endpoint, tagged with `client_id`.
    pub fn ws_url(&self, client_id: &str) -> String {
        self.url(self.protocol.ws_scheme(), WS_PATH, client_id)
    }

    /// Event-stream endpoint, tagged with `client_id`.
    pub fn sse_url(&self, client_id: &str) -> String {
        self.url(self.protocol.http_scheme(), SSE_PATH, client_id)
    }

    /// POST endpoint, tagged with `client_id`.
    pub fn send_url(&self, client_id: &str) -> String {
        self.url(self.protocol.http_scheme(), SEND_PATH, client_id)
    }

    fn url(&self, scheme: &str, path: &str, client_id: &str) -> String {
        format!(
            "{scheme}://{}:{}{path}?{CLIENT_ID_PARAM}={client_id}",
            self.host, self.port
        )
    }
}

impl From<&ClientSettings> for ClientBusConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            debug: settings.debug,
            connect_to_server_bus: settings.connect_to_server_bus,
            port: settings.port,
            host: settings.host.clone(),
            protocol: settings.protocol,
            reconnect_every_ms: settings.reconnect_every_ms,
            max_connect_attempts: settings.max_connect_attempts,
        }
    }
}

/// Configuration for a [`PluginEventClient`](crate::PluginEventClient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginClientConfig {
    /// Namespace prefixed to every event name.
    pub plugin_id: String,
    /// Emit `[devbus:plugin]` diagnostic lines.
    #[serde(default)]
    pub debug: bool,
    /// Delay between connect attempts.
    #[serde(default = "default_plugin_reconnect_ms")]
    pub reconnect_every_ms: u64,
    /// When `false`, `emit` and `on` do nothing.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_plugin_reconnect_ms() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

impl PluginClientConfig {
    /// Defaults for `plugin_id`.
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            debug: false,
            reconnect_every_ms: default_plugin_reconnect_ms(),
            enabled: true,
        }
    }

    /// Apply user plugin settings to `plugin_id`.
    pub fn from_settings(plugin_id: impl Into<String>, settings: &PluginSettings) -> Self {
        Self {
            debug: settings.debug,
            reconnect_every_ms: settings.reconnect_every_ms,
            ..Self::new(plugin_id)
        }
    }

    /// Delay between connect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_every_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let cfg = ClientBusConfig::default();
        assert!(!cfg.connect_to_server_bus);
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 4206);
        assert_eq!(cfg.reconnect_interval(), Duration::from_secs(1));
        assert_eq!(cfg.max_connect_attempts, 5);
    }

    #[test]
    fn urls_follow_protocol_and_carry_client_id() {
        let mut cfg = ClientBusConfig::bridged("127.0.0.1", 9000);
        assert_eq!(cfg.ws_url("abc"), "ws://127.0.0.1:9000/__devtools/ws?clientId=abc");
        assert_eq!(cfg.sse_url("abc"), "http://127.0.0.1:9000/__devtools/sse?clientId=abc");

        cfg.protocol = Protocol::Https;
        assert_eq!(cfg.ws_url("x"), "wss://127.0.0.1:9000/__devtools/ws?clientId=x");
        assert_eq!(cfg.send_url("x"), "https://127.0.0.1:9000/__devtools/send?clientId=x");
    }

    #[test]
    fn client_from_settings() {
        let settings = ClientSettings {
            connect_to_server_bus: true,
            port: 5001,
            reconnect_every_ms: 50,
            ..ClientSettings::default()
        };
        let cfg = ClientBusConfig::from(&settings);
        assert!(cfg.connect_to_server_bus);
        assert_eq!(cfg.port, 5001);
        assert_eq!(cfg.reconnect_every_ms, 50);
    }

    #[test]
    fn plugin_defaults_and_partial_json() {
        let cfg = PluginClientConfig::new("query");
        assert!(cfg.enabled);
        assert_eq!(cfg.reconnect_every_ms, 300);

        let parsed: PluginClientConfig = serde_json::from_str(r#"{"pluginId":"a11y"}"#).unwrap();
        assert_eq!(parsed, PluginClientConfig::new("a11y"));
    }

    #[test]
    fn plugin_from_settings() {
        let settings = PluginSettings {
            reconnect_every_ms: 20,
            debug: true,
        };
        let cfg = PluginClientConfig::from_settings("router", &settings);
        assert_eq!(cfg.plugin_id, "router");
        assert_eq!(cfg.reconnect_every_ms, 20);
        assert!(cfg.debug);
        assert!(cfg.enabled);
    }
}
