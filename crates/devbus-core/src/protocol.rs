//! URL scheme selection for the client bridge.

use serde::{Deserialize, Serialize};

/// Scheme family used to reach a server bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// `ws://` and `http://`.
    #[default]
    Http,
    /// `wss://` and `https://`.
    Https,
}

impl Protocol {
    /// Scheme for the socket transport.
    pub fn ws_scheme(self) -> &'static str {
        match self {
            Self::Http => "ws",
            Self::Https => "wss",
        }
    }

    /// Scheme for the event-stream and POST transports.
    pub fn http_scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Parse `http` / `https`, case-insensitively.
    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemes_follow_protocol() {
        assert_eq!(Protocol::Http.ws_scheme(), "ws");
        assert_eq!(Protocol::Http.http_scheme(), "http");
        assert_eq!(Protocol::Https.ws_scheme(), "wss");
        assert_eq!(Protocol::Https.http_scheme(), "https");
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Protocol::parse("HTTPS"), Some(Protocol::Https));
        assert_eq!(Protocol::parse("http"), Some(Protocol::Http));
        assert_eq!(Protocol::parse("ftp"), None);
    }

    #[test]
    fn default_is_http() {
        assert_eq!(Protocol::default(), Protocol::Http);
        assert_eq!(serde_json::to_string(&Protocol::Https).unwrap(), "\"https\"");
    }
}
