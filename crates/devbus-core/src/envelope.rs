//! The wire envelope and plugin-scoped event names.
//!
//! Every transport (WebSocket, event stream, HTTP POST) carries the same
//! JSON object: `{"type": string, "payload": any}`. Plugin events add an
//! optional `pluginId` and use `"<pluginId>:<name>"` as their type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::PLUGIN_SEPARATOR;
use crate::errors::{CodecError, Result};

/// The unit exchanged over every transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire-level event name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// Owning plugin, set for events emitted through a plugin client.
    #[serde(rename = "pluginId", default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

impl Envelope {
    /// Create an unscoped envelope.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            plugin_id: None,
        }
    }

    /// Create a plugin-scoped envelope from a structured key.
    pub fn scoped(key: &EventKey, payload: Value) -> Self {
        Self {
            event_type: key.to_wire(),
            payload,
            plugin_id: Some(key.plugin_id().to_owned()),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(frame)?;
        if envelope.event_type.is_empty() {
            return Err(CodecError::EmptyType);
        }
        Ok(envelope)
    }

    /// Parse a raw request body.
    pub fn decode_bytes(body: &[u8]) -> Result<Self> {
        let frame = std::str::from_utf8(body).map_err(|_| CodecError::InvalidUtf8)?;
        Self::decode(frame)
    }

    /// Structured key, if the type is plugin-scoped.
    pub fn key(&self) -> Option<EventKey> {
        EventKey::parse(&self.event_type)
    }

    /// Event name with any plugin prefix stripped.
    pub fn event_name(&self) -> &str {
        match self.event_type.split_once(PLUGIN_SEPARATOR) {
            Some((plugin, name)) if !plugin.is_empty() => name,
            _ => &self.event_type,
        }
    }

    /// Whether this envelope belongs to `plugin_id`'s namespace.
    pub fn belongs_to(&self, plugin_id: &str) -> bool {
        match &self.plugin_id {
            Some(owner) => owner == plugin_id,
            None => self.key().is_some_and(|k| k.plugin_id() == plugin_id),
        }
    }
}

/// Structured `<pluginId>:<name>` event name.
///
/// `to_wire` is the only place the separator is written and `parse` the
/// only place it is read.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    plugin_id: String,
    name: String,
}

impl EventKey {
    /// Build a key from its parts.
    pub fn new(plugin_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            name: name.into(),
        }
    }

    /// Split a wire name at the first separator. `None` for unscoped names.
    pub fn parse(wire: &str) -> Option<Self> {
        let (plugin_id, name) = wire.split_once(PLUGIN_SEPARATOR)?;
        if plugin_id.is_empty() {
            return None;
        }
        Some(Self::new(plugin_id, name))
    }

    /// The wire form, `"<pluginId>:<name>"`.
    pub fn to_wire(&self) -> String {
        format!("{}{PLUGIN_SEPARATOR}{}", self.plugin_id, self.name)
    }

    /// Owning plugin.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Event name without prefix.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{PLUGIN_SEPARATOR}{}", self.plugin_id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn encode_uses_wire_field_names() {
        let env = Envelope::new("ping", json!({"n": 1}));
        let json = env.encode().unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "ping");
        assert_eq!(parsed["payload"]["n"], 1);
        assert!(parsed.get("pluginId").is_none());
    }

    #[test]
    fn scoped_envelope_carries_plugin_id() {
        let key = EventKey::new("query", "state");
        let env = Envelope::scoped(&key, json!([1, 2]));
        assert_eq!(env.event_type, "query:state");
        assert_eq!(env.plugin_id.as_deref(), Some("query"));

        let parsed: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(parsed["pluginId"], "query");
    }

    #[test]
    fn decode_missing_payload_is_null() {
        let env = Envelope::decode(r#"{"type":"bare"}"#).unwrap();
        assert_eq!(env.event_type, "bare");
        assert!(env.payload.is_null());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_matches!(Envelope::decode("not json"), Err(CodecError::Malformed(_)));
        assert_matches!(Envelope::decode("[1,2]"), Err(CodecError::Malformed(_)));
        assert_matches!(Envelope::decode(r#"{"payload":1}"#), Err(CodecError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_empty_type() {
        assert_matches!(
            Envelope::decode(r#"{"type":"","payload":null}"#),
            Err(CodecError::EmptyType)
        );
    }

    #[test]
    fn decode_bytes_rejects_invalid_utf8() {
        assert_matches!(
            Envelope::decode_bytes(&[0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        );
    }

    #[test]
    fn decode_preserves_nested_payload() {
        let frame = r#"{"type":"a:b","payload":{"list":[1,"two",null],"deep":{"x":true}}}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.payload["list"][1], "two");
        assert_eq!(env.payload["deep"]["x"], true);
    }

    #[test]
    fn key_parse_splits_at_first_separator() {
        let key = EventKey::parse("router:nav:push").unwrap();
        assert_eq!(key.plugin_id(), "router");
        assert_eq!(key.name(), "nav:push");
        assert_eq!(key.to_wire(), "router:nav:push");
    }

    #[test]
    fn key_parse_rejects_unscoped() {
        assert!(EventKey::parse("other-plugin").is_none());
        assert!(EventKey::parse(":orphan").is_none());
    }

    #[test]
    fn key_display_matches_wire() {
        let key = EventKey::new("p1", "evt");
        assert_eq!(key.to_string(), key.to_wire());
    }

    #[test]
    fn event_name_strips_prefix() {
        assert_eq!(Envelope::new("test:event", Value::Null).event_name(), "event");
        assert_eq!(Envelope::new("plain", Value::Null).event_name(), "plain");
    }

    #[test]
    fn belongs_to_prefers_explicit_plugin_id() {
        let mut env = Envelope::new("p1:evt", Value::Null);
        assert!(env.belongs_to("p1"));
        env.plugin_id = Some("p2".into());
        assert!(!env.belongs_to("p1"));
        assert!(env.belongs_to("p2"));
    }

    #[test]
    fn unscoped_belongs_to_nobody() {
        let env = Envelope::new("other-plugin", json!({}));
        assert!(!env.belongs_to("p1"));
        assert!(!env.belongs_to("other-plugin"));
    }
}
