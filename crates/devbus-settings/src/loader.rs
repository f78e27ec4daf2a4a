//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DevbusSettings::default()`]
//! 2. If `~/.devbus/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `DEVBUS_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use devbus_core::{Mode, Protocol};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::DevbusSettings;

/// Resolve the path to the settings file (`~/.devbus/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".devbus").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DevbusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DevbusSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, reading overrides through `lookup`.
pub fn load_settings_with<F>(path: &Path, lookup: F) -> Result<DevbusSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(DevbusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DevbusSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DEVBUS_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in place.
pub fn apply_overrides<F>(settings: &mut DevbusSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("DEVBUS_HOST") {
        settings.server.host.clone_from(&v);
        settings.client.host = v;
    }
    if let Some(v) = env.u16("DEVBUS_PORT", 0, 65535) {
        settings.server.port = v;
        if v > 0 {
            settings.client.port = v;
        }
    }
    if let Some(v) = env.bool("DEVBUS_DEBUG") {
        settings.server.debug = v;
        settings.client.debug = v;
        settings.plugin.debug = v;
    }
    if let Some(v) = env.parsed("DEVBUS_MODE", Mode::parse) {
        settings.server.mode = Some(v);
    }
    if let Some(v) = env.parsed("DEVBUS_PROTOCOL", Protocol::parse) {
        settings.client.protocol = v;
    }
    if let Some(v) = env.bool("DEVBUS_CONNECT") {
        settings.client.connect_to_server_bus = v;
    }
    if let Some(v) = env.u64("DEVBUS_RECONNECT_MS", 10, 600_000) {
        settings.client.reconnect_every_ms = v;
    }
    if let Some(v) = env.string("DEVBUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("DEVBUS_LOG_JSON") {
        settings.logging.json = v;
    }
}

fn validate(settings: &DevbusSettings) -> Result<()> {
    if settings.server.host.trim().is_empty() {
        return Err(SettingsError::InvalidValue("server.host is empty".into()));
    }
    if settings.client.host.trim().is_empty() {
        return Err(SettingsError::InvalidValue("client.host is empty".into()));
    }
    if settings.client.port == 0 {
        return Err(SettingsError::InvalidValue("client.port must be non-zero".into()));
    }
    if settings.client.max_connect_attempts == 0 {
        return Err(SettingsError::InvalidValue(
            "client.maxConnectAttempts must be at least 1".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, |v| parse_u64_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
