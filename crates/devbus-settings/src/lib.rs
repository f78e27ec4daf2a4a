//! # devbus-settings
//!
//! Layered configuration for the devtools event bus.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`DevbusSettings::default()`]
//! 2. **User file**: `~/.devbus/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `DEVBUS_*` overrides (highest priority)
//!
//! The server and client crates convert their sections into bus configs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, load_settings, load_settings_from_path, load_settings_with,
    settings_path,
};
pub use types::{ClientSettings, DevbusSettings, LoggingSettings, PluginSettings, ServerSettings};
