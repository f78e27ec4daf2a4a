//! Runtime mode of a server bus.

use serde::{Deserialize, Serialize};

/// Whether a bus does real work or stays cost-free.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Bind listeners and bridge events.
    #[default]
    Active,
    /// `start()` resolves immediately and binds nothing.
    Inert,
}

impl Mode {
    /// `Active` in debug builds, `Inert` in release builds.
    pub fn detect() -> Self {
        if cfg!(debug_assertions) {
            Self::Active
        } else {
            Self::Inert
        }
    }

    /// Whether the bus should bind and serve.
    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    /// Parse `active` / `inert` (plus the `development` / `production` aliases).
    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_lowercase().as_str() {
            "active" | "development" | "dev" => Some(Self::Active),
            "inert" | "production" | "prod" => Some(Self::Inert),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_is_active_in_test_builds() {
        assert_eq!(Mode::detect(), Mode::Active);
    }

    #[test]
    fn parse_aliases() {
        assert_eq!(Mode::parse("Active"), Some(Mode::Active));
        assert_eq!(Mode::parse("development"), Some(Mode::Active));
        assert_eq!(Mode::parse(" production "), Some(Mode::Inert));
        assert_eq!(Mode::parse("inert"), Some(Mode::Inert));
        assert_eq!(Mode::parse("staging"), None);
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Inert).unwrap(), "\"inert\"");
        let m: Mode = serde_json::from_str("\"active\"").unwrap();
        assert!(m.is_active());
    }
}
