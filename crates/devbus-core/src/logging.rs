//! Structured logging setup and the bus debug channel.
//!
//! Everything logs through `tracing`. Binaries call [`init_subscriber`]
//! once at startup; libraries never install a subscriber themselves.
//!
//! The buses' `debug` flag routes through [`DebugLog`], which emits
//! fixed-prefix lines under the `devbus::debug` target and does nothing
//! when disabled.

use std::fmt::Display;

use tracing_subscriber::EnvFilter;

/// Target used by [`DebugLog`] lines.
pub const DEBUG_TARGET: &str = "devbus::debug";

/// Initialize the global tracing subscriber with compact stderr output.
///
/// `RUST_LOG` takes precedence over `level`. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON lines on stderr.
pub fn init_json_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}

/// Fixed-prefix diagnostic logger toggled by a bus's `debug` flag.
#[derive(Clone, Debug)]
pub struct DebugLog {
    enabled: bool,
    prefix: &'static str,
}

impl DebugLog {
    /// Create a logger with the given prefix.
    pub fn new(enabled: bool, prefix: &'static str) -> Self {
        Self { enabled, prefix }
    }

    /// Whether lines are emitted.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The fixed prefix.
    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Emit one line when enabled.
    pub fn log(&self, message: impl Display) {
        if self.enabled {
            tracing::info!(target: "devbus::debug", "{} {message}", self.prefix);
        }
    }

    /// Format one line without emitting it.
    pub fn line(&self, message: impl Display) -> String {
        format!("{} {message}", self.prefix)
    }
}
