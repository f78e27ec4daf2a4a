//! # devbus
//!
//! Command line front end for the devtools event bus.
//!
//! - `devbus serve` runs a standalone server bus until Ctrl-C
//! - `devbus tail` bridges a client bus and prints every event as a JSON line
//! - `devbus send` POSTs one event to a running server bus

#![deny(unsafe_code)]

use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use devbus_client::{ClientBusConfig, ClientEventBus};
use devbus_core::logging::{init_json_subscriber, init_subscriber};
use devbus_core::{Envelope, LocalDispatcher, Mode};
use devbus_server::{ServerBusConfig, ServerEventBus};
use devbus_settings::{DevbusSettings, load_settings};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

/// Client id used by one-shot `send` requests.
const SEND_CLIENT_ID: &str = "devbus-cli";

/// Devtools event bus.
#[derive(Parser, Debug)]
#[command(name = "devbus", about = "Devtools event bus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a standalone server bus.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,

        /// `active` or `inert` (overrides settings and build detection).
        #[arg(long, value_parser = parse_mode)]
        mode: Option<Mode>,

        /// Emit `[devbus:server-bus]` diagnostic lines.
        #[arg(long)]
        debug: bool,
    },
    /// Print every event crossing a server bus as one JSON line.
    Tail {
        /// Server host (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Server port (overrides settings).
        #[arg(long)]
        port: Option<u16>,

        /// Only print events scoped to this plugin.
        #[arg(long)]
        plugin: Option<String>,
    },
    /// POST one event to a running server bus.
    Send {
        /// Event type, e.g. `query:update`.
        event_type: String,

        /// JSON payload (default `null`).
        payload: Option<String>,

        /// Server host (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Server port (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },
}

fn parse_mode(val: &str) -> std::result::Result<Mode, String> {
    Mode::parse(val).ok_or_else(|| format!("unknown mode `{val}`, expected `active` or `inert`"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Settings drive the log level, so load them before logging is up.
    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("devbus: ignoring unreadable settings: {e}");
            DevbusSettings::default()
        }
    };
    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    match cli.command {
        Command::Serve {
            host,
            port,
            mode,
            debug,
        } => {
            let mut config = ServerBusConfig::from(&settings.server);
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(mode) = mode {
                config.mode = mode;
            }
            config.debug |= debug;
            serve(config).await
        }
        Command::Tail { host, port, plugin } => {
            let config = client_config(&settings, host, port);
            tail(config, plugin).await
        }
        Command::Send {
            event_type,
            payload,
            host,
            port,
        } => {
            let config = client_config(&settings, host, port);
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("Payload is not valid JSON")?,
                None => Value::Null,
            };
            send(&config, Envelope::new(event_type, payload)).await
        }
    }
}

fn client_config(
    settings: &DevbusSettings,
    host: Option<String>,
    port: Option<u16>,
) -> ClientBusConfig {
    let mut config = ClientBusConfig::from(&settings.client);
    config.connect_to_server_bus = true;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config
}

async fn serve(config: ServerBusConfig) -> Result<()> {
    if !config.mode.is_active() {
        tracing::warn!("server bus is inert; pass --mode active to serve anyway");
        return Ok(());
    }

    let bus = ServerEventBus::new(config);
    let port = bus.start().await.context("Failed to start server bus")?;
    tracing::info!("devbus listening on port {port}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    bus.stop();
    Ok(())
}

async fn tail(config: ClientBusConfig, plugin: Option<String>) -> Result<()> {
    let target = LocalDispatcher::new();
    let bus = ClientEventBus::with_target(config, std::sync::Arc::clone(&target));

    let _printer = target.subscribe_all(move |envelope| {
        if plugin.as_deref().is_some_and(|id| !envelope.belongs_to(id)) {
            return;
        }
        match envelope.encode() {
            Ok(line) => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{line}");
                let _ = out.flush();
            }
            Err(e) => tracing::warn!(error = %e, "unprintable event"),
        }
    });
    bus.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    bus.stop();
    Ok(())
}

async fn send(config: &ClientBusConfig, envelope: Envelope) -> Result<()> {
    let url = config.send_url(SEND_CLIENT_ID);
    let body = envelope.encode().context("Failed to encode event")?;
    let response = reqwest::Client::new()
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    if !response.status().is_success() {
        bail!("server bus rejected the event: {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_are_optional() {
        let cli = Cli::parse_from(["devbus", "serve"]);
        assert!(matches!(
            cli.command,
            Command::Serve {
                host: None,
                port: None,
                mode: None,
                debug: false
            }
        ));
    }

    #[test]
    fn serve_parses_mode() {
        let cli = Cli::parse_from(["devbus", "serve", "--mode", "production", "--port", "0"]);
        let Command::Serve { mode, port, .. } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(mode, Some(Mode::Inert));
        assert_eq!(port, Some(0));
    }

    #[test]
    fn serve_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["devbus", "serve", "--mode", "staging"]).is_err());
    }

    #[test]
    fn send_takes_type_and_payload() {
        let cli = Cli::parse_from(["devbus", "send", "query:update", r#"{"rows":3}"#]);
        let Command::Send {
            event_type,
            payload,
            ..
        } = cli.command
        else {
            panic!("expected send");
        };
        assert_eq!(event_type, "query:update");
        assert_eq!(payload.as_deref(), Some(r#"{"rows":3}"#));
    }

    #[test]
    fn tail_accepts_plugin_filter() {
        let cli = Cli::parse_from(["devbus", "tail", "--plugin", "query"]);
        let Command::Tail { plugin, .. } = cli.command else {
            panic!("expected tail");
        };
        assert_eq!(plugin.as_deref(), Some("query"));
    }

    #[test]
    fn client_config_always_bridges() {
        let settings = DevbusSettings::default();
        let config = client_config(&settings, Some("127.0.0.1".into()), Some(5000));
        assert!(config.connect_to_server_bus);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5000);
        assert_eq!(
            config.send_url(SEND_CLIENT_ID),
            "http://127.0.0.1:5000/__devtools/send?clientId=devbus-cli"
        );
    }
}
