//! Huddle relay server: rendezvous and signaling only.
//!
//! An axum WebSocket server that groups peers into channels and forwards
//! their discovery and negotiation frames. Chat content never passes
//! through it.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3000
//! cargo run --bin huddle-relay
//!
//! # Run on custom address with limits
//! cargo run --bin huddle-relay -- --bind 127.0.0.1:8080 --max-peers-per-channel 4
//!
//! # Or via environment variables
//! RELAY_ADDR=127.0.0.1:8080 WS_MSG_PER_SEC=20 cargo run --bin huddle-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use huddle_relay::config::{RelayCliArgs, RelayConfig};
use huddle_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        ws_path = %config.ws_path,
        max_peers = ?config.max_peers_per_channel,
        conn_per_min = ?config.connection_limit_per_minute,
        msg_per_sec = ?config.message_limit_per_second,
        "starting huddle relay server"
    );

    let state = Arc::new(RelayState::new(&config));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
