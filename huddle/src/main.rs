//! `huddle`: small-group peer-to-peer encrypted chat.
//!
//! Creates or joins a room and relays lines typed on stdin to every
//! connected peer. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/huddle/config.toml`).
//!
//! ```bash
//! # Create a room bootstrapped from a relay and print its invitation
//! cargo run --bin huddle -- --name alice create --bootstrap http://127.0.0.1:3000
//!
//! # Join from the printed link
//! cargo run --bin huddle -- --name bob join 'http://127.0.0.1:3000/join#g=...&k=...'
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use huddle::config::{CliArgs, ClientConfig, Command};
use huddle::mesh::webrtc_engine::WebRtcEngine;
use huddle::session::{self, SessionEvent, SessionHandle};
use huddle_proto::invite::Invite;
use huddle_proto::message::Timestamp;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&config.log_level, Some(&config.log_file));
    tracing::info!("huddle starting");

    let result = run(cli.command, &config).await;
    tracing::info!("huddle exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Stdout carries the chat itself, so logs always go to a file. Returns a
/// [`WorkerGuard`] that must be held until shutdown to ensure all buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("huddle.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Resolves the invitation, joins the room and runs the chat loop.
async fn run(command: Option<Command>, config: &ClientConfig) -> Result<(), String> {
    let invite = match command {
        Some(Command::Create { bootstrap, origin }) => {
            let invite = Invite::generate(Some(bootstrap.clone()));
            let link = invite.to_link(origin.as_deref().unwrap_or(&bootstrap));
            println!("Invitation link (share it privately): {link}");
            invite
        }
        Some(Command::Join { link }) => {
            Invite::parse(&link).map_err(|e| format!("invalid invitation: {e}"))?
        }
        None => return Err("nothing to do: use `create` or `join`".to_string()),
    };

    let relay_url = config
        .relay_url
        .clone()
        .or_else(|| invite.bootstrap_url.clone())
        .ok_or("the invitation names no relay; pass --relay-url")?;

    let ice_servers = config.ice_servers_for(invite.bootstrap_url.as_deref());
    tracing::debug!(?ice_servers, "ice servers");
    let (engine, engine_events) =
        WebRtcEngine::new(ice_servers).map_err(|e| format!("webrtc setup failed: {e}"))?;

    let local_id = session::generate_peer_id();
    let (handle, events) = session::start(
        local_id,
        &invite,
        config.session_config(&relay_url),
        engine,
        engine_events,
    )
    .await
    .map_err(|e| format!("failed to join room: {e}"))?;

    println!(
        "Joined as {} (key {}). Type a message, /name <name> to rename, /quit to leave.",
        config.display_name,
        handle.fingerprint()
    );
    chat_loop(handle, events).await;
    Ok(())
}

/// Forwards stdin lines to the session and prints what comes back.
async fn chat_loop<T: Send + 'static>(
    handle: SessionHandle<T>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                let sent = match line.strip_prefix("/name ") {
                    Some(name) => handle.set_display_name(name.trim()).await,
                    None => handle.send_chat(line).await,
                };
                if sent.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(SessionEvent::Closed) | None => return,
                Some(event) => print_event(&event),
            },
        }
    }
    handle.shutdown().await;
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Joined { .. } => println!("* connected to relay"),
        SessionEvent::PeerDiscovered(peer) => {
            println!("* {} is here ({})", peer.display_name, peer.peer_id.short());
        }
        SessionEvent::PeerConnected {
            peer_id,
            display_name,
        } => println!(
            "* linked with {}",
            display_name.as_deref().unwrap_or_else(|| peer_id.short())
        ),
        SessionEvent::PeerDisconnected { peer_id } => {
            println!("* link to {} closed", peer_id.short());
        }
        SessionEvent::ChatReceived {
            timestamp,
            from,
            display_name,
            text,
            signature_valid,
            sender_fingerprint,
            ..
        } => {
            let name = display_name.as_deref().unwrap_or_else(|| from.short());
            let mark = if *signature_valid { "" } else { " [unverified]" };
            println!(
                "[{}] <{name} {sender_fingerprint}>{mark} {text}",
                format_time(*timestamp)
            );
        }
        SessionEvent::DecodeFault { from, error } => {
            println!("* unreadable message from {}: {error}", from.short());
        }
        SessionEvent::ChatSent { delivered: 0, .. } => println!("* nobody is connected yet"),
        SessionEvent::RelayError { code, message } => {
            println!("* relay error {code:?}: {message}");
        }
        SessionEvent::RelayDisconnected { .. } => {
            println!("* relay connection lost; existing links stay up");
        }
        SessionEvent::Error(message) => println!("* {message}"),
        SessionEvent::Stats(stats) => {
            let traffic = stats.total_traffic();
            tracing::debug!(
                ping_ms = ?stats.ping_ms,
                peers = stats.peers.len(),
                bytes_sent = traffic.bytes_sent,
                bytes_received = traffic.bytes_received,
                "link stats"
            );
        }
        SessionEvent::PeerGone(_)
        | SessionEvent::ChatSent { .. }
        | SessionEvent::RemoteTrack { .. }
        | SessionEvent::Closed => {}
    }
}

/// Formats a timestamp as local "HH:MM".
fn format_time(timestamp: Timestamp) -> String {
    use chrono::{Local, TimeZone};
    i64::try_from(timestamp.as_millis())
        .ok()
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map_or_else(|| "??:??".to_string(), |dt| dt.format("%H:%M").to_string())
}
