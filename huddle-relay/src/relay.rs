//! Relay server core: shared state, WebSocket handler, and channel fan-out.
//!
//! Each connection runs the state machine `Unjoined -> Joined -> Closed`.
//! The first application frame must be a join; after that every frame is
//! rate limited and broadcast verbatim to the channel. The relay never
//! looks inside forwarded frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use huddle_proto::relay::{self, ErrorCode, RelayFrame};
use tokio::sync::mpsc;

use crate::channels::{ChannelRegistry, ConnId, Outbound};
use crate::config::RelayConfig;
use crate::rate_limit::RateLimiter;

/// How often expired rate-limit windows are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared relay state: channel registry and both limiters.
pub struct RelayState {
    /// Channel membership.
    pub channels: ChannelRegistry,
    /// New connections per client IP.
    pub connection_limiter: RateLimiter,
    /// Frames per client IP per channel.
    pub message_limiter: RateLimiter,
    ws_path: String,
    max_frame_size: usize,
    join_timeout: Duration,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

impl RelayState {
    /// Builds relay state from a resolved configuration.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            channels: ChannelRegistry::new(config.max_peers_per_channel, config.echo_to_sender),
            connection_limiter: RateLimiter::new(
                config.connection_limit_per_minute,
                RelayConfig::CONNECTION_WINDOW,
            ),
            message_limiter: RateLimiter::new(
                config.message_limit_per_second,
                RelayConfig::MESSAGE_WINDOW,
            ),
            ws_path: config.ws_path.clone(),
            max_frame_size: config.max_frame_size,
            join_timeout: config.join_timeout,
        }
    }

    /// Path that accepts WebSocket upgrades.
    #[must_use]
    pub fn ws_path(&self) -> &str {
        &self.ws_path
    }

    /// Drops limiter windows that have expired.
    pub fn purge_limiters(&self, now: Instant) {
        let conns = self.connection_limiter.purge_expired(now);
        let msgs = self.message_limiter.purge_expired(now);
        if conns + msgs > 0 {
            tracing::debug!(conns, msgs, "purged expired rate-limit windows");
        }
    }
}

/// Client address used for rate limiting.
///
/// The first `X-Forwarded-For` entry wins when present, since the relay
/// usually sits behind a reverse proxy. Otherwise the socket peer address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_string)
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Check the connection limiter for `ip`.
/// 2. Wait (bounded by the join timeout) for a join frame and admit the
///    connection to its channel.
/// 3. Rate limit and broadcast every following frame.
/// 4. On disconnect, remove the connection from its channel.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, ip: String) {
    let conn = ConnId::next();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: forwards queued frames to the socket, stops after a close.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::debug!(conn = %conn, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    if !state.connection_limiter.allow(&ip) {
        tracing::warn!(conn = %conn, ip = %ip, "connection rate limit exceeded");
        reject(&tx, ErrorCode::RateLimitConnection);
        drop(tx);
        let _ = write_task.await;
        return;
    }

    let joined = tokio::time::timeout(state.join_timeout, wait_for_join(&mut ws_receiver, conn))
        .await
        .unwrap_or_else(|_| {
            tracing::warn!(conn = %conn, ip = %ip, "no join before timeout");
            None
        });
    let Some(channel) = joined else {
        // An invalid first frame, no join in time, or the socket closed first.
        reject(&tx, ErrorCode::InvalidJoin);
        state.channels.detach_all(conn);
        drop(tx);
        let _ = write_task.await;
        return;
    };

    if let Err(e) = state.channels.join(&channel, conn, tx.clone()) {
        tracing::warn!(conn = %conn, channel = %channel, error = %e, "join refused");
        reject(&tx, ErrorCode::ChannelFull);
        drop(tx);
        let _ = write_task.await;
        return;
    }

    send_frame(
        &tx,
        &RelayFrame::Joined {
            channel: channel.clone(),
        },
    );
    tracing::info!(
        conn = %conn,
        ip = %ip,
        channel = %channel,
        members = state.channels.member_count(&channel),
        "connection joined channel"
    );

    let limiter_key = format!("{ip}:{channel}");
    let reader_state = Arc::clone(&state);
    let reader_tx = tx.clone();
    let reader_channel = channel.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let len = match &msg {
                Message::Text(text) => text.as_str().len(),
                Message::Binary(data) => data.len(),
                Message::Close(_) => {
                    tracing::debug!(conn = %conn, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            if !reader_state.message_limiter.allow(&limiter_key) {
                tracing::debug!(conn = %conn, key = %limiter_key, "message rate limit exceeded");
                send_frame(&reader_tx, &RelayFrame::error(ErrorCode::RateLimitMessage));
                continue;
            }

            if len > reader_state.max_frame_size {
                tracing::warn!(
                    conn = %conn,
                    size = len,
                    max = reader_state.max_frame_size,
                    "frame exceeds size limit"
                );
                send_frame(&reader_tx, &RelayFrame::error(ErrorCode::FrameTooLarge));
                continue;
            }

            let delivered = reader_state.channels.broadcast(&reader_channel, &msg, conn);
            tracing::trace!(conn = %conn, size = len, delivered, "frame broadcast");
        }
    });

    tokio::select! {
        _ = &mut read_task => {}
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.channels.leave(&channel, conn);
    drop(tx);
    write_task.abort();
    tracing::info!(conn = %conn, channel = %channel, "connection left channel");
}

/// Waits for the first application frame and extracts a join channel.
///
/// Returns `None` if the first text or binary frame is not a valid join, or
/// the socket closes first.
async fn wait_for_join(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    conn: ConnId,
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        let channel = match msg {
            Message::Text(text) => relay::parse_join(text.as_str().as_bytes()),
            Message::Binary(data) => relay::parse_join(&data),
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if channel.is_none() {
            tracing::warn!(conn = %conn, "first frame was not a valid join");
        }
        return channel;
    }
    None
}

/// Queues a relay frame as a text message.
fn send_frame(tx: &Outbound, frame: &RelayFrame) {
    match relay::encode(frame) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode relay frame"),
    }
}

/// Queues an error frame followed by the close frame for a fatal `code`.
fn reject(tx: &Outbound, code: ErrorCode) {
    send_frame(tx, &RelayFrame::error(code));
    if let Some(close) = code.close_code() {
        let _ = tx.send(Message::Close(Some(CloseFrame {
            code: close,
            reason: code.default_message().into(),
        })));
    }
}

/// Builds the axum router: health check, WebSocket upgrade, 404 fallback.
pub fn router(state: Arc<RelayState>) -> Router {
    let ws_path = state.ws_path().to_string();
    Router::new()
        .route("/healthz", get(healthz))
        .route(&ws_path, get(ws_handler))
        .fallback(not_found)
        .with_state(state)
}

/// Starts the relay server with default state on `addr`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    start_server_with_state(addr, Arc::new(RelayState::default())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Also spawns the periodic limiter sweep, which stops with the server.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                state.purge_limiters(Instant::now());
            }
        });
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %e, "relay server error");
        }
        sweeper.abort();
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    let ip = client_ip(&headers, peer);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
