//! Relay-based peer discovery and signaling transport.
//!
//! A [`DiscoveryClient`] joins one rendezvous channel on the relay,
//! announces this peer's descriptor immediately and then on every
//! heartbeat, and collects the descriptors other members announce. It
//! also carries negotiation payloads: the relay broadcasts them to the
//! whole channel and each client keeps only those addressed to it.
//!
//! Everything observed is reported as a [`DiscoveryEvent`] on an unbounded
//! channel returned by [`DiscoveryClient::connect`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_proto::codec::CodecError;
use huddle_proto::peer::{PeerDescriptor, PeerId};
use huddle_proto::relay::{self, ErrorCode, RelayFrame};
use huddle_proto::signaling::SignalingPayload;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default interval between descriptor re-broadcasts.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Default cap on distinct remote peers tracked.
pub const DEFAULT_MAX_PEERS: usize = 6;

/// Default timeout for opening the relay WebSocket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for a discovery session.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Interval between descriptor re-broadcasts.
    pub heartbeat_interval: Duration,
    /// Cap on distinct remote peers; descriptors from new peers beyond it
    /// are ignored.
    pub max_peers: usize,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_peers: DEFAULT_MAX_PEERS,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Something the discovery client observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// The relay acknowledged the join.
    Joined {
        /// Channel that was joined.
        channel: String,
    },
    /// The full set of known remote peers. Replaces any earlier set.
    PeersUpdated(Vec<PeerDescriptor>),
    /// A negotiation payload addressed to this peer.
    Signaling {
        /// Sending peer.
        from: PeerId,
        /// The payload.
        payload: SignalingPayload,
    },
    /// The relay reported an error. Fatal codes are followed by a close.
    RelayError {
        /// Machine-readable cause.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
    /// The relay connection ended. Emitted once.
    Disconnected {
        /// Close code sent by the relay, if any.
        close_code: Option<u16>,
    },
}

/// Errors from the discovery client.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The relay did not accept the WebSocket in time.
    #[error("relay connection timed out")]
    Timeout,

    /// The WebSocket could not be opened.
    #[error("failed to connect to relay: {0}")]
    Connect(String),

    /// A frame could not be encoded.
    #[error("failed to encode relay frame: {0}")]
    Encode(#[from] CodecError),

    /// The connection is closed.
    #[error("relay connection closed")]
    Closed,
}

/// Known remote descriptors, in first-seen order.
#[derive(Debug)]
struct PeerTable {
    peers: Vec<PeerDescriptor>,
    max_peers: usize,
}

impl PeerTable {
    const fn new(max_peers: usize) -> Self {
        Self {
            peers: Vec::new(),
            max_peers,
        }
    }

    /// Records a remote descriptor, returning the new full set if anything
    /// was recorded.
    fn upsert(&mut self, local: &PeerId, descriptor: PeerDescriptor) -> Option<Vec<PeerDescriptor>> {
        if descriptor.peer_id == *local {
            return None;
        }
        if let Some(existing) = self
            .peers
            .iter_mut()
            .find(|p| p.peer_id == descriptor.peer_id)
        {
            *existing = descriptor;
        } else if self.peers.len() >= self.max_peers {
            tracing::debug!(
                peer_id = %descriptor.peer_id,
                max = self.max_peers,
                "peer cap reached, ignoring descriptor"
            );
            return None;
        } else {
            self.peers.push(descriptor);
        }
        Some(self.snapshot())
    }

    fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.peers.clone()
    }

    fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Whether a signaling frame from `from` to `to` is meant for `local`.
fn addressed_to(local: &PeerId, from: &PeerId, to: &PeerId) -> bool {
    to == local && from != local
}

/// State shared between the client handle and its background tasks.
struct Shared {
    descriptor: Mutex<PeerDescriptor>,
    peers: Mutex<PeerTable>,
    ws_sender: AsyncMutex<WsSender>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    finished: AtomicBool,
}

impl Shared {
    async fn send(&self, frame: &RelayFrame) -> Result<(), DiscoveryError> {
        if self.finished.load(Ordering::Acquire) {
            return Err(DiscoveryError::Closed);
        }
        let json = relay::encode(frame)?;
        self.ws_sender
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "relay send failed");
                DiscoveryError::Closed
            })
    }

    async fn send_descriptor(&self) -> Result<(), DiscoveryError> {
        let descriptor = self.descriptor.lock().clone();
        self.send(&RelayFrame::Descriptor { descriptor }).await
    }

    fn local_id(&self) -> PeerId {
        self.descriptor.lock().peer_id.clone()
    }

    /// Emits the terminal events exactly once.
    fn finish(&self, close_code: Option<u16>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.peers.lock().clear();
        let _ = self.events.send(DiscoveryEvent::PeersUpdated(Vec::new()));
        let _ = self.events.send(DiscoveryEvent::Disconnected { close_code });
    }
}

/// Membership and signaling client for one rendezvous channel.
pub struct DiscoveryClient {
    shared: Arc<Shared>,
    channel: String,
    relay_url: String,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl DiscoveryClient {
    /// Connects to the relay, joins `channel`, and starts the heartbeat.
    ///
    /// Performs the following steps:
    /// 1. Normalizes `relay_url` and opens a WebSocket to it
    /// 2. Sends the join frame and the self descriptor
    /// 3. Spawns the reader task and the heartbeat task
    ///
    /// The relay's join acknowledgment arrives later as
    /// [`DiscoveryEvent::Joined`]; a rejection arrives as
    /// [`DiscoveryEvent::RelayError`] followed by
    /// [`DiscoveryEvent::Disconnected`].
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::Timeout`] if the WebSocket does not open in time.
    /// - [`DiscoveryError::Connect`] if the relay cannot be reached.
    /// - [`DiscoveryError::Closed`] if the socket fails during the handshake.
    pub async fn connect(
        relay_url: &str,
        channel: &str,
        descriptor: PeerDescriptor,
        config: DiscoveryConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>), DiscoveryError> {
        let url = normalize_relay_url(relay_url);
        let (ws_stream, _response) = tokio::time::timeout(config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "relay WebSocket connect timed out");
                DiscoveryError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %url, error = %e, "relay WebSocket connect failed");
                DiscoveryError::Connect(e.to_string())
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            descriptor: Mutex::new(descriptor),
            peers: Mutex::new(PeerTable::new(config.max_peers)),
            ws_sender: AsyncMutex::new(ws_sender),
            events: events_tx,
            finished: AtomicBool::new(false),
        });

        shared
            .send(&RelayFrame::Join {
                channel: channel.to_string(),
            })
            .await?;
        shared.send_descriptor().await?;

        let reader = tokio::spawn(reader_loop(ws_reader, Arc::clone(&shared)));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            config.heartbeat_interval,
        ));

        tracing::info!(
            url = %url,
            channel = %channel,
            peer_id = %shared.local_id().short(),
            "discovery connected"
        );

        Ok((
            Self {
                shared,
                channel: channel.to_string(),
                relay_url: url,
                reader,
                heartbeat,
            },
            events_rx,
        ))
    }

    /// This peer's id.
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.shared.local_id()
    }

    /// Channel this client joined.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Normalized relay URL in use.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Currently known remote peers, in first-seen order.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.shared.peers.lock().snapshot()
    }

    /// Whether the relay connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.finished.load(Ordering::Acquire)
    }

    /// Changes the display name announced by later heartbeats.
    pub fn update_descriptor(&self, display_name: impl Into<String>) {
        self.shared.descriptor.lock().display_name = display_name.into();
    }

    /// Sends a negotiation payload to `to` through the relay.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Closed`] once the connection has ended.
    pub async fn send_signaling(
        &self,
        to: &PeerId,
        payload: SignalingPayload,
    ) -> Result<(), DiscoveryError> {
        tracing::trace!(to = %to.short(), kind = payload.kind(), "sending signaling");
        self.shared
            .send(&RelayFrame::Webrtc {
                from: self.local_id(),
                to: to.clone(),
                payload,
            })
            .await
    }

    /// Stops the heartbeat, closes the socket, and reports the disconnect.
    pub async fn disconnect(&self) {
        self.heartbeat.abort();
        self.reader.abort();
        if self.is_connected() {
            let mut sender = self.shared.ws_sender.lock().await;
            let _ = sender.send(Message::Close(None)).await;
            let _ = sender.close().await;
        }
        self.shared.finish(None);
        tracing::info!(channel = %self.channel, "discovery disconnected");
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.reader.abort();
    }
}

/// Rewrites a bootstrap URL into the relay's WebSocket endpoint.
///
/// `http` becomes `ws` (and `https` becomes `wss`), a trailing slash is
/// dropped, and `/ws` is appended unless already present.
#[must_use]
pub fn normalize_relay_url(url: &str) -> String {
    let url = url.trim();
    let url = url
        .strip_prefix("http")
        .map_or_else(|| url.to_string(), |rest| format!("ws{rest}"));
    let url = url.trim_end_matches('/');
    if url.ends_with("/ws") {
        url.to_string()
    } else {
        format!("{url}/ws")
    }
}

/// Re-sends the descriptor every `interval` until the connection ends.
async fn heartbeat_loop(shared: Arc<Shared>, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    loop {
        ticker.tick().await;
        if shared.send_descriptor().await.is_err() {
            tracing::debug!("heartbeat stopped");
            break;
        }
    }
}

/// Reads relay frames and turns them into events.
///
/// Malformed frames are logged and skipped. When the socket ends, the
/// terminal events are emitted.
async fn reader_loop(mut ws_reader: WsReader, shared: Arc<Shared>) {
    let mut close_code = None;
    while let Some(msg_result) = ws_reader.next().await {
        let data = match msg_result {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code));
                tracing::info!(close_code = ?close_code, "relay closed connection");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "relay WebSocket read error");
                break;
            }
        };

        match relay::decode(&data) {
            Ok(frame) => handle_frame(&shared, frame),
            Err(e) => tracing::warn!(error = %e, "malformed relay frame, skipping"),
        }
    }
    shared.finish(close_code);
}

fn handle_frame(shared: &Shared, frame: RelayFrame) {
    match frame {
        RelayFrame::Joined { channel } => {
            tracing::debug!(channel = %channel, "relay acknowledged join");
            let _ = shared.events.send(DiscoveryEvent::Joined { channel });
        }
        RelayFrame::Descriptor { descriptor } => {
            let local = shared.local_id();
            let updated = shared.peers.lock().upsert(&local, descriptor);
            if let Some(peers) = updated {
                let _ = shared.events.send(DiscoveryEvent::PeersUpdated(peers));
            }
        }
        RelayFrame::Webrtc { from, to, payload } => {
            if addressed_to(&shared.local_id(), &from, &to) {
                let _ = shared
                    .events
                    .send(DiscoveryEvent::Signaling { from, payload });
            }
        }
        RelayFrame::Error { code, message } => {
            tracing::warn!(code = ?code, message = %message, "relay reported error");
            let _ = shared
                .events
                .send(DiscoveryEvent::RelayError { code, message });
        }
        RelayFrame::Join { .. } => {
            tracing::debug!("ignoring join frame from relay");
        }
    }
}
