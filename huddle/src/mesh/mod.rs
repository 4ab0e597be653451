//! Full-mesh peer connection management.
//!
//! A [`MeshManager`] owns one negotiated connection per remote peer and
//! drives the offer/answer/ICE exchange for each of them. Which side makes
//! the initial offer is decided by comparing peer ids: the smaller id
//! offers and creates the `"chat"` data channel, the larger one answers.
//!
//! The actual ICE/DTLS/SCTP work is delegated to an [`RtcEngine`]:
//! - [`loopback::LoopbackEngine`]: in-process engine for tests
//! - [`webrtc_engine::WebRtcEngine`]: backed by the `webrtc` crate
//!
//! Engines report asynchronous happenings (local candidates, state changes,
//! inbound channels and messages) as [`EngineEvent`]s on a channel. The
//! owner of the manager feeds them back through
//! [`MeshManager::handle_engine_event`], so every state change happens on
//! one task.

pub mod loopback;
pub mod webrtc_engine;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;

use huddle_proto::peer::PeerId;
use huddle_proto::signaling::{IceCandidate, SessionDescription, SignalingPayload};
use tokio::sync::mpsc;

/// Label of the data channel carrying chat messages.
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// Errors raised by an RTC engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtcError {
    /// A candidate arrived before any remote description was applied.
    #[error("no remote description set")]
    NoRemoteDescription,

    /// The description does not fit the current signaling state.
    #[error("invalid signaling state: {0}")]
    InvalidState(String),

    /// The data channel is not open.
    #[error("data channel '{0}' is not open")]
    ChannelClosed(String),

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Anything else the engine reports.
    #[error("rtc engine error: {0}")]
    Engine(String),
}

/// Errors from mesh operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// No connection exists for the peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer's data channel is not open yet.
    #[error("no open data channel to {0}")]
    NotReady(PeerId),

    /// The mesh already holds its maximum number of peers.
    #[error("mesh is full, {0} has to wait")]
    Full(PeerId),

    /// The engine failed while negotiating with a peer.
    #[error("negotiation with {peer} failed: {source}")]
    Negotiation {
        /// Remote peer.
        peer: PeerId,
        /// Underlying engine error.
        #[source]
        source: RtcError,
    },
}

/// Signaling state of one connection, as defined by JSEP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No offer/answer exchange in progress.
    Stable,
    /// A local offer has been applied.
    HaveLocalOffer,
    /// A remote offer has been applied.
    HaveRemoteOffer,
    /// The connection is closed.
    Closed,
}

/// Transport state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing attempted yet.
    New,
    /// ICE/DTLS in progress.
    Connecting,
    /// Media and data can flow.
    Connected,
    /// Connectivity was lost.
    Disconnected,
    /// Connectivity checks failed.
    Failed,
    /// Closed locally.
    Closed,
}

impl ConnectionState {
    /// Whether this state ends the peer's entry.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a peer entry in the mesh. Torn-down peers have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Offer/answer in progress or data channel not yet open.
    Negotiating,
    /// The data channel is open.
    Connected,
}

/// Bytes and packets carried by a connection's selected transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
}

impl std::ops::AddAssign for TrafficStats {
    fn add_assign(&mut self, other: Self) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
    }
}

/// Raw transport statistics for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    /// Round-trip time in milliseconds, if measured.
    pub rtt_ms: Option<f64>,
    /// Media packets the remote side reports lost.
    pub packets_lost: u64,
    /// Media packets the remote side reports received.
    pub packets_received: u64,
    /// Transport totals in both directions.
    pub traffic: TrafficStats,
}

/// Link quality derived from [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerQuality {
    /// Round-trip time in milliseconds, if measured.
    pub rtt_ms: Option<f64>,
    /// Share of packets lost, if any packets were counted.
    pub loss_percent: Option<f64>,
    /// Transport totals in both directions.
    pub traffic: TrafficStats,
}

impl From<ConnectionStats> for PeerQuality {
    fn from(stats: ConnectionStats) -> Self {
        let total = stats.packets_lost + stats.packets_received;
        #[allow(clippy::cast_precision_loss)]
        let loss_percent =
            (total > 0).then(|| stats.packets_lost as f64 / total as f64 * 100.0);
        Self {
            rtt_ms: stats.rtt_ms.filter(|rtt| *rtt > 0.0),
            loss_percent,
            traffic: stats.traffic,
        }
    }
}

/// Snapshot of link quality across the mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshStats {
    /// Smallest positive round-trip time across peers, rounded.
    pub ping_ms: Option<u32>,
    /// Per-peer quality, for peers whose statistics could be read.
    pub peers: Vec<(PeerId, PeerQuality)>,
}

impl MeshStats {
    /// Traffic summed over every peer in the snapshot.
    #[must_use]
    pub fn total_traffic(&self) -> TrafficStats {
        let mut total = TrafficStats::default();
        for (_, quality) in &self.peers {
            total += quality.traffic;
        }
        total
    }
}

/// A bidirectional message channel to one peer.
pub trait DataChannel: Send + Sync + 'static {
    /// Channel label.
    fn label(&self) -> &str;

    /// Whether messages can be sent.
    fn is_open(&self) -> bool;

    /// Sends one binary message.
    fn send(&self, data: Vec<u8>) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Closes the channel.
    fn close(&self) -> impl Future<Output = Result<(), RtcError>> + Send;
}

/// One negotiated connection to a remote peer.
///
/// Mirrors the subset of `RTCPeerConnection` the mesh needs. Descriptions
/// and candidates use the wire types so they can be relayed unchanged.
pub trait PeerConnection: Send + Sync + 'static {
    /// Data channel type produced by this connection.
    type DataChannel: DataChannel;
    /// Local media track handle.
    type Track: Clone + Send + Sync + 'static;

    /// Creates an offer for the current local state.
    fn create_offer(&self)
    -> impl Future<Output = Result<SessionDescription, RtcError>> + Send;

    /// Creates an answer to the applied remote offer.
    fn create_answer(
        &self,
    ) -> impl Future<Output = Result<SessionDescription, RtcError>> + Send;

    /// Applies a local description.
    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Applies a remote description.
    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Whether a remote description has been applied.
    fn has_remote_description(&self) -> impl Future<Output = bool> + Send;

    /// Applies a remote ICE candidate.
    ///
    /// Fails with [`RtcError::NoRemoteDescription`] before a remote
    /// description is set.
    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Creates a locally initiated data channel.
    fn create_data_channel(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Self::DataChannel, RtcError>> + Send;

    /// Adds a new sender for `track`.
    fn add_track(&self, track: Self::Track)
    -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Swaps the track of the first sender without renegotiating.
    fn replace_track(
        &self,
        track: Self::Track,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Number of media senders.
    fn sender_count(&self) -> impl Future<Output = usize> + Send;

    /// Current signaling state.
    fn signaling_state(&self) -> SignalingState;

    /// Current transport state.
    fn connection_state(&self) -> ConnectionState;

    /// Reads transport statistics.
    fn stats(&self) -> impl Future<Output = Result<ConnectionStats, RtcError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), RtcError>> + Send;
}

/// Factory for peer connections.
pub trait RtcEngine: Send + Sync + 'static {
    /// Connection type this engine produces.
    type Connection: PeerConnection;

    /// Creates a connection to `peer_id`. Its callbacks are reported on the
    /// engine's event channel tagged with `peer_id`.
    fn create_connection(
        &self,
        peer_id: &PeerId,
    ) -> impl Future<Output = Result<Self::Connection, RtcError>> + Send;
}

/// Data channel type of an engine.
pub type ChannelOf<E> = <<E as RtcEngine>::Connection as PeerConnection>::DataChannel;

/// Track type of an engine.
pub type TrackOf<E> = <<E as RtcEngine>::Connection as PeerConnection>::Track;

/// A callback from an engine connection.
#[derive(Debug)]
pub struct EngineEvent<D> {
    /// Remote peer of the connection that raised the event.
    pub peer_id: PeerId,
    /// What happened.
    pub kind: EngineEventKind<D>,
}

/// Kinds of [`EngineEvent`].
#[derive(Debug)]
pub enum EngineEventKind<D> {
    /// A local ICE candidate was gathered.
    IceCandidate(IceCandidate),
    /// The transport state changed.
    ConnectionState(ConnectionState),
    /// The remote side opened a data channel.
    DataChannel(D),
    /// A data channel became open.
    ChannelOpen {
        /// Channel label.
        label: String,
    },
    /// A data channel closed.
    ChannelClosed {
        /// Channel label.
        label: String,
    },
    /// A message arrived on a data channel.
    ChannelMessage {
        /// Channel label.
        label: String,
        /// Message bytes.
        data: Vec<u8>,
    },
    /// The remote side added a media track.
    RemoteTrack {
        /// Track id.
        track_id: String,
    },
}

/// Something the mesh wants its owner to know or do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Send `payload` to `to` over the signaling transport.
    Signal {
        /// Recipient.
        to: PeerId,
        /// Negotiation payload.
        payload: SignalingPayload,
    },
    /// The data channel to a peer opened.
    PeerJoined {
        /// The peer.
        peer_id: PeerId,
    },
    /// A peer's connection was torn down.
    PeerLeft {
        /// The peer.
        peer_id: PeerId,
    },
    /// Bytes arrived on a peer's data channel.
    Message {
        /// Sending peer.
        peer_id: PeerId,
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// A peer started sending a media track.
    RemoteTrack {
        /// Sending peer.
        peer_id: PeerId,
        /// Track id.
        track_id: String,
    },
}

/// Whether the local peer makes the initial offer to `remote`.
#[must_use]
pub fn is_offerer_for(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// An offer that arrived while the mesh was full, with the candidates
/// that followed it.
struct ParkedOffer {
    offer: SessionDescription,
    candidates: VecDeque<IceCandidate>,
}

struct PeerEntry<C: PeerConnection> {
    connection: C,
    pending_candidates: VecDeque<IceCandidate>,
    data_channel: Option<C::DataChannel>,
    state: PeerState,
    offerer: bool,
}

/// Owns every peer connection of one session.
pub struct MeshManager<E: RtcEngine> {
    local_id: PeerId,
    engine: E,
    peers: HashMap<PeerId, PeerEntry<E::Connection>>,
    parked: HashMap<PeerId, ParkedOffer>,
    max_peers: usize,
    local_tracks: Vec<TrackOf<E>>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl<E: RtcEngine> MeshManager<E> {
    /// Creates an empty, uncapped mesh for `local_id`.
    pub fn new(local_id: PeerId, engine: E) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id,
                engine,
                peers: HashMap::new(),
                parked: HashMap::new(),
                max_peers: usize::MAX,
                local_tracks: Vec::new(),
                events,
            },
            events_rx,
        )
    }

    /// Caps the number of peer entries, negotiating ones included.
    ///
    /// At the cap, [`add_peer`](Self::add_peer) fails with
    /// [`MeshError::Full`] and offers from new peers are parked. A parked
    /// offer is answered when `add_peer` is called for its sender after a
    /// slot frees up.
    #[must_use]
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Whether the mesh holds as many peers as it may.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    /// Whether an offer from `peer_id` waits for a free slot.
    #[must_use]
    pub fn has_parked_offer(&self, peer_id: &PeerId) -> bool {
        self.parked.contains_key(peer_id)
    }

    /// This peer's id.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The engine creating connections.
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Starts connecting to `peer_id`.
    ///
    /// Does nothing if the peer already has an entry. A parked offer from
    /// the peer is answered. Otherwise, as the offerer, creates the chat
    /// data channel and sends the initial offer.
    ///
    /// # Errors
    ///
    /// - [`MeshError::Full`] if the mesh is at its cap.
    /// - [`MeshError::Negotiation`] if the connection or the offer cannot
    ///   be created. The entry is removed in that case.
    pub async fn add_peer(&mut self, peer_id: &PeerId) -> Result<(), MeshError> {
        if self.peers.contains_key(peer_id) || *peer_id == self.local_id {
            return Ok(());
        }
        if self.is_full() {
            return Err(MeshError::Full(peer_id.clone()));
        }
        self.create_entry(peer_id).await?;

        if let Some(parked) = self.parked.remove(peer_id) {
            tracing::debug!(peer_id = %peer_id.short(), "answering parked offer");
            if let Some(entry) = self.peers.get_mut(peer_id) {
                entry.pending_candidates = parked.candidates;
            }
            return self.accept_offer(peer_id, parked.offer).await;
        }

        let offerer = self.is_offerer(peer_id);
        tracing::debug!(peer_id = %peer_id.short(), offerer, "adding peer");
        if !offerer {
            return Ok(());
        }

        if let Err(e) = self.open_and_offer(peer_id).await {
            tracing::warn!(peer_id = %peer_id.short(), error = %e, "initial offer failed");
            self.discard(peer_id).await;
            return Err(negotiation(peer_id, e));
        }
        Ok(())
    }

    /// Applies a negotiation payload received from `from`.
    ///
    /// Offers create the entry on first contact and are answered; at the
    /// cap they are parked instead, along with the candidates that follow.
    /// Other answers and candidates for unknown peers are ignored.
    /// Candidates that arrive before the remote description are queued and
    /// applied in arrival order once it is set.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Negotiation`] if the engine rejects a
    /// description.
    pub async fn handle_signaling(
        &mut self,
        from: &PeerId,
        payload: SignalingPayload,
    ) -> Result<(), MeshError> {
        tracing::trace!(peer_id = %from.short(), kind = payload.kind(), "signaling received");
        match payload {
            SignalingPayload::Offer { sdp } => self.accept_offer(from, sdp).await,
            SignalingPayload::Answer { sdp } => {
                let Some(entry) = self.peers.get(from) else {
                    tracing::debug!(peer_id = %from.short(), "answer from unknown peer ignored");
                    return Ok(());
                };
                entry
                    .connection
                    .set_remote_description(sdp)
                    .await
                    .map_err(|e| negotiation(from, e))?;
                self.flush_candidates(from).await;
                Ok(())
            }
            SignalingPayload::Ice { candidate } => {
                let Some(entry) = self.peers.get_mut(from) else {
                    if let Some(parked) = self.parked.get_mut(from) {
                        parked.candidates.push_back(candidate);
                    } else {
                        tracing::debug!(
                            peer_id = %from.short(),
                            "candidate from unknown peer ignored"
                        );
                    }
                    return Ok(());
                };
                if entry.connection.has_remote_description().await {
                    if let Err(e) = entry.connection.add_ice_candidate(candidate).await {
                        tracing::warn!(peer_id = %from.short(), error = %e, "candidate rejected");
                    }
                } else {
                    entry.pending_candidates.push_back(candidate);
                }
                Ok(())
            }
        }
    }

    /// Applies a callback reported by the engine.
    ///
    /// Events for peers without an entry are dropped.
    pub async fn handle_engine_event(&mut self, event: EngineEvent<ChannelOf<E>>) {
        let EngineEvent { peer_id, kind } = event;
        let Some(entry) = self.peers.get_mut(&peer_id) else {
            tracing::trace!(peer_id = %peer_id.short(), "engine event for removed peer");
            return;
        };

        match kind {
            EngineEventKind::IceCandidate(candidate) => {
                self.emit(MeshEvent::Signal {
                    to: peer_id,
                    payload: SignalingPayload::Ice { candidate },
                });
            }
            EngineEventKind::ConnectionState(state) => {
                tracing::debug!(peer_id = %peer_id.short(), state = %state, "connection state");
                if state.is_terminal() {
                    self.remove_peer(&peer_id).await;
                }
            }
            EngineEventKind::DataChannel(channel) => {
                if channel.label() == DATA_CHANNEL_LABEL {
                    entry.data_channel = Some(channel);
                } else {
                    tracing::debug!(label = channel.label(), "ignoring unexpected data channel");
                }
            }
            EngineEventKind::ChannelOpen { label } => {
                if label == DATA_CHANNEL_LABEL && entry.state == PeerState::Negotiating {
                    entry.state = PeerState::Connected;
                    tracing::info!(peer_id = %peer_id.short(), "peer joined");
                    self.emit(MeshEvent::PeerJoined { peer_id });
                }
            }
            EngineEventKind::ChannelClosed { label } => {
                if label == DATA_CHANNEL_LABEL {
                    self.remove_peer(&peer_id).await;
                }
            }
            EngineEventKind::ChannelMessage { label, data } => {
                if label == DATA_CHANNEL_LABEL {
                    self.emit(MeshEvent::Message { peer_id, data });
                }
            }
            EngineEventKind::RemoteTrack { track_id } => {
                self.emit(MeshEvent::RemoteTrack { peer_id, track_id });
            }
        }
    }

    /// Sets the local media tracks shared with every peer.
    ///
    /// Connections that already send media get their first track swapped in
    /// place. Connections without senders get the tracks attached and, if
    /// no exchange is in progress, a fresh offer. Renegotiation failures are
    /// logged and otherwise ignored.
    pub async fn set_local_stream(&mut self, tracks: Vec<TrackOf<E>>) {
        self.local_tracks = tracks;
        let Some(first) = self.local_tracks.first().cloned() else {
            return;
        };

        let mut renegotiate = Vec::new();
        for (peer_id, entry) in &self.peers {
            let connection = &entry.connection;
            if connection.sender_count().await > 0 {
                if let Err(e) = connection.replace_track(first.clone()).await {
                    tracing::warn!(peer_id = %peer_id.short(), error = %e, "track replace failed");
                }
                continue;
            }
            for track in &self.local_tracks {
                if let Err(e) = connection.add_track(track.clone()).await {
                    tracing::warn!(peer_id = %peer_id.short(), error = %e, "track add failed");
                }
            }
            if connection.signaling_state() == SignalingState::Stable {
                renegotiate.push(peer_id.clone());
            }
        }

        for peer_id in renegotiate {
            if let Err(e) = self.send_offer(&peer_id).await {
                tracing::debug!(peer_id = %peer_id.short(), error = %e, "renegotiation failed");
            }
        }
    }

    /// Tears down the entry for `peer_id` and emits
    /// [`MeshEvent::PeerLeft`]. Returns whether an entry existed.
    pub async fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        let Some(entry) = self.peers.remove(peer_id) else {
            return false;
        };
        close_entry(peer_id, &entry).await;
        tracing::info!(peer_id = %peer_id.short(), "peer left");
        self.emit(MeshEvent::PeerLeft {
            peer_id: peer_id.clone(),
        });
        true
    }

    /// Ids of every peer with an entry, sorted.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The connection to `peer_id`, if any.
    #[must_use]
    pub fn connection(&self, peer_id: &PeerId) -> Option<&E::Connection> {
        self.peers.get(peer_id).map(|entry| &entry.connection)
    }

    /// Lifecycle state of `peer_id`, if it has an entry.
    #[must_use]
    pub fn state(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.peers.get(peer_id).map(|entry| entry.state)
    }

    /// Whether this side made (or will make) the initial offer to `peer_id`.
    #[must_use]
    pub fn is_offerer(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .map_or_else(|| is_offerer_for(&self.local_id, peer_id), |entry| entry.offerer)
    }

    /// Number of queued candidates for `peer_id`.
    #[must_use]
    pub fn pending_candidates(&self, peer_id: &PeerId) -> usize {
        self.peers
            .get(peer_id)
            .map_or(0, |entry| entry.pending_candidates.len())
    }

    /// Sends bytes on the data channel to `peer_id`.
    ///
    /// # Errors
    ///
    /// - [`MeshError::UnknownPeer`] if the peer has no entry.
    /// - [`MeshError::NotReady`] if its data channel is not open.
    /// - [`MeshError::Negotiation`] if the channel refuses the message.
    pub async fn send(&self, peer_id: &PeerId, data: Vec<u8>) -> Result<(), MeshError> {
        let entry = self
            .peers
            .get(peer_id)
            .ok_or_else(|| MeshError::UnknownPeer(peer_id.clone()))?;
        let channel = entry
            .data_channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .ok_or_else(|| MeshError::NotReady(peer_id.clone()))?;
        channel.send(data).await.map_err(|e| negotiation(peer_id, e))
    }

    /// Sends bytes to every peer with an open data channel. Returns how many
    /// peers the message was handed to.
    pub async fn broadcast(&self, data: &[u8]) -> usize {
        let mut delivered = 0;
        for (peer_id, entry) in &self.peers {
            let Some(channel) = entry.data_channel.as_ref().filter(|c| c.is_open()) else {
                continue;
            };
            match channel.send(data.to_vec()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id.short(), error = %e, "broadcast send failed");
                }
            }
        }
        delivered
    }

    /// Reads link statistics from every connection.
    ///
    /// Peers whose statistics cannot be read are skipped.
    pub async fn collect_stats(&self) -> MeshStats {
        let mut peers = Vec::new();
        for peer_id in self.peer_ids() {
            let Some(entry) = self.peers.get(&peer_id) else {
                continue;
            };
            match entry.connection.stats().await {
                Ok(stats) => peers.push((peer_id, PeerQuality::from(stats))),
                Err(e) => {
                    tracing::debug!(peer_id = %peer_id.short(), error = %e, "stats unavailable");
                }
            }
        }

        let ping_ms = peers
            .iter()
            .filter_map(|(_, quality)| quality.rtt_ms)
            .min_by(f64::total_cmp)
            .map(round_ms);
        MeshStats { ping_ms, peers }
    }

    /// Closes every connection and drops parked offers. No events are
    /// emitted.
    pub async fn close(&mut self) {
        self.parked.clear();
        for (peer_id, entry) in self.peers.drain() {
            close_entry(&peer_id, &entry).await;
        }
        tracing::debug!("mesh closed");
    }

    async fn create_entry(&mut self, peer_id: &PeerId) -> Result<(), MeshError> {
        let connection = self
            .engine
            .create_connection(peer_id)
            .await
            .map_err(|e| negotiation(peer_id, e))?;
        for track in &self.local_tracks {
            if let Err(e) = connection.add_track(track.clone()).await {
                tracing::warn!(peer_id = %peer_id.short(), error = %e, "track add failed");
            }
        }
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                connection,
                pending_candidates: VecDeque::new(),
                data_channel: None,
                state: PeerState::Negotiating,
                offerer: is_offerer_for(&self.local_id, peer_id),
            },
        );
        Ok(())
    }

    async fn open_and_offer(&mut self, peer_id: &PeerId) -> Result<(), RtcError> {
        let entry = self
            .peers
            .get_mut(peer_id)
            .ok_or(RtcError::ConnectionClosed)?;
        let channel = entry
            .connection
            .create_data_channel(DATA_CHANNEL_LABEL)
            .await?;
        entry.data_channel = Some(channel);
        self.send_offer(peer_id).await
    }

    async fn send_offer(&self, peer_id: &PeerId) -> Result<(), RtcError> {
        let entry = self.peers.get(peer_id).ok_or(RtcError::ConnectionClosed)?;
        let offer = entry.connection.create_offer().await?;
        entry.connection.set_local_description(offer.clone()).await?;
        self.emit(MeshEvent::Signal {
            to: peer_id.clone(),
            payload: SignalingPayload::Offer { sdp: offer },
        });
        Ok(())
    }

    async fn accept_offer(
        &mut self,
        from: &PeerId,
        offer: SessionDescription,
    ) -> Result<(), MeshError> {
        if !self.peers.contains_key(from) {
            if self.is_full() {
                tracing::info!(peer_id = %from.short(), "mesh full, parking offer");
                let candidates = self
                    .parked
                    .remove(from)
                    .map(|parked| parked.candidates)
                    .unwrap_or_default();
                self.parked
                    .insert(from.clone(), ParkedOffer { offer, candidates });
                return Ok(());
            }
            self.create_entry(from).await?;
            if let (Some(parked), Some(entry)) = (self.parked.remove(from), self.peers.get_mut(from))
            {
                entry.pending_candidates = parked.candidates;
            }
        }
        let entry = self
            .peers
            .get(from)
            .ok_or_else(|| MeshError::UnknownPeer(from.clone()))?;
        let connection = &entry.connection;

        let answer = async move {
            connection.set_remote_description(offer).await?;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok::<_, RtcError>(answer)
        }
        .await
        .map_err(|e| negotiation(from, e))?;

        self.emit(MeshEvent::Signal {
            to: from.clone(),
            payload: SignalingPayload::Answer { sdp: answer },
        });
        self.flush_candidates(from).await;
        Ok(())
    }

    async fn flush_candidates(&mut self, peer_id: &PeerId) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        while let Some(candidate) = entry.pending_candidates.pop_front() {
            if let Err(e) = entry.connection.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %peer_id.short(), error = %e, "queued candidate rejected");
            }
        }
    }

    async fn discard(&mut self, peer_id: &PeerId) {
        if let Some(entry) = self.peers.remove(peer_id) {
            close_entry(peer_id, &entry).await;
        }
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("mesh event receiver dropped");
        }
    }
}

impl<E: RtcEngine> fmt::Debug for MeshManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshManager")
            .field("local_id", &self.local_id)
            .field("peers", &self.peer_ids())
            .field("parked", &self.parked.len())
            .finish_non_exhaustive()
    }
}

async fn close_entry<C: PeerConnection>(peer_id: &PeerId, entry: &PeerEntry<C>) {
    if let Some(channel) = &entry.data_channel {
        let _ = channel.close().await;
    }
    if let Err(e) = entry.connection.close().await {
        tracing::debug!(peer_id = %peer_id.short(), error = %e, "close failed");
    }
}

fn negotiation(peer: &PeerId, source: RtcError) -> MeshError {
    MeshError::Negotiation {
        peer: peer.clone(),
        source,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_ms(ms: f64) -> u32 {
    ms.round().clamp(0.0, f64::from(u32::MAX)) as u32
}
