//! Session orchestration for one room.
//!
//! A session ties the pieces together: it joins the room's discovery
//! channel, connects to every discovered peer through the mesh, and packs
//! and unpacks chat messages with the crypto worker. All of that runs on a
//! single driver task; the caller talks to it with [`SessionCommand`]s and
//! reads [`SessionEvent`]s.
//!
//! ```text
//! caller  ── SessionCommand ──▶  driver task  ◀── DiscoveryEvent
//!         ◀── SessionEvent ───               ◀── EngineEvent / MeshEvent
//! ```

use std::fmt;
use std::time::Duration;

use huddle_proto::invite::Invite;
use huddle_proto::message::{MessageId, Timestamp};
use huddle_proto::packed::PUBLIC_KEY_LEN;
use huddle_proto::peer::{PeerDescriptor, PeerId};
use huddle_proto::relay::ErrorCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::crypto::{CryptoClient, CryptoError, GroupKey, SenderKeyPair};
use crate::discovery::{
    DEFAULT_MAX_PEERS, DiscoveryClient, DiscoveryConfig, DiscoveryError, DiscoveryEvent,
};
use crate::mesh::{
    ChannelOf, EngineEvent, MeshError, MeshEvent, MeshManager, MeshStats, RtcEngine, TrackOf,
    is_offerer_for,
};

/// Default interval between link statistics snapshots.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Default capacity of the command and event channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Generates a fresh, time-ordered peer id.
#[must_use]
pub fn generate_peer_id() -> PeerId {
    PeerId::new(uuid::Uuid::now_v7().to_string())
}

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay URL used for discovery and signaling.
    pub relay_url: String,
    /// Name announced to other peers.
    pub display_name: String,
    /// Discovery tunables.
    pub discovery: DiscoveryConfig,
    /// Most peer connections held at once. Peers beyond it wait for a
    /// slot to free up.
    pub max_connections: usize,
    /// Interval between [`SessionEvent::Stats`] snapshots.
    pub stats_interval: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl SessionConfig {
    /// Config with default tunables.
    pub fn new(relay_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            display_name: display_name.into(),
            discovery: DiscoveryConfig::default(),
            max_connections: DEFAULT_MAX_PEERS,
            stats_interval: DEFAULT_STATS_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Errors starting or talking to a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Discovery could not connect.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The crypto worker could not start.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The driver task has stopped.
    #[error("session has ended")]
    Closed,
}

/// Requests to the driver task.
pub enum SessionCommand<T> {
    /// Encrypt `text` and send it to every connected peer.
    SendChat {
        /// Message text.
        text: String,
    },
    /// Replace the local media tracks.
    SetLocalStream(Vec<T>),
    /// Change the announced display name.
    SetDisplayName(String),
    /// Leave the room and stop the driver.
    Shutdown,
}

impl<T> fmt::Debug for SessionCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendChat { text } => f.debug_struct("SendChat").field("len", &text.len()).finish(),
            Self::SetLocalStream(tracks) => {
                f.debug_tuple("SetLocalStream").field(&tracks.len()).finish()
            }
            Self::SetDisplayName(name) => f.debug_tuple("SetDisplayName").field(name).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Things the session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The relay accepted the join.
    Joined {
        /// Discovery channel key.
        channel: String,
    },
    /// A peer announced itself for the first time.
    PeerDiscovered(PeerDescriptor),
    /// A peer is no longer in the discovered set.
    PeerGone(PeerId),
    /// The data channel to a peer opened.
    PeerConnected {
        /// The peer.
        peer_id: PeerId,
        /// Its announced name, if known.
        display_name: Option<String>,
    },
    /// A peer's connection was torn down.
    PeerDisconnected {
        /// The peer.
        peer_id: PeerId,
    },
    /// A chat message was decrypted.
    ChatReceived {
        /// Id assigned on arrival.
        id: MessageId,
        /// Arrival time.
        timestamp: Timestamp,
        /// Peer whose data channel carried the message.
        from: PeerId,
        /// Announced name of that peer, if known.
        display_name: Option<String>,
        /// Message text (invalid UTF-8 replaced).
        text: String,
        /// Whether the embedded signature verified.
        signature_valid: bool,
        /// Fingerprint of the embedded sender key.
        sender_fingerprint: String,
        /// The embedded sender key.
        sender_public_key: [u8; PUBLIC_KEY_LEN],
    },
    /// A message from a peer could not be decoded.
    DecodeFault {
        /// Peer whose data channel carried the message.
        from: PeerId,
        /// What went wrong.
        error: CryptoError,
    },
    /// Local echo of a message this session sent. Its own signature is
    /// valid by construction.
    ChatSent {
        /// Id assigned on send.
        id: MessageId,
        /// Send time.
        timestamp: Timestamp,
        /// Message text.
        text: String,
        /// Number of peers the message was handed to.
        delivered: usize,
    },
    /// A peer started sending media.
    RemoteTrack {
        /// The peer.
        peer_id: PeerId,
        /// Track id.
        track_id: String,
    },
    /// Periodic link quality snapshot.
    Stats(MeshStats),
    /// The relay reported an error.
    RelayError {
        /// Machine-readable cause.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
    /// The relay connection ended. Established peer links keep working.
    RelayDisconnected {
        /// Close code sent by the relay, if any.
        close_code: Option<u16>,
    },
    /// A non-fatal error worth showing.
    Error(String),
    /// The driver has stopped. Always the last event.
    Closed,
}

/// Result of diffing a replacement peer set against the previous one.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RosterChange {
    /// Peers not present before.
    pub added: Vec<PeerDescriptor>,
    /// Peers no longer present.
    pub removed: Vec<PeerId>,
}

/// The last peer set reported by discovery.
#[derive(Debug, Default)]
pub struct Roster {
    peers: Vec<PeerDescriptor>,
}

impl Roster {
    /// Replaces the known set with `peers` and reports the difference.
    ///
    /// Descriptors of peers present in both sets are refreshed (for
    /// example a display name change) without being reported.
    pub fn apply(&mut self, peers: Vec<PeerDescriptor>) -> RosterChange {
        let added = peers
            .iter()
            .filter(|new| !self.contains(&new.peer_id))
            .cloned()
            .collect();
        let removed = self
            .peers
            .iter()
            .filter(|old| !peers.iter().any(|new| new.peer_id == old.peer_id))
            .map(|old| old.peer_id.clone())
            .collect();
        self.peers = peers;
        RosterChange { added, removed }
    }

    /// Whether `peer_id` is in the set.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.iter().any(|p| p.peer_id == *peer_id)
    }

    /// Display name of `peer_id`, if known.
    #[must_use]
    pub fn display_name(&self, peer_id: &PeerId) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.peer_id == *peer_id)
            .map(|p| p.display_name.as_str())
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Ids of the known peers, in first-seen order.
    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter().map(|p| &p.peer_id)
    }
}

/// Caller side of a running session.
pub struct SessionHandle<T> {
    local_id: PeerId,
    channel: String,
    fingerprint: String,
    public_key: [u8; PUBLIC_KEY_LEN],
    commands: mpsc::Sender<SessionCommand<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> SessionHandle<T> {
    /// This peer's id.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Discovery channel key of the room.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Fingerprint of this session's sender key.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// This session's sender public key, as embedded in every message.
    #[must_use]
    pub const fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// Sends a chat message to every connected peer.
    ///
    /// The driver answers with [`SessionEvent::ChatSent`] once the message
    /// is on its way.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the driver has stopped.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::SendChat { text: text.into() })
            .await
    }

    /// Replaces the local media tracks.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the driver has stopped.
    pub async fn set_local_stream(&self, tracks: Vec<T>) -> Result<(), SessionError> {
        self.command(SessionCommand::SetLocalStream(tracks)).await
    }

    /// Changes the display name announced by later heartbeats.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the driver has stopped.
    pub async fn set_display_name(&self, name: impl Into<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::SetDisplayName(name.into()))
            .await
    }

    /// Leaves the room and waits for the driver to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "session driver ended abnormally");
        }
    }

    async fn command(&self, command: SessionCommand<T>) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

impl<T> fmt::Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("local_id", &self.local_id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Joins the room described by `invite` and starts the driver task.
///
/// `engine` must report its callbacks on `engine_events`, and `local_id`
/// must be the id the engine was created for.
///
/// # Errors
///
/// - [`SessionError::Crypto`] if the crypto worker cannot start.
/// - [`SessionError::Discovery`] if the relay cannot be reached.
pub async fn start<E: RtcEngine>(
    local_id: PeerId,
    invite: &Invite,
    config: SessionConfig,
    engine: E,
    engine_events: mpsc::UnboundedReceiver<EngineEvent<ChannelOf<E>>>,
) -> Result<(SessionHandle<TrackOf<E>>, mpsc::Receiver<SessionEvent>), SessionError> {
    let sender = SenderKeyPair::generate();
    let fingerprint = sender.fingerprint();
    let public_key = sender.public_key();
    let crypto = CryptoClient::spawn(GroupKey::from_bytes(invite.group_key), sender)?;

    let channel = invite.discovery_key();
    let descriptor = PeerDescriptor::new(local_id.clone(), config.display_name.clone());
    let (discovery, discovery_events) =
        DiscoveryClient::connect(&config.relay_url, &channel, descriptor, config.discovery).await?;

    let (mesh, mesh_events) = MeshManager::new(local_id.clone(), engine);
    let mesh = mesh.with_max_peers(config.max_connections);
    let (commands_tx, commands_rx) = mpsc::channel(config.channel_capacity);
    let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);

    let driver = Driver {
        discovery,
        mesh,
        crypto,
        roster: Roster::default(),
        events: events_tx,
    };
    let task = tokio::spawn(driver.run(
        discovery_events,
        mesh_events,
        engine_events,
        commands_rx,
        config.stats_interval,
    ));

    tracing::info!(peer_id = %local_id.short(), channel = %channel, "session started");
    Ok((
        SessionHandle {
            local_id,
            channel,
            fingerprint,
            public_key,
            commands: commands_tx,
            task,
        },
        events_rx,
    ))
}

struct Driver<E: RtcEngine> {
    discovery: DiscoveryClient,
    mesh: MeshManager<E>,
    crypto: CryptoClient,
    roster: Roster,
    events: mpsc::Sender<SessionEvent>,
}

impl<E: RtcEngine> Driver<E> {
    async fn run(
        mut self,
        mut discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut mesh_events: mpsc::UnboundedReceiver<MeshEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent<ChannelOf<E>>>,
        mut commands: mpsc::Receiver<SessionCommand<TrackOf<E>>>,
        stats_interval: Duration,
    ) {
        let mut stats_tick =
            tokio::time::interval_at(Instant::now() + stats_interval, stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = discovery_events.recv() => self.on_discovery(event).await,
                Some(event) = engine_events.recv() => self.mesh.handle_engine_event(event).await,
                Some(event) = mesh_events.recv() => self.on_mesh(event).await,
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                _ = stats_tick.tick() => {
                    let stats = self.mesh.collect_stats().await;
                    self.emit(SessionEvent::Stats(stats)).await;
                }
            }
        }

        self.discovery.disconnect().await;
        self.mesh.close().await;
        tracing::info!("session closed");
        self.emit(SessionEvent::Closed).await;
    }

    async fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Joined { channel } => {
                self.emit(SessionEvent::Joined { channel }).await;
            }
            DiscoveryEvent::PeersUpdated(peers) => {
                let change = self.roster.apply(peers);
                for peer_id in change.removed {
                    self.emit(SessionEvent::PeerGone(peer_id)).await;
                }
                for descriptor in change.added {
                    let peer_id = descriptor.peer_id.clone();
                    self.emit(SessionEvent::PeerDiscovered(descriptor)).await;
                    self.connect_to(&peer_id).await;
                }
            }
            DiscoveryEvent::Signaling { from, payload } => {
                if let Err(e) = self.mesh.handle_signaling(&from, payload).await {
                    tracing::warn!(peer_id = %from.short(), error = %e, "signaling failed");
                }
            }
            DiscoveryEvent::RelayError { code, message } => {
                self.emit(SessionEvent::RelayError { code, message }).await;
            }
            DiscoveryEvent::Disconnected { close_code } => {
                self.emit(SessionEvent::RelayDisconnected { close_code })
                    .await;
            }
        }
    }

    async fn connect_to(&mut self, peer_id: &PeerId) {
        match self.mesh.add_peer(peer_id).await {
            Ok(()) => {}
            Err(MeshError::Full(_)) => {
                tracing::debug!(peer_id = %peer_id.short(), "mesh full, peer waits for a slot");
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer_id.short(), error = %e, "failed to add peer");
                self.emit(SessionEvent::Error(e.to_string())).await;
            }
        }
    }

    /// Connects to roster peers left out while the mesh was full.
    ///
    /// Only peers this side can start with are tried: those it offers to
    /// and those whose offer was parked. The peer that just left is
    /// skipped.
    async fn fill_slots(&mut self, departed: &PeerId) {
        let waiting: Vec<PeerId> = self
            .roster
            .peer_ids()
            .filter(|id| *id != departed && self.mesh.state(id).is_none())
            .filter(|id| {
                is_offerer_for(self.mesh.local_id(), id) || self.mesh.has_parked_offer(id)
            })
            .cloned()
            .collect();
        for peer_id in waiting {
            if self.mesh.is_full() {
                break;
            }
            tracing::debug!(peer_id = %peer_id.short(), "retrying peer after a slot freed");
            self.connect_to(&peer_id).await;
        }
    }

    async fn on_mesh(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Signal { to, payload } => {
                if let Err(e) = self.discovery.send_signaling(&to, payload).await {
                    tracing::debug!(peer_id = %to.short(), error = %e, "signaling not sent");
                }
            }
            MeshEvent::PeerJoined { peer_id } => {
                let display_name = self.display_name(&peer_id);
                self.emit(SessionEvent::PeerConnected {
                    peer_id,
                    display_name,
                })
                .await;
            }
            MeshEvent::PeerLeft { peer_id } => {
                self.emit(SessionEvent::PeerDisconnected {
                    peer_id: peer_id.clone(),
                })
                .await;
                self.fill_slots(&peer_id).await;
            }
            MeshEvent::Message { peer_id, data } => {
                let event = match self.crypto.unpack(data).await {
                    Ok(unpacked) => {
                        if !unpacked.signature_valid {
                            tracing::warn!(peer_id = %peer_id.short(), "message signature invalid");
                        }
                        SessionEvent::ChatReceived {
                            id: MessageId::new(),
                            timestamp: Timestamp::now(),
                            display_name: self.display_name(&peer_id),
                            from: peer_id,
                            text: String::from_utf8_lossy(&unpacked.plaintext).into_owned(),
                            signature_valid: unpacked.signature_valid,
                            sender_fingerprint: crate::crypto::keys::fingerprint(
                                &unpacked.sender_public_key,
                            ),
                            sender_public_key: unpacked.sender_public_key,
                        }
                    }
                    Err(error) => {
                        tracing::warn!(peer_id = %peer_id.short(), error = %error, "decode fault");
                        SessionEvent::DecodeFault {
                            from: peer_id,
                            error,
                        }
                    }
                };
                self.emit(event).await;
            }
            MeshEvent::RemoteTrack { peer_id, track_id } => {
                self.emit(SessionEvent::RemoteTrack { peer_id, track_id })
                    .await;
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand<TrackOf<E>>) {
        match command {
            SessionCommand::SendChat { text } => {
                match self.crypto.pack(text.clone().into_bytes()).await {
                    Ok(packed) => {
                        let delivered = self.mesh.broadcast(&packed).await;
                        self.emit(SessionEvent::ChatSent {
                            id: MessageId::new(),
                            timestamp: Timestamp::now(),
                            text,
                            delivered,
                        })
                        .await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to pack message");
                        self.emit(SessionEvent::Error(e.to_string())).await;
                    }
                }
            }
            SessionCommand::SetLocalStream(tracks) => self.mesh.set_local_stream(tracks).await,
            SessionCommand::SetDisplayName(name) => self.discovery.update_descriptor(name),
            SessionCommand::Shutdown => {}
        }
    }

    fn display_name(&self, peer_id: &PeerId) -> Option<String> {
        self.roster.display_name(peer_id).map(str::to_string)
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("session event receiver dropped");
        }
    }
}
