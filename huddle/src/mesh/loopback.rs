//! Loopback RTC engine for testing.
//!
//! Every [`LoopbackEngine`] created from the same [`LoopbackNetwork`] can
//! reach the others without any sockets. Descriptions are plain text that
//! lists the offered tracks and data channels; a connection pair is linked
//! once the offerer applies the answer, at which point both sides report
//! `Connected` and the offerer's data channels open on both ends.
//!
//! The engine enforces the same ordering rule as a browser: a remote ICE
//! candidate is rejected until a remote description has been applied.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use huddle_proto::peer::PeerId;
use huddle_proto::signaling::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ConnectionState, ConnectionStats, DataChannel, EngineEvent, EngineEventKind, PeerConnection,
    RtcEngine, RtcError, SignalingState,
};

/// Event type produced by loopback engines.
pub type LoopbackEvent = EngineEvent<LoopbackChannel>;

type Events = mpsc::UnboundedSender<LoopbackEvent>;

/// Connection state, keyed by (owner, remote).
type ConnKey = (PeerId, PeerId);

const TRACKS_ATTR: &str = "a=tracks=";
const CHANNELS_ATTR: &str = "a=channels=";

#[derive(Default)]
struct NetworkInner {
    engines: HashMap<PeerId, Events>,
    connections: HashMap<ConnKey, Arc<Mutex<ConnInner>>>,
}

/// A shared in-process "network" of loopback engines.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the engine for `local_id` and the channel its events arrive on.
    #[must_use]
    pub fn engine(
        &self,
        local_id: PeerId,
    ) -> (LoopbackEngine, mpsc::UnboundedReceiver<LoopbackEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().engines.insert(local_id.clone(), tx);
        (
            LoopbackEngine {
                local_id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Number of live connections across every engine.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Sends `kind` to the engine of `to`, tagged as coming from `about`.
    fn deliver(&self, to: &PeerId, about: &PeerId, kind: EngineEventKind<LoopbackChannel>) -> bool {
        let Some(tx) = self.inner.lock().engines.get(to).cloned() else {
            return false;
        };
        tx.send(EngineEvent {
            peer_id: about.clone(),
            kind,
        })
        .is_ok()
    }

    fn connection(&self, owner: &PeerId, remote: &PeerId) -> Option<Arc<Mutex<ConnInner>>> {
        self.inner
            .lock()
            .connections
            .get(&(owner.clone(), remote.clone()))
            .cloned()
    }
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LoopbackNetwork")
            .field("engines", &inner.engines.len())
            .field("connections", &inner.connections.len())
            .finish()
    }
}

/// Loopback engine for one local peer.
#[derive(Debug, Clone)]
pub struct LoopbackEngine {
    local_id: PeerId,
    network: LoopbackNetwork,
}

impl RtcEngine for LoopbackEngine {
    type Connection = LoopbackConnection;

    async fn create_connection(&self, peer_id: &PeerId) -> Result<LoopbackConnection, RtcError> {
        let inner = Arc::new(Mutex::new(ConnInner::default()));
        self.network.inner.lock().connections.insert(
            (self.local_id.clone(), peer_id.clone()),
            Arc::clone(&inner),
        );
        Ok(LoopbackConnection {
            local_id: self.local_id.clone(),
            remote_id: peer_id.clone(),
            network: self.network.clone(),
            inner,
        })
    }
}

/// A local media track. Only its id travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackTrack {
    id: String,
}

impl LoopbackTrack {
    /// Creates a track with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Track id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct ConnInner {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    signaling: SignalingState,
    state: ConnectionState,
    senders: Vec<LoopbackTrack>,
    channels: Vec<LoopbackChannel>,
    applied_candidates: Vec<IceCandidate>,
    remote_tracks: HashSet<String>,
    stats: Result<ConnectionStats, String>,
    candidates_sent: bool,
}

impl Default for ConnInner {
    fn default() -> Self {
        Self {
            local_description: None,
            remote_description: None,
            signaling: SignalingState::Stable,
            state: ConnectionState::New,
            senders: Vec::new(),
            channels: Vec::new(),
            applied_candidates: Vec::new(),
            remote_tracks: HashSet::new(),
            stats: Ok(ConnectionStats::default()),
            candidates_sent: false,
        }
    }
}

impl ConnInner {
    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.state == ConnectionState::Closed {
            Err(RtcError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

/// One side of a loopback connection.
pub struct LoopbackConnection {
    local_id: PeerId,
    remote_id: PeerId,
    network: LoopbackNetwork,
    inner: Arc<Mutex<ConnInner>>,
}

impl LoopbackConnection {
    /// Remote candidates applied so far, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().applied_candidates.clone()
    }

    /// Ids of tracks currently sent.
    #[must_use]
    pub fn sender_track_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .senders
            .iter()
            .map(|track| track.id.clone())
            .collect()
    }

    /// Forces the transport state and reports it like the engine would.
    pub fn inject_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
        self.emit(EngineEventKind::ConnectionState(state));
    }

    /// Sets the statistics returned by [`PeerConnection::stats`].
    pub fn set_stats(&self, stats: ConnectionStats) {
        self.inner.lock().stats = Ok(stats);
    }

    /// Makes [`PeerConnection::stats`] fail with `reason`.
    pub fn fail_stats(&self, reason: impl Into<String>) {
        self.inner.lock().stats = Err(reason.into());
    }

    fn emit(&self, kind: EngineEventKind<LoopbackChannel>) {
        self.network.deliver(&self.local_id, &self.remote_id, kind);
    }

    fn describe(&self, inner: &ConnInner, kind: SdpKind) -> SessionDescription {
        let tracks: Vec<&str> = inner.senders.iter().map(|t| t.id.as_str()).collect();
        let channels: Vec<&str> = inner.channels.iter().map(|c| c.label.as_str()).collect();
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\n{TRACKS_ATTR}{}\r\n{CHANNELS_ATTR}{}\r\n",
                self.local_id,
                tracks.join(","),
                channels.join(",")
            ),
        }
    }

    /// Links both ends once the offerer has applied the answer.
    fn link(&self) -> Result<(), RtcError> {
        let remote = self
            .network
            .connection(&self.remote_id, &self.local_id)
            .ok_or_else(|| RtcError::Engine(format!("no connection at {}", self.remote_id)))?;

        let pending: Vec<LoopbackChannel> = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connected {
                return Ok(());
            }
            inner.state = ConnectionState::Connected;
            inner
                .channels
                .iter()
                .filter(|channel| !channel.is_open())
                .cloned()
                .collect()
        };
        remote.lock().state = ConnectionState::Connected;

        self.emit(EngineEventKind::ConnectionState(ConnectionState::Connected));
        self.network.deliver(
            &self.remote_id,
            &self.local_id,
            EngineEventKind::ConnectionState(ConnectionState::Connected),
        );

        for channel in pending {
            let counterpart = LoopbackChannel {
                label: channel.label.clone(),
                owner: self.remote_id.clone(),
                remote: self.local_id.clone(),
                open: Arc::clone(&channel.open),
                network: self.network.clone(),
            };
            remote.lock().channels.push(counterpart.clone());
            self.network.deliver(
                &self.remote_id,
                &self.local_id,
                EngineEventKind::DataChannel(counterpart),
            );

            channel.open.store(true, Ordering::Release);
            self.emit(EngineEventKind::ChannelOpen {
                label: channel.label.clone(),
            });
            self.network.deliver(
                &self.remote_id,
                &self.local_id,
                EngineEventKind::ChannelOpen {
                    label: channel.label,
                },
            );
        }
        tracing::trace!(local = %self.local_id, remote = %self.remote_id, "loopback linked");
        Ok(())
    }
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .finish_non_exhaustive()
    }
}

impl PeerConnection for LoopbackConnection {
    type DataChannel = LoopbackChannel;
    type Track = LoopbackTrack;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        match inner.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                Ok(self.describe(&inner, SdpKind::Offer))
            }
            other => Err(RtcError::InvalidState(format!(
                "cannot create offer in {other:?}"
            ))),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(RtcError::InvalidState(format!(
                "cannot create answer in {:?}",
                inner.signaling
            )));
        }
        Ok(self.describe(&inner, SdpKind::Answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        let first_local = {
            let mut inner = self.inner.lock();
            inner.ensure_open()?;
            inner.signaling = match (description.kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (kind, state) => {
                    return Err(RtcError::InvalidState(format!(
                        "cannot apply local {kind:?} in {state:?}"
                    )));
                }
            };
            inner.local_description = Some(description);
            if inner.state == ConnectionState::New {
                inner.state = ConnectionState::Connecting;
            }
            !std::mem::replace(&mut inner.candidates_sent, true)
        };

        if first_local {
            self.emit(EngineEventKind::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2122260223 127.0.0.1 9 typ host ufrag {}",
                    self.local_id
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let (new_tracks, is_answer) = {
            let mut inner = self.inner.lock();
            inner.ensure_open()?;
            inner.signaling = match (description.kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, state) => {
                    return Err(RtcError::InvalidState(format!(
                        "cannot apply remote {kind:?} in {state:?}"
                    )));
                }
            };
            let new_tracks: Vec<String> = attribute(&description.sdp, TRACKS_ATTR)
                .filter(|id| inner.remote_tracks.insert((*id).to_string()))
                .map(str::to_string)
                .collect();
            let is_answer = description.kind == SdpKind::Answer;
            inner.remote_description = Some(description);
            (new_tracks, is_answer)
        };

        for track_id in new_tracks {
            self.emit(EngineEventKind::RemoteTrack { track_id });
        }
        if is_answer {
            self.link()?;
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().remote_description.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        if inner.remote_description.is_none() {
            return Err(RtcError::NoRemoteDescription);
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<LoopbackChannel, RtcError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let channel = LoopbackChannel {
            label: label.to_string(),
            owner: self.local_id.clone(),
            remote: self.remote_id.clone(),
            open: Arc::new(AtomicBool::new(false)),
            network: self.network.clone(),
        };
        inner.channels.push(channel.clone());
        Ok(channel)
    }

    async fn add_track(&self, track: LoopbackTrack) -> Result<(), RtcError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.senders.push(track);
        Ok(())
    }

    async fn replace_track(&self, track: LoopbackTrack) -> Result<(), RtcError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let sender = inner
            .senders
            .first_mut()
            .ok_or_else(|| RtcError::InvalidState("no sender to replace".to_string()))?;
        *sender = track;
        Ok(())
    }

    async fn sender_count(&self) -> usize {
        self.inner.lock().senders.len()
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    async fn stats(&self) -> Result<ConnectionStats, RtcError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        inner.stats.clone().map_err(RtcError::Engine)
    }

    async fn close(&self) -> Result<(), RtcError> {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return Ok(());
            }
            inner.state = ConnectionState::Closed;
            inner.signaling = SignalingState::Closed;
            for channel in &inner.channels {
                channel.open.store(false, Ordering::Release);
            }
        }
        self.network
            .inner
            .lock()
            .connections
            .remove(&(self.local_id.clone(), self.remote_id.clone()));

        if let Some(remote) = self.network.connection(&self.remote_id, &self.local_id) {
            let notify = {
                let mut remote = remote.lock();
                if remote.state.is_terminal() {
                    false
                } else {
                    remote.state = ConnectionState::Disconnected;
                    true
                }
            };
            if notify {
                self.network.deliver(
                    &self.remote_id,
                    &self.local_id,
                    EngineEventKind::ConnectionState(ConnectionState::Disconnected),
                );
            }
        }
        Ok(())
    }
}

/// One end of a loopback data channel. Both ends share the open flag.
#[derive(Clone)]
pub struct LoopbackChannel {
    label: String,
    owner: PeerId,
    remote: PeerId,
    open: Arc<AtomicBool>,
    network: LoopbackNetwork,
}

impl fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("label", &self.label)
            .field("owner", &self.owner)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), RtcError> {
        if !self.is_open() {
            return Err(RtcError::ChannelClosed(self.label.clone()));
        }
        let delivered = self.network.deliver(
            &self.remote,
            &self.owner,
            EngineEventKind::ChannelMessage {
                label: self.label.clone(),
                data,
            },
        );
        if delivered {
            Ok(())
        } else {
            Err(RtcError::ConnectionClosed)
        }
    }

    async fn close(&self) -> Result<(), RtcError> {
        if self.open.swap(false, Ordering::AcqRel) {
            for (to, about) in [(&self.owner, &self.remote), (&self.remote, &self.owner)] {
                self.network.deliver(
                    to,
                    about,
                    EngineEventKind::ChannelClosed {
                        label: self.label.clone(),
                    },
                );
            }
        }
        Ok(())
    }
}

/// Comma-separated values of an `a=...=` line.
fn attribute<'a>(sdp: &'a str, prefix: &str) -> impl Iterator<Item = &'a str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(prefix))
        .unwrap_or_default()
        .split(',')
        .filter(|value| !value.is_empty())
}
