//! RTC engine backed by the `webrtc` crate.
//!
//! Each [`WebRtcConnection`] wraps an `RTCPeerConnection`. Its callbacks
//! (local candidates, state changes, inbound data channels, channel
//! open/close/message, remote tracks) are forwarded as [`EngineEvent`]s on
//! the channel returned by [`WebRtcEngine::new`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use huddle_proto::peer::PeerId;
use huddle_proto::signaling::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    ConnectionState, ConnectionStats, DataChannel, EngineEvent, EngineEventKind, PeerConnection,
    RtcEngine, RtcError, SignalingState, TrafficStats,
};

/// Event type produced by [`WebRtcEngine`].
pub type WebRtcEvent = EngineEvent<WebRtcChannel>;

type Events = mpsc::UnboundedSender<WebRtcEvent>;

/// Engine creating `webrtc` peer connections with a fixed ICE server list.
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<String>,
    events: Events,
}

impl WebRtcEngine {
    /// Builds the media engine and interceptors.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError::Engine`] if codec or interceptor registration fails.
    pub fn new(
        ice_servers: Vec<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WebRtcEvent>), RtcError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(engine_error)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let (events, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                api,
                ice_servers,
                events,
            },
            events_rx,
        ))
    }

    /// ICE server URLs handed to every connection.
    #[must_use]
    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    /// Creates an Opus audio track that can be shared with every peer.
    #[must_use]
    pub fn audio_track(track_id: &str, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            stream_id.to_owned(),
        ))
    }
}

impl fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("ice_servers", &self.ice_servers)
            .finish_non_exhaustive()
    }
}

impl RtcEngine for WebRtcEngine {
    type Connection = WebRtcConnection;

    async fn create_connection(&self, peer_id: &PeerId) -> Result<WebRtcConnection, RtcError> {
        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(engine_error)?,
        );

        let (events, peer) = (self.events.clone(), peer_id.clone());
        pc.on_ice_candidate(Box::new(move |candidate| {
            let (events, peer) = (events.clone(), peer.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &events,
                        &peer,
                        EngineEventKind::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                    ),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let (events, peer) = (self.events.clone(), peer_id.clone());
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let (events, peer) = (events.clone(), peer.clone());
            Box::pin(async move {
                if let Some(state) = map_connection_state(state) {
                    emit(&events, &peer, EngineEventKind::ConnectionState(state));
                }
            })
        }));

        let (events, peer) = (self.events.clone(), peer_id.clone());
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let (events, peer) = (events.clone(), peer.clone());
            Box::pin(async move {
                let channel = WebRtcChannel { inner: channel };
                emit(&events, &peer, EngineEventKind::DataChannel(channel.clone()));
                attach_channel(&channel, &events, &peer);
            })
        }));

        let (events, peer) = (self.events.clone(), peer_id.clone());
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let (events, peer) = (events.clone(), peer.clone());
            Box::pin(async move {
                emit(
                    &events,
                    &peer,
                    EngineEventKind::RemoteTrack {
                        track_id: track.id(),
                    },
                );
            })
        }));

        tracing::debug!(peer_id = %peer_id.short(), "peer connection created");
        Ok(WebRtcConnection {
            pc,
            peer_id: peer_id.clone(),
            events: self.events.clone(),
        })
    }
}

/// A `webrtc` peer connection.
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    peer_id: PeerId,
    events: Events,
}

impl fmt::Debug for WebRtcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcConnection")
            .field("peer_id", &self.peer_id)
            .field("state", &self.pc.connection_state())
            .finish_non_exhaustive()
    }
}

impl PeerConnection for WebRtcConnection {
    type DataChannel = WebRtcChannel;
    type Track = Arc<TrackLocalStaticSample>;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        if self.pc.remote_description().await.is_none() {
            return Err(RtcError::NoRemoteDescription);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
                ..Default::default()
            })
            .await
            .map_err(engine_error)
    }

    async fn create_data_channel(&self, label: &str) -> Result<WebRtcChannel, RtcError> {
        let inner = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(engine_error)?;
        let channel = WebRtcChannel { inner };
        attach_channel(&channel, &self.events, &self.peer_id);
        Ok(channel)
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<(), RtcError> {
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map(|_sender| ())
            .map_err(engine_error)
    }

    async fn replace_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<(), RtcError> {
        let senders = self.pc.get_senders().await;
        let sender = senders
            .first()
            .ok_or_else(|| RtcError::InvalidState("no sender to replace".to_string()))?;
        sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(engine_error)
    }

    async fn sender_count(&self) -> usize {
        self.pc.get_senders().await.len()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn stats(&self) -> Result<ConnectionStats, RtcError> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Err(RtcError::ConnectionClosed);
        }
        let report = self.pc.get_stats().await;

        let mut stats = ConnectionStats::default();
        let mut pair_rtt = None;
        let mut pair_traffic: Option<TrafficStats> = None;
        let mut transport_traffic = TrafficStats::default();
        for entry in report.reports.values() {
            match entry {
                StatsReportType::RemoteInboundRTP(remote) => {
                    if let Some(rtt) = remote.round_trip_time.filter(|rtt| *rtt > 0.0) {
                        stats.rtt_ms = Some(rtt * 1000.0);
                    }
                    stats.packets_lost += u64::try_from(remote.packets_lost).unwrap_or(0);
                    stats.packets_received += remote.packets_received;
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if pair.current_round_trip_time > 0.0 {
                        pair_rtt = Some(pair.current_round_trip_time * 1000.0);
                    }
                    *pair_traffic.get_or_insert_with(TrafficStats::default) += TrafficStats {
                        bytes_sent: count(pair.bytes_sent),
                        bytes_received: count(pair.bytes_received),
                        packets_sent: count(pair.packets_sent),
                        packets_received: count(pair.packets_received),
                    };
                }
                StatsReportType::Transport(transport) => {
                    transport_traffic += TrafficStats {
                        bytes_sent: count(transport.bytes_sent),
                        bytes_received: count(transport.bytes_received),
                        packets_sent: count(transport.packets_sent),
                        packets_received: count(transport.packets_received),
                    };
                }
                _ => {}
            }
        }
        stats.rtt_ms = stats.rtt_ms.or(pair_rtt);
        // Transport totals only until a nominated pair is reported.
        stats.traffic = pair_traffic.unwrap_or(transport_traffic);
        Ok(stats)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(engine_error)
    }
}

/// A `webrtc` data channel.
#[derive(Clone)]
pub struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
}

impl fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.inner.label())
            .field("state", &self.inner.ready_state())
            .finish()
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), RtcError> {
        if !self.is_open() {
            return Err(RtcError::ChannelClosed(self.label().to_string()));
        }
        self.inner
            .send(&Bytes::from(data))
            .await
            .map(|_written| ())
            .map_err(engine_error)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.inner.close().await.map_err(engine_error)
    }
}

/// Forwards open, close and message callbacks of `channel`.
fn attach_channel(channel: &WebRtcChannel, events: &Events, peer: &PeerId) {
    let label = channel.label().to_string();

    let (tx, who, name) = (events.clone(), peer.clone(), label.clone());
    channel.inner.on_open(Box::new(move || {
        Box::pin(async move {
            emit(&tx, &who, EngineEventKind::ChannelOpen { label: name });
        })
    }));

    let (tx, who, name) = (events.clone(), peer.clone(), label.clone());
    channel.inner.on_close(Box::new(move || {
        let (tx, who, name) = (tx.clone(), who.clone(), name.clone());
        Box::pin(async move {
            emit(&tx, &who, EngineEventKind::ChannelClosed { label: name });
        })
    }));

    let (tx, who, name) = (events.clone(), peer.clone(), label.clone());
    channel
        .inner
        .on_message(Box::new(move |message: DataChannelMessage| {
            let (tx, who, name) = (tx.clone(), who.clone(), name.clone());
            Box::pin(async move {
                emit(
                    &tx,
                    &who,
                    EngineEventKind::ChannelMessage {
                        label: name,
                        data: message.data.to_vec(),
                    },
                );
            })
        }));

    // The channel may have opened before the handler was installed.
    if channel.is_open() {
        emit(events, peer, EngineEventKind::ChannelOpen { label });
    }
}

fn emit(events: &Events, peer: &PeerId, kind: EngineEventKind<WebRtcChannel>) {
    let _ = events.send(EngineEvent {
        peer_id: peer.clone(),
        kind,
    });
}

const fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let SessionDescription { kind, sdp } = description;
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpKind::Rollback => {
            return Err(RtcError::InvalidState(
                "rollback descriptions are not supported".to_string(),
            ));
        }
    }
    .map_err(engine_error)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::Engine("description has no type".to_string()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

/// Widens a stats counter, whatever integer type the report uses.
fn count(value: impl TryInto<u64>) -> u64 {
    value.try_into().unwrap_or(0)
}

#[allow(clippy::needless_pass_by_value)]
fn engine_error(e: webrtc::Error) -> RtcError {
    RtcError::Engine(e.to_string())
}
