//! End-to-end tests: sessions discovering each other through a real relay,
//! negotiating over the loopback engine, and exchanging encrypted chat.

use std::sync::Arc;
use std::time::Duration;

use huddle::mesh::loopback::LoopbackNetwork;
use huddle::mesh::loopback::LoopbackTrack;
use huddle::session::{self, SessionConfig, SessionEvent, SessionHandle};
use huddle_proto::invite::Invite;
use huddle_proto::peer::PeerId;
use huddle_relay::config::RelayConfig;
use huddle_relay::relay::{RelayState, start_server_with_state};
use tokio::sync::mpsc::Receiver;

const TIMEOUT: Duration = Duration::from_secs(5);

type Handle = SessionHandle<LoopbackTrack>;

async fn start_relay() -> String {
    let state = Arc::new(RelayState::new(&RelayConfig::default()));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start relay server");
    format!("http://{addr}")
}

async fn start_peer(
    network: &LoopbackNetwork,
    invite: &Invite,
    id: &str,
    name: &str,
) -> (Handle, Receiver<SessionEvent>) {
    start_peer_with(network, invite, id, name, |_| {}).await
}

async fn start_peer_with(
    network: &LoopbackNetwork,
    invite: &Invite,
    id: &str,
    name: &str,
    configure: impl FnOnce(&mut SessionConfig),
) -> (Handle, Receiver<SessionEvent>) {
    let local_id = PeerId::new(id);
    let (engine, engine_events) = network.engine(local_id.clone());
    let relay_url = invite.bootstrap_url.clone().expect("invite has a relay");
    let mut config = SessionConfig::new(relay_url, name);
    config.discovery.heartbeat_interval = Duration::from_millis(100);
    config.stats_interval = Duration::from_secs(3600);
    configure(&mut config);
    session::start(local_id, invite, config, engine, engine_events)
        .await
        .expect("session start failed")
}

/// Waits for the first event matching `predicate`, skipping the rest.
async fn wait_for(
    events: &mut Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("session events ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Fails if an event matching `predicate` shows up within `window`.
async fn assert_quiet(
    events: &mut Receiver<SessionEvent>,
    window: Duration,
    predicate: impl Fn(&SessionEvent) -> bool,
) {
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        assert!(!predicate(&event), "unexpected event {event:?}");
    }
}

fn connected_to(event: &SessionEvent, peer: &str) -> bool {
    matches!(event, SessionEvent::PeerConnected { peer_id, .. } if peer_id.as_str() == peer)
}

fn disconnected_from(event: &SessionEvent, peer: &str) -> bool {
    matches!(event, SessionEvent::PeerDisconnected { peer_id } if peer_id.as_str() == peer)
}

/// Checks one received chat against the sending session.
fn assert_chat_from(event: &SessionEvent, sender: &Handle, name: &str, expected: &str) {
    let SessionEvent::ChatReceived {
        from,
        display_name,
        text,
        signature_valid,
        sender_fingerprint,
        sender_public_key,
        ..
    } = event
    else {
        panic!("expected a chat, got {event:?}");
    };
    assert_eq!(from, sender.local_id());
    assert_eq!(display_name.as_deref(), Some(name));
    assert_eq!(text, expected);
    assert!(*signature_valid);
    assert_eq!(sender_public_key, sender.public_key());
    assert_eq!(sender_fingerprint, sender.fingerprint());
}

#[tokio::test]
async fn two_peers_chat_through_the_mesh() {
    let relay = start_relay().await;
    let invite = Invite::generate(Some(relay));
    let network = LoopbackNetwork::new();

    let (alice, mut alice_events) = start_peer(&network, &invite, "alice", "Alice").await;
    let (bob, mut bob_events) = start_peer(&network, &invite, "bob", "Bob").await;
    assert_eq!(alice.channel(), invite.discovery_key());

    let connected = wait_for(&mut alice_events, |e| connected_to(e, "bob")).await;
    assert_eq!(
        connected,
        SessionEvent::PeerConnected {
            peer_id: PeerId::new("bob"),
            display_name: Some("Bob".to_string()),
        }
    );
    wait_for(&mut bob_events, |e| connected_to(e, "alice")).await;

    alice.send_chat("hello bob").await.unwrap();
    let echo = wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::ChatSent { .. })
    })
    .await;
    let SessionEvent::ChatSent {
        id: echo_id,
        text,
        delivered,
        ..
    } = echo
    else {
        unreachable!()
    };
    assert_eq!(text, "hello bob");
    assert_eq!(delivered, 1);

    let received = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::ChatReceived { .. })
    })
    .await;
    assert_chat_from(&received, &alice, "Alice", "hello bob");

    bob.send_chat("hi alice").await.unwrap();
    let reply = wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::ChatReceived { .. })
    })
    .await;
    assert_chat_from(&reply, &bob, "Bob", "hi alice");
    assert_ne!(alice.public_key(), bob.public_key());

    let (
        SessionEvent::ChatReceived {
            id: first_id,
            timestamp: first_at,
            ..
        },
        SessionEvent::ChatReceived {
            id: reply_id,
            timestamp: reply_at,
            ..
        },
    ) = (&received, &reply)
    else {
        unreachable!()
    };
    assert_ne!(first_id, reply_id);
    assert_ne!(*first_id, echo_id);
    assert!(first_at <= reply_at);

    bob.shutdown().await;
    wait_for(&mut alice_events, |e| disconnected_from(e, "bob")).await;
    alice.shutdown().await;
}

#[tokio::test]
async fn capped_peer_connects_once_a_slot_frees() {
    let relay = start_relay().await;
    let invite = Invite::generate(Some(relay));
    let network = LoopbackNetwork::new();

    let (carol, mut carol_events) = start_peer_with(&network, &invite, "carol", "Carol", |c| {
        c.max_connections = 1;
    })
    .await;
    let (alice, mut alice_events) = start_peer(&network, &invite, "alice", "Alice").await;
    wait_for(&mut carol_events, |e| connected_to(e, "alice")).await;
    wait_for(&mut alice_events, |e| connected_to(e, "carol")).await;

    let (bob, mut bob_events) = start_peer(&network, &invite, "bob", "Bob").await;
    wait_for(&mut bob_events, |e| connected_to(e, "alice")).await;
    wait_for(&mut carol_events, |e| {
        assert!(!connected_to(e, "bob"), "carol linked past her cap");
        matches!(e, SessionEvent::PeerDiscovered(peer) if peer.peer_id.as_str() == "bob")
    })
    .await;
    assert_quiet(&mut carol_events, Duration::from_millis(300), |e| {
        connected_to(e, "bob")
    })
    .await;

    alice.shutdown().await;
    wait_for(&mut carol_events, |e| {
        assert!(!connected_to(e, "bob"), "carol linked before a slot freed");
        disconnected_from(e, "alice")
    })
    .await;
    wait_for(&mut carol_events, |e| connected_to(e, "bob")).await;
    wait_for(&mut bob_events, |e| connected_to(e, "carol")).await;

    carol.send_chat("room for one").await.unwrap();
    let received = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::ChatReceived { .. })
    })
    .await;
    assert_chat_from(&received, &carol, "Carol", "room for one");

    carol.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn wrong_group_key_is_a_decode_fault() {
    let relay = start_relay().await;
    let invite = Invite::generate(Some(relay));
    let forged = Invite {
        group_key: [7u8; 32],
        ..invite.clone()
    };
    let network = LoopbackNetwork::new();

    let (alice, _alice_events) = start_peer(&network, &invite, "alice", "Alice").await;
    let (mallory, mut mallory_events) = start_peer(&network, &forged, "mallory", "Mallory").await;
    wait_for(&mut mallory_events, |e| connected_to(e, "alice")).await;

    alice.send_chat("members only").await.unwrap();
    let fault = wait_for(&mut mallory_events, |e| {
        matches!(e, SessionEvent::DecodeFault { .. } | SessionEvent::ChatReceived { .. })
    })
    .await;
    assert!(
        matches!(&fault, SessionEvent::DecodeFault { from, .. } if from.as_str() == "alice"),
        "expected decode fault, got {fault:?}"
    );

    alice.shutdown().await;
    mallory.shutdown().await;
}

#[tokio::test]
async fn shared_media_reaches_peers() {
    let relay = start_relay().await;
    let invite = Invite::generate(Some(relay));
    let network = LoopbackNetwork::new();

    let (alice, mut alice_events) = start_peer(&network, &invite, "alice", "Alice").await;
    let (bob, mut bob_events) = start_peer(&network, &invite, "bob", "Bob").await;
    wait_for(&mut alice_events, |e| connected_to(e, "bob")).await;
    wait_for(&mut bob_events, |e| connected_to(e, "alice")).await;

    alice
        .set_local_stream(vec![LoopbackTrack::new("alice-mic")])
        .await
        .unwrap();
    let track = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::RemoteTrack { .. })
    })
    .await;
    assert_eq!(
        track,
        SessionEvent::RemoteTrack {
            peer_id: PeerId::new("alice"),
            track_id: "alice-mic".to_string(),
        }
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn shutdown_ends_with_closed() {
    let relay = start_relay().await;
    let invite = Invite::generate(Some(relay));
    let network = LoopbackNetwork::new();

    let (alice, mut alice_events) = start_peer(&network, &invite, "alice", "Alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::Joined { .. })
    })
    .await;

    alice.shutdown().await;
    let mut last = None;
    while let Ok(Some(event)) = tokio::time::timeout(TIMEOUT, alice_events.recv()).await {
        last = Some(event);
    }
    assert_eq!(last, Some(SessionEvent::Closed));
}
