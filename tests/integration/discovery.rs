//! Integration tests for the discovery client against an in-process relay.
//!
//! - peers learn each other's descriptors through heartbeats
//! - signaling frames reach only the addressed peer
//! - descriptor renames propagate
//! - fatal relay errors end the session with their close code
//! - unreachable relays fail fast

use std::sync::Arc;
use std::time::Duration;

use huddle::discovery::{DiscoveryClient, DiscoveryConfig, DiscoveryError, DiscoveryEvent};
use huddle_proto::peer::{PeerDescriptor, PeerId};
use huddle_proto::relay::{ErrorCode, close_code};
use huddle_proto::signaling::{IceCandidate, SignalingPayload};
use huddle_relay::config::RelayConfig;
use huddle_relay::relay::{RelayState, start_server_with_state};
use tokio::sync::mpsc::UnboundedReceiver;

const TIMEOUT: Duration = Duration::from_secs(5);
const CHANNEL: &str = "test-channel";

async fn start_relay(config: RelayConfig) -> String {
    let state = Arc::new(RelayState::new(&config));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start relay server");
    format!("http://{addr}")
}

fn fast_config() -> DiscoveryConfig {
    DiscoveryConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..DiscoveryConfig::default()
    }
}

async fn join(
    relay_url: &str,
    id: &str,
    name: &str,
) -> (DiscoveryClient, UnboundedReceiver<DiscoveryEvent>) {
    DiscoveryClient::connect(
        relay_url,
        CHANNEL,
        PeerDescriptor::new(PeerId::new(id), name),
        fast_config(),
    )
    .await
    .expect("discovery connect failed")
}

/// Waits for the first event matching `predicate`, skipping the rest.
async fn wait_for(
    events: &mut UnboundedReceiver<DiscoveryEvent>,
    mut predicate: impl FnMut(&DiscoveryEvent) -> bool,
) -> DiscoveryEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn contains_peer(event: &DiscoveryEvent, id: &str, name: &str) -> bool {
    matches!(event, DiscoveryEvent::PeersUpdated(peers)
        if peers.iter().any(|p| p.peer_id.as_str() == id && p.display_name == name))
}

#[tokio::test]
async fn peers_discover_each_other() {
    let relay = start_relay(RelayConfig::default()).await;
    let (alice, mut alice_events) = join(&relay, "alice", "Alice").await;

    let joined = wait_for(&mut alice_events, |e| {
        matches!(e, DiscoveryEvent::Joined { .. })
    })
    .await;
    assert_eq!(
        joined,
        DiscoveryEvent::Joined {
            channel: CHANNEL.to_string()
        }
    );

    let (bob, mut bob_events) = join(&relay, "bob", "Bob").await;

    wait_for(&mut alice_events, |e| contains_peer(e, "bob", "Bob")).await;
    wait_for(&mut bob_events, |e| contains_peer(e, "alice", "Alice")).await;

    assert_eq!(alice.peers().len(), 1);
    assert!(bob.peers().iter().all(|p| p.peer_id != bob.local_id()));
    assert!(alice.is_connected());
    assert_eq!(alice.relay_url(), relay.replace("http", "ws") + "/ws");

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn signaling_reaches_only_the_addressee() {
    let relay = start_relay(RelayConfig::default()).await;
    let (alice, mut alice_events) = join(&relay, "alice", "Alice").await;
    let (bob, mut bob_events) = join(&relay, "bob", "Bob").await;
    let (carol, mut carol_events) = join(&relay, "carol", "Carol").await;
    wait_for(&mut alice_events, |e| contains_peer(e, "bob", "Bob")).await;
    wait_for(&mut bob_events, |e| contains_peer(e, "alice", "Alice")).await;

    let payload = SignalingPayload::Ice {
        candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
    };
    alice
        .send_signaling(&PeerId::new("bob"), payload.clone())
        .await
        .unwrap();

    let received = wait_for(&mut bob_events, |e| {
        matches!(e, DiscoveryEvent::Signaling { .. })
    })
    .await;
    assert_eq!(
        received,
        DiscoveryEvent::Signaling {
            from: PeerId::new("alice"),
            payload,
        }
    );

    // Carol keeps receiving heartbeats but never the signaling frame.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, carol_events.recv()).await {
        assert!(
            !matches!(event, DiscoveryEvent::Signaling { .. }),
            "carol received a frame addressed to bob"
        );
    }

    for client in [alice, bob, carol] {
        client.disconnect().await;
    }
}

#[tokio::test]
async fn renamed_descriptor_propagates() {
    let relay = start_relay(RelayConfig::default()).await;
    let (alice, mut alice_events) = join(&relay, "alice", "Alice").await;
    let (bob, _bob_events) = join(&relay, "bob", "Bob").await;
    wait_for(&mut alice_events, |e| contains_peer(e, "bob", "Bob")).await;

    bob.update_descriptor("Robert");
    wait_for(&mut alice_events, |e| contains_peer(e, "bob", "Robert")).await;
    assert_eq!(alice.peers().len(), 1);

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn full_channel_ends_with_close_code() {
    let relay = start_relay(RelayConfig {
        max_peers_per_channel: Some(1),
        ..RelayConfig::default()
    })
    .await;
    let (alice, mut alice_events) = join(&relay, "alice", "Alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, DiscoveryEvent::Joined { .. })
    })
    .await;
    let (bob, mut bob_events) = join(&relay, "bob", "Bob").await;

    let error = wait_for(&mut bob_events, |e| {
        matches!(e, DiscoveryEvent::RelayError { .. })
    })
    .await;
    assert!(matches!(
        error,
        DiscoveryEvent::RelayError {
            code: ErrorCode::ChannelFull,
            ..
        }
    ));

    let disconnected = wait_for(&mut bob_events, |e| {
        matches!(e, DiscoveryEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        disconnected,
        DiscoveryEvent::Disconnected {
            close_code: Some(close_code::CHANNEL_FULL)
        }
    );
    assert!(!bob.is_connected());
    assert!(matches!(
        bob.send_signaling(
            &PeerId::new("alice"),
            SignalingPayload::Ice {
                candidate: IceCandidate::new("candidate:x"),
            }
        )
        .await,
        Err(DiscoveryError::Closed)
    ));

    alice.disconnect().await;
}

#[tokio::test]
async fn disconnect_reports_once() {
    let relay = start_relay(RelayConfig::default()).await;
    let (alice, mut alice_events) = join(&relay, "alice", "Alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, DiscoveryEvent::Joined { .. })
    })
    .await;

    alice.disconnect().await;
    wait_for(&mut alice_events, |e| {
        matches!(e, DiscoveryEvent::Disconnected { .. })
    })
    .await;
    alice.disconnect().await;

    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, DiscoveryEvent::Disconnected { .. }));
    }
}

#[tokio::test]
async fn unreachable_relay_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = DiscoveryClient::connect(
        &format!("http://{addr}"),
        CHANNEL,
        PeerDescriptor::new(PeerId::new("alice"), "Alice"),
        fast_config(),
    )
    .await;
    assert!(matches!(result, Err(DiscoveryError::Connect(_))));
}
