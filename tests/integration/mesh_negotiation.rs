//! Integration tests for mesh negotiation over the loopback engine.
//!
//! Signaling is relayed by hand between managers, so every exchange is
//! deterministic:
//! - only the smaller id offers, so simultaneous discovery yields one link
//! - candidates that arrive early are applied in order after the offer
//! - media changes renegotiate or swap tracks in place
//! - transport failure tears both sides down
//! - a capped manager parks offers until a slot frees up

use huddle::mesh::loopback::{LoopbackEngine, LoopbackEvent, LoopbackNetwork, LoopbackTrack};
use huddle::mesh::{
    ConnectionState, ConnectionStats, MeshEvent, MeshManager, PeerState, TrafficStats,
};
use huddle_proto::peer::PeerId;
use huddle_proto::signaling::{IceCandidate, SignalingPayload};
use tokio::sync::mpsc::UnboundedReceiver;

struct Node {
    mesh: MeshManager<LoopbackEngine>,
    mesh_events: UnboundedReceiver<MeshEvent>,
    engine_events: UnboundedReceiver<LoopbackEvent>,
    log: Vec<MeshEvent>,
}

impl Node {
    fn new(network: &LoopbackNetwork, id: &str) -> Self {
        Self::capped(network, id, usize::MAX)
    }

    fn capped(network: &LoopbackNetwork, id: &str, max_peers: usize) -> Self {
        let (engine, engine_events) = network.engine(PeerId::new(id));
        let (mesh, mesh_events) = MeshManager::new(PeerId::new(id), engine);
        Self {
            mesh: mesh.with_max_peers(max_peers),
            mesh_events,
            engine_events,
            log: Vec::new(),
        }
    }

    fn joined(&self) -> Vec<PeerId> {
        self.log
            .iter()
            .filter_map(|e| match e {
                MeshEvent::PeerJoined { peer_id } => Some(peer_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn left(&self) -> Vec<PeerId> {
        self.log
            .iter()
            .filter_map(|e| match e {
                MeshEvent::PeerLeft { peer_id } => Some(peer_id.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Moves engine events, mesh events and signaling until nothing is left.
///
/// Returns the number of signaling frames relayed.
async fn pump(nodes: &mut [Node]) -> usize {
    let mut relayed = 0;
    loop {
        let mut outgoing = Vec::new();
        for node in nodes.iter_mut() {
            while let Ok(event) = node.engine_events.try_recv() {
                node.mesh.handle_engine_event(event).await;
            }
            while let Ok(event) = node.mesh_events.try_recv() {
                match event {
                    MeshEvent::Signal { to, payload } => {
                        outgoing.push((node.mesh.local_id().clone(), to, payload));
                    }
                    other => node.log.push(other),
                }
            }
        }

        let idle = outgoing.is_empty()
            && nodes
                .iter()
                .all(|n| n.engine_events.is_empty() && n.mesh_events.is_empty());
        if idle {
            return relayed;
        }

        for (from, to, payload) in outgoing {
            relayed += 1;
            if let Some(node) = nodes.iter_mut().find(|n| *n.mesh.local_id() == to) {
                node.mesh.handle_signaling(&from, payload).await.unwrap();
            }
        }
    }
}

fn id(s: &str) -> PeerId {
    PeerId::new(s)
}

async fn connected_pair(network: &LoopbackNetwork) -> [Node; 2] {
    let mut nodes = [Node::new(network, "a"), Node::new(network, "b")];
    nodes[0].mesh.add_peer(&id("b")).await.unwrap();
    nodes[1].mesh.add_peer(&id("a")).await.unwrap();
    pump(&mut nodes).await;
    nodes
}

#[tokio::test]
async fn simultaneous_discovery_makes_one_link() {
    let network = LoopbackNetwork::new();
    let nodes = connected_pair(&network).await;

    assert!(nodes[0].mesh.is_offerer(&id("b")));
    assert!(!nodes[1].mesh.is_offerer(&id("a")));
    assert_eq!(network.connection_count(), 2);

    assert_eq!(nodes[0].joined(), vec![id("b")]);
    assert_eq!(nodes[1].joined(), vec![id("a")]);
    assert_eq!(nodes[0].mesh.state(&id("b")), Some(PeerState::Connected));
    assert_eq!(nodes[1].mesh.state(&id("a")), Some(PeerState::Connected));
}

#[tokio::test]
async fn answerer_learns_of_offerer_from_offer() {
    let network = LoopbackNetwork::new();
    let mut nodes = [Node::new(&network, "a"), Node::new(&network, "b")];
    nodes[0].mesh.add_peer(&id("b")).await.unwrap();
    pump(&mut nodes).await;

    assert_eq!(nodes[1].mesh.peer_ids(), vec![id("a")]);
    assert_eq!(nodes[1].joined(), vec![id("a")]);
}

#[tokio::test]
async fn messages_flow_both_ways() {
    let network = LoopbackNetwork::new();
    let mut nodes = connected_pair(&network).await;

    nodes[0].mesh.send(&id("b"), b"hello".to_vec()).await.unwrap();
    assert_eq!(nodes[1].mesh.broadcast(b"hi back").await, 1);
    pump(&mut nodes).await;

    assert!(nodes[1].log.contains(&MeshEvent::Message {
        peer_id: id("a"),
        data: b"hello".to_vec(),
    }));
    assert!(nodes[0].log.contains(&MeshEvent::Message {
        peer_id: id("b"),
        data: b"hi back".to_vec(),
    }));
}

#[tokio::test]
async fn early_candidates_apply_in_arrival_order() {
    let network = LoopbackNetwork::new();
    let mut nodes = [Node::new(&network, "a"), Node::new(&network, "b")];
    nodes[1].mesh.add_peer(&id("a")).await.unwrap();

    let early: Vec<IceCandidate> = (0..2)
        .map(|n| IceCandidate::new(format!("candidate:early-{n}")))
        .collect();
    for candidate in &early {
        nodes[1]
            .mesh
            .handle_signaling(
                &id("a"),
                SignalingPayload::Ice {
                    candidate: candidate.clone(),
                },
            )
            .await
            .unwrap();
    }
    assert_eq!(nodes[1].mesh.pending_candidates(&id("a")), 2);

    nodes[0].mesh.add_peer(&id("b")).await.unwrap();
    pump(&mut nodes).await;

    assert_eq!(nodes[1].mesh.pending_candidates(&id("a")), 0);
    let applied = nodes[1]
        .mesh
        .connection(&id("a"))
        .unwrap()
        .applied_candidates();
    assert_eq!(applied.len(), 3);
    assert_eq!(applied[..2], early[..]);
    assert!(applied[2].candidate.contains("typ host"));
}

#[tokio::test]
async fn adding_media_renegotiates_then_swaps_in_place() {
    let network = LoopbackNetwork::new();
    let mut nodes = connected_pair(&network).await;

    nodes[0]
        .mesh
        .set_local_stream(vec![LoopbackTrack::new("mic")])
        .await;
    let relayed = pump(&mut nodes).await;
    assert_eq!(relayed, 2, "expected one offer and one answer");
    assert!(nodes[1].log.contains(&MeshEvent::RemoteTrack {
        peer_id: id("a"),
        track_id: "mic".to_string(),
    }));

    nodes[0]
        .mesh
        .set_local_stream(vec![LoopbackTrack::new("cam")])
        .await;
    assert_eq!(pump(&mut nodes).await, 0);
    assert_eq!(
        nodes[0]
            .mesh
            .connection(&id("b"))
            .unwrap()
            .sender_track_ids(),
        vec!["cam".to_string()]
    );
    assert_eq!(nodes[0].mesh.state(&id("b")), Some(PeerState::Connected));
}

#[tokio::test]
async fn failed_transport_tears_down_both_sides() {
    let network = LoopbackNetwork::new();
    let mut nodes = connected_pair(&network).await;

    nodes[0]
        .mesh
        .connection(&id("b"))
        .unwrap()
        .inject_state(ConnectionState::Failed);
    pump(&mut nodes).await;

    assert_eq!(nodes[0].left(), vec![id("b")]);
    assert_eq!(nodes[1].left(), vec![id("a")]);
    assert!(nodes[0].mesh.peer_ids().is_empty());
    assert!(nodes[1].mesh.peer_ids().is_empty());
    assert_eq!(network.connection_count(), 0);
}

#[tokio::test]
async fn rediscovered_peer_reconnects() {
    let network = LoopbackNetwork::new();
    let mut nodes = connected_pair(&network).await;

    assert!(nodes[0].mesh.remove_peer(&id("b")).await);
    pump(&mut nodes).await;
    assert!(nodes[1].mesh.peer_ids().is_empty());

    nodes[0].mesh.add_peer(&id("b")).await.unwrap();
    pump(&mut nodes).await;
    assert_eq!(nodes[1].joined(), vec![id("a"), id("a")]);
    assert_eq!(nodes[0].mesh.state(&id("b")), Some(PeerState::Connected));
}

#[tokio::test]
async fn three_peers_form_a_full_mesh() {
    let network = LoopbackNetwork::new();
    let mut nodes = [
        Node::new(&network, "a"),
        Node::new(&network, "b"),
        Node::new(&network, "c"),
    ];
    for (i, local) in ["a", "b", "c"].iter().enumerate() {
        for remote in ["a", "b", "c"] {
            if remote != *local {
                nodes[i].mesh.add_peer(&id(remote)).await.unwrap();
            }
        }
    }
    pump(&mut nodes).await;

    for node in &nodes {
        assert_eq!(node.joined().len(), 2);
    }
    assert_eq!(network.connection_count(), 6);
    assert_eq!(nodes[2].mesh.broadcast(b"to all").await, 2);
    pump(&mut nodes).await;
    for node in &nodes[..2] {
        assert!(node.log.contains(&MeshEvent::Message {
            peer_id: id("c"),
            data: b"to all".to_vec(),
        }));
    }
}

#[tokio::test]
async fn stats_report_best_ping() {
    let network = LoopbackNetwork::new();
    let nodes = connected_pair(&network).await;
    nodes[0]
        .mesh
        .connection(&id("b"))
        .unwrap()
        .set_stats(ConnectionStats {
            rtt_ms: Some(12.4),
            packets_lost: 5,
            packets_received: 95,
            traffic: TrafficStats {
                bytes_sent: 48_000,
                bytes_received: 36_500,
                packets_sent: 410,
                packets_received: 388,
            },
        });

    let stats = nodes[0].mesh.collect_stats().await;
    assert_eq!(stats.ping_ms, Some(12));
    assert_eq!(stats.peers.len(), 1);
    assert_eq!(stats.peers[0].1.loss_percent, Some(5.0));
    assert_eq!(stats.peers[0].1.traffic.bytes_sent, 48_000);
    assert_eq!(stats.peers[0].1.traffic.packets_received, 388);
    assert_eq!(stats.total_traffic(), stats.peers[0].1.traffic);

    // The answerer's side reports no round trip or traffic yet.
    let stats = nodes[1].mesh.collect_stats().await;
    assert_eq!(stats.ping_ms, None);
    assert_eq!(stats.total_traffic(), TrafficStats::default());
}

#[tokio::test]
async fn capped_peer_answers_parked_offer_after_a_slot_frees() {
    let network = LoopbackNetwork::new();
    let mut nodes = [
        Node::new(&network, "a"),
        Node::new(&network, "b"),
        Node::capped(&network, "c", 1),
    ];
    nodes[0].mesh.add_peer(&id("c")).await.unwrap();
    pump(&mut nodes).await;
    assert_eq!(nodes[2].joined(), vec![id("a")]);

    // "b" offers while "c" is full: the offer and its candidate wait.
    nodes[1].mesh.add_peer(&id("c")).await.unwrap();
    pump(&mut nodes).await;
    assert!(nodes[2].mesh.has_parked_offer(&id("b")));
    assert_eq!(nodes[2].mesh.peer_ids(), vec![id("a")]);
    assert_eq!(nodes[1].mesh.state(&id("c")), Some(PeerState::Negotiating));

    assert!(nodes[0].mesh.remove_peer(&id("c")).await);
    pump(&mut nodes).await;
    assert_eq!(nodes[2].left(), vec![id("a")]);

    nodes[2].mesh.add_peer(&id("b")).await.unwrap();
    pump(&mut nodes).await;
    assert_eq!(nodes[2].joined(), vec![id("a"), id("b")]);
    assert_eq!(nodes[1].joined(), vec![id("c")]);
    assert_eq!(nodes[1].mesh.state(&id("c")), Some(PeerState::Connected));
    let applied = nodes[2]
        .mesh
        .connection(&id("b"))
        .unwrap()
        .applied_candidates();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].candidate.ends_with("ufrag b"));
}
