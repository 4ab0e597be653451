//! Integration tests for the rendezvous relay wire protocol.
//!
//! Runs the relay in-process on an ephemeral port and drives it with real
//! WebSocket clients:
//! - join handshake and fan-out to channel members
//! - fatal rejections with their close codes, including a missing join
//! - non-fatal message throttling and size limits
//! - membership cleanup on disconnect
//! - health check and 404 fallback

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_proto::relay::{self, ErrorCode, RelayFrame};
use huddle_relay::config::RelayConfig;
use huddle_relay::relay::{RelayState, start_server_with_state};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a relay with `config` and return its address and shared state.
async fn start_relay(config: RelayConfig) -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::new(&config));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    (addr, state)
}

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

async fn send_frame(ws: &mut Ws, frame: &RelayFrame) {
    let json = relay::encode(frame).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

/// Next text frame decoded as a relay frame.
async fn next_frame(ws: &mut Ws) -> RelayFrame {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("recv timed out")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return relay::decode(text.as_str().as_bytes()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Close code the server ends the connection with.
async fn close_code(ws: &mut Ws) -> u16 {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("recv timed out")
            .expect("stream ended without close frame")
            .unwrap();
        if let Message::Close(Some(frame)) = msg {
            return u16::from(frame.code);
        }
    }
}

async fn join(addr: std::net::SocketAddr, channel: &str) -> Ws {
    let mut ws = connect(addr).await;
    send_frame(
        &mut ws,
        &RelayFrame::Join {
            channel: channel.to_string(),
        },
    )
    .await;
    assert_eq!(
        next_frame(&mut ws).await,
        RelayFrame::Joined {
            channel: channel.to_string()
        }
    );
    ws
}

async fn wait_for_members(state: &RelayState, channel: &str, expected: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while state.channels.member_count(channel) != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("membership did not settle");
}

#[tokio::test]
async fn join_is_acknowledged_and_frames_fan_out_verbatim() {
    let (addr, _state) = start_relay(RelayConfig::default()).await;
    let mut alice = join(addr, "ch1").await;
    let mut bob = join(addr, "ch1").await;

    let raw = r#"{"type":"descriptor","descriptor":{"peerId":"alice","displayName":"Alice"}}"#;
    alice.send(Message::Text(raw.into())).await.unwrap();

    for ws in [&mut bob, &mut alice] {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text(raw.into()));
    }
}

#[tokio::test]
async fn binary_frames_stay_binary() {
    let (addr, _state) = start_relay(RelayConfig::default()).await;
    let mut alice = join(addr, "ch1").await;
    let mut bob = join(addr, "ch1").await;

    alice
        .send(Message::Binary(vec![1, 2, 3].into()))
        .await
        .unwrap();
    let msg = tokio::time::timeout(TIMEOUT, bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Binary(vec![1, 2, 3].into()));
}

#[tokio::test]
async fn channels_are_isolated() {
    let (addr, _state) = start_relay(RelayConfig {
        echo_to_sender: false,
        ..RelayConfig::default()
    })
    .await;
    let mut alice = join(addr, "ch1").await;
    let mut carol = join(addr, "ch2").await;
    let mut bob = join(addr, "ch1").await;

    alice.send(Message::Text("hi".into())).await.unwrap();
    let msg = tokio::time::timeout(TIMEOUT, bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Text("hi".into()));

    assert!(
        tokio::time::timeout(Duration::from_millis(200), carol.next())
            .await
            .is_err()
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(200), alice.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn invalid_first_frame_closes_with_4000() {
    let (addr, _state) = start_relay(RelayConfig::default()).await;
    let mut ws = connect(addr).await;
    ws.send(Message::Text(r#"{"type":"join","channel":""}"#.into()))
        .await
        .unwrap();

    match next_frame(&mut ws).await {
        RelayFrame::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidJoin),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(close_code(&mut ws).await, 4000);
}

#[tokio::test]
async fn garbage_first_frame_closes_with_4000() {
    let (addr, _state) = start_relay(RelayConfig::default()).await;
    let mut ws = connect(addr).await;
    ws.send(Message::Text("hello".into())).await.unwrap();
    assert!(matches!(
        next_frame(&mut ws).await,
        RelayFrame::Error {
            code: ErrorCode::InvalidJoin,
            ..
        }
    ));
    assert_eq!(close_code(&mut ws).await, 4000);
}

#[tokio::test]
async fn silent_connection_is_closed_with_4000() {
    let (addr, state) = start_relay(RelayConfig {
        join_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;
    let mut ws = connect(addr).await;

    assert!(matches!(
        next_frame(&mut ws).await,
        RelayFrame::Error {
            code: ErrorCode::InvalidJoin,
            ..
        }
    ));
    assert_eq!(close_code(&mut ws).await, 4000);
    assert_eq!(state.channels.channel_count(), 0);
}

#[tokio::test]
async fn full_channel_closes_with_4002() {
    let (addr, state) = start_relay(RelayConfig {
        max_peers_per_channel: Some(2),
        ..RelayConfig::default()
    })
    .await;
    let _a = join(addr, "ch1").await;
    let _b = join(addr, "ch1").await;

    let mut c = connect(addr).await;
    send_frame(
        &mut c,
        &RelayFrame::Join {
            channel: "ch1".to_string(),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut c).await,
        RelayFrame::Error {
            code: ErrorCode::ChannelFull,
            ..
        }
    ));
    assert_eq!(close_code(&mut c).await, 4002);
    assert_eq!(state.channels.member_count("ch1"), 2);

    // A different channel is unaffected.
    let _d = join(addr, "ch2").await;
}

#[tokio::test]
async fn connection_rate_limit_closes_with_4001() {
    let (addr, _state) = start_relay(RelayConfig {
        connection_limit_per_minute: Some(1),
        ..RelayConfig::default()
    })
    .await;
    let _first = join(addr, "ch1").await;

    let mut second = connect(addr).await;
    assert!(matches!(
        next_frame(&mut second).await,
        RelayFrame::Error {
            code: ErrorCode::RateLimitConnection,
            ..
        }
    ));
    assert_eq!(close_code(&mut second).await, 4001);
}

#[tokio::test]
async fn message_rate_limit_drops_frame_but_keeps_connection() {
    let (addr, _state) = start_relay(RelayConfig {
        message_limit_per_second: Some(1),
        echo_to_sender: false,
        ..RelayConfig::default()
    })
    .await;
    let mut alice = join(addr, "ch1").await;
    let mut bob = join(addr, "ch1").await;

    alice.send(Message::Text("one".into())).await.unwrap();
    alice.send(Message::Text("two".into())).await.unwrap();

    let msg = tokio::time::timeout(TIMEOUT, bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Text("one".into()));

    assert!(matches!(
        next_frame(&mut alice).await,
        RelayFrame::Error {
            code: ErrorCode::RateLimitMessage,
            ..
        }
    ));

    // Connection survives into the next window.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    alice.send(Message::Text("three".into())).await.unwrap();
    let msg = tokio::time::timeout(TIMEOUT, bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Text("three".into()));
}

#[tokio::test]
async fn oversize_frame_is_dropped_with_error() {
    let (addr, _state) = start_relay(RelayConfig {
        max_frame_size: 16,
        echo_to_sender: false,
        ..RelayConfig::default()
    })
    .await;
    let mut alice = join(addr, "ch1").await;
    let mut bob = join(addr, "ch1").await;

    alice
        .send(Message::Binary(vec![0u8; 64].into()))
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut alice).await,
        RelayFrame::Error {
            code: ErrorCode::FrameTooLarge,
            ..
        }
    ));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), bob.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn disconnect_removes_membership_and_empty_channel() {
    let (addr, state) = start_relay(RelayConfig::default()).await;
    let mut alice = join(addr, "ch1").await;
    let bob = join(addr, "ch1").await;
    wait_for_members(&state, "ch1", 2).await;

    drop(bob);
    wait_for_members(&state, "ch1", 1).await;

    alice.close(None).await.unwrap();
    wait_for_members(&state, "ch1", 0).await;
    assert_eq!(state.channels.channel_count(), 0);
}

/// Issue a bare HTTP/1.1 GET and return the full response text.
async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (addr, _state) = start_relay(RelayConfig::default()).await;
    let response = http_get(addr, "/healthz").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains(r#"{"status":"ok"}"#), "got: {response}");
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (addr, _state) = start_relay(RelayConfig::default()).await;
    let response = http_get(addr, "/nope").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert!(response.ends_with("Not Found"), "got: {response}");
}
