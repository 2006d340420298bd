//! Inbound protocol path over a real socket: datagram → decode → tumbler →
//! handler → reply, using the same dispatcher loop the binary runs.

use relay_protocol::codes;
use relay_test_utils::MockUdpPeer;
use serde_json::{Map, json};
use std::time::Duration;
use synapse_relay::config::Config;
use synapse_relay::engine::RelayEngine;
use synapse_relay::storage::Store;
use synapse_relay::tumbler::Tumbler;
use synapse_relay::udp;
use tokio::net::UdpSocket;
use tokio::sync::watch;

struct NodeHarness {
    engine: RelayEngine,
    node_port: u16,
    _shutdown: watch::Sender<bool>,
}

/// Start a node dispatcher with the given peers and incoming whitelist.
async fn start_node(peers: &[(&str, u16)], incoming: &[&str]) -> NodeHarness {
    let mut config = Config::default();
    config.delivery.probe_ms = 100;
    config.signals.incoming = incoming.iter().map(|s| (*s).to_owned()).collect();
    config.peer_ports = peers
        .iter()
        .map(|(name, port)| ((*name).to_owned(), *port))
        .collect();

    let engine = RelayEngine::new(&config, Store::open_in_memory().unwrap());
    let tumbler = Tumbler::new(&config.signals.incoming);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let node_port = socket.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(udp::run(engine.clone(), tumbler, socket, shutdown_rx));

    NodeHarness {
        engine,
        node_port,
        _shutdown: shutdown_tx,
    }
}

/// Send raw bytes to the node and wait for one reply frame.
async fn exchange(node_port: u16, bytes: &[u8]) -> Option<relay_protocol::SignalFrame> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(bytes, ("127.0.0.1", node_port)).await.unwrap();

    let mut buf = vec![0u8; 65_535];
    match tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf)).await {
        Ok(Ok(n)) => relay_protocol::decode(&buf[..n]),
        _ => None,
    }
}

#[tokio::test]
async fn ping_gets_a_pong_with_echo_and_stats() {
    let node = start_node(&[], &[]).await;

    let mut payload = Map::new();
    payload.insert("probe".to_owned(), json!(42));
    let ping = relay_protocol::encode(codes::PING, "tester", &payload).unwrap();

    let pong = exchange(node.node_port, &ping).await.expect("pong reply");
    assert_eq!(pong.signal_type, codes::PONG);
    assert_eq!(pong.payload["status"], json!("operational"));
    assert_eq!(pong.payload["echo"]["probe"], json!(42));
    assert!(pong.payload.get("total_relayed").is_some());
    assert!(pong.payload.get("success_rate").is_some());
}

#[tokio::test]
async fn relay_request_fans_out_and_answers_with_the_result() {
    let alpha = MockUdpPeer::start().await.unwrap();
    let node = start_node(&[("alpha", alpha.port())], &[]).await;

    let mut payload = Map::new();
    payload.insert("signal_type".to_owned(), json!(0x04));
    payload.insert("target_servers".to_owned(), json!(["alpha"]));
    payload.insert("payload".to_owned(), json!({"note": "relayed"}));
    let request = relay_protocol::encode(codes::RELAY_REQUEST, "tester", &payload).unwrap();

    let response = exchange(node.node_port, &request).await.expect("relay response");
    assert_eq!(response.signal_type, codes::RELAY_RESPONSE);
    assert_eq!(response.payload["relayed"], json!(true));
    assert_eq!(response.payload["targets_reached"], json!(["alpha"]));

    let delivered = alpha
        .wait_for_signal(0x04, Duration::from_secs(2))
        .await
        .expect("fan-out frame");
    assert_eq!(delivered.payload.get("note"), Some(&json!("relayed")));

    // One history row, sourced from the requesting sender.
    let records = node.engine.store().lock().await.relays_since(0, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source_server, "tester");
}

#[tokio::test]
async fn malformed_relay_request_is_answered_with_relay_failed() {
    let node = start_node(&[], &[]).await;

    let mut payload = Map::new();
    payload.insert("target_servers".to_owned(), json!(["alpha"]));
    // signal_type missing.
    let request = relay_protocol::encode(codes::RELAY_REQUEST, "tester", &payload).unwrap();

    let response = exchange(node.node_port, &request).await.expect("failure reply");
    assert_eq!(response.signal_type, codes::RELAY_FAILED);
    assert!(response.payload["error"].as_str().unwrap().contains("signal_type"));
}

#[tokio::test]
async fn stale_frames_are_dropped_silently() {
    let node = start_node(&[], &[]).await;

    let now_secs = u32::try_from(chrono_now_secs()).unwrap();
    let stale = relay_protocol::encode_at(codes::PING, "tester", &Map::new(), now_secs - 400)
        .unwrap();
    assert!(
        exchange(node.node_port, &stale).await.is_none(),
        "stale ping must get no reply"
    );
}

#[tokio::test]
async fn whitelist_drops_unlisted_types() {
    let node = start_node(&[], &["0xF1"]).await;

    // PING is whitelisted and answered.
    let ping = relay_protocol::encode(codes::PING, "tester", &Map::new()).unwrap();
    assert!(exchange(node.node_port, &ping).await.is_some());

    // RELAY_REQUEST is not on the list: silently dropped.
    let mut payload = Map::new();
    payload.insert("signal_type".to_owned(), json!(4));
    payload.insert("target_servers".to_owned(), json!(["x"]));
    let request = relay_protocol::encode(codes::RELAY_REQUEST, "tester", &payload).unwrap();
    assert!(exchange(node.node_port, &request).await.is_none());
}

#[tokio::test]
async fn legacy_text_ping_still_gets_a_pong() {
    let node = start_node(&[], &[]).await;

    let legacy = format!(
        r#"{{"t": "ping", "s": "old-node", "d": {{"v": 1}}, "ts": {}}}"#,
        chrono_now_secs() * 1000
    );
    let pong = exchange(node.node_port, legacy.as_bytes())
        .await
        .expect("pong for legacy ping");
    assert_eq!(pong.signal_type, codes::PONG);
    assert_eq!(pong.payload["echo"]["v"], json!(1));
}

#[tokio::test]
async fn heartbeats_are_recorded_without_replies() {
    let node = start_node(&[], &[]).await;

    let mut payload = Map::new();
    payload.insert("sender".to_owned(), json!("beta"));
    let heartbeat = relay_protocol::encode(codes::HEARTBEAT, "beta", &payload).unwrap();
    assert!(exchange(node.node_port, &heartbeat).await.is_none());

    // Give the spawned handler a beat to record the arrival.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.engine.peers_last_seen().await.contains_key("beta"));
}

fn chrono_now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
