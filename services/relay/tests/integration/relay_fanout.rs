//! Fan-out scenarios: every target reachable, and one target offline with
//! buffering. Exercises the delivery engine against real loopback peers.

use relay_test_utils::MockUdpPeer;
use serde_json::json;
use std::time::Duration;
use synapse_relay::config::Config;
use synapse_relay::engine::RelayEngine;
use synapse_relay::model::{BufferStatus, Payload, Priority, RelayRequest};
use synapse_relay::storage::Store;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

/// Engine wired to the given (name, port) peers, with a short probe window
/// so offline targets classify quickly.
fn build_engine(peers: &[(&str, u16)]) -> RelayEngine {
    let mut config = Config::default();
    config.delivery.probe_ms = 100;
    config.peer_ports = peers
        .iter()
        .map(|(name, port)| ((*name).to_owned(), *port))
        .collect();
    RelayEngine::new(&config, Store::open_in_memory().unwrap())
}

fn request(targets: &[&str], body: serde_json::Value) -> RelayRequest {
    RelayRequest {
        signal_type: 0x50,
        source_server: "test-harness".to_owned(),
        target_servers: targets.iter().map(|s| (*s).to_owned()).collect(),
        payload: payload(body),
        priority: Priority::Normal,
        buffer_if_offline: true,
    }
}

// ---------------------------------------------------------------------------
// Scenario: local fan-out, all targets reach
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fanout_reaches_all_listening_peers() {
    let a = MockUdpPeer::start().await.unwrap();
    let b = MockUdpPeer::start().await.unwrap();
    let engine = build_engine(&[("A", a.port()), ("B", b.port())]);

    let result = engine
        .relay_signal(request(&["A", "B"], json!({"x": 1})))
        .await
        .unwrap();

    assert!(result.relayed);
    assert_eq!(result.targets_reached, vec!["A", "B"]);
    assert!(result.targets_failed.is_empty());
    assert!(result.targets_buffered.is_empty());

    // Both peers got the framed signal with the sender folded in.
    for peer in [&a, &b] {
        let frame = peer
            .wait_for_signal(0x50, Duration::from_secs(2))
            .await
            .expect("frame delivered");
        assert_eq!(frame.payload.get("x"), Some(&json!(1)));
        assert_eq!(frame.sender(), Some("synapse-relay"));
    }

    // Exactly one history row, marked successful.
    let records = engine.store().lock().await.relays_since(0, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].targets_reached, vec!["A", "B"]);
    assert!(records[0].latency_ms >= 0);
}

// ---------------------------------------------------------------------------
// Scenario: one target offline, buffered
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_target_is_failed_and_buffered() {
    let a = MockUdpPeer::start().await.unwrap();
    // Reserve a port and release it so B is definitely offline.
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("A", a.port()), ("B", dead_port)]);

    let result = engine
        .relay_signal(request(&["A", "B"], json!({"x": 1})))
        .await
        .unwrap();

    assert!(result.relayed, "reaching A keeps the relay successful");
    assert_eq!(result.targets_reached, vec!["A"]);
    assert_eq!(result.targets_failed, vec!["B"]);
    assert_eq!(result.targets_buffered, vec!["B"]);

    // Exactly one pending buffer row for B, untouched by retries yet.
    let rows = engine.store().lock().await.pending_rows(Some("B")).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BufferStatus::Pending);
    assert_eq!(rows[0].retry_count, 0);
    assert_eq!(rows[0].signal_type, 0x50);

    // History reflects the split.
    let records = engine.store().lock().await.relays_since(0, 10).unwrap();
    assert_eq!(records[0].targets_reached, vec!["A"]);
    assert_eq!(records[0].targets_failed, vec!["B"]);
}

// ---------------------------------------------------------------------------
// Record invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reached_and_failed_are_disjoint_subsets_of_targets() {
    let a = MockUdpPeer::start().await.unwrap();
    let engine = build_engine(&[("A", a.port())]);

    engine
        .relay_signal(request(&["A", "missing-peer"], json!({})))
        .await
        .unwrap();

    let records = engine.store().lock().await.relays_since(0, 10).unwrap();
    let record = &records[0];
    for t in record.targets_reached.iter().chain(&record.targets_failed) {
        assert!(record.target_servers.contains(t));
    }
    for t in &record.targets_reached {
        assert!(!record.targets_failed.contains(t));
    }
    assert_eq!(record.success, !record.targets_reached.is_empty());
}

#[tokio::test]
async fn buffering_can_be_declined_per_request() {
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("B", dead_port)]);

    let mut req = request(&["B"], json!({}));
    req.buffer_if_offline = false;
    let result = engine.relay_signal(req).await.unwrap();

    assert!(!result.relayed);
    assert_eq!(result.targets_failed, vec!["B"]);
    assert!(result.targets_buffered.is_empty());
    assert!(engine.store().lock().await.pending_rows(None).unwrap().is_empty());
}
