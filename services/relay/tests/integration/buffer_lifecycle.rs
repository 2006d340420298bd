//! Buffered-signal lifecycle against real sockets: retry until the target
//! comes back, and TTL expiry on the processing tick.

use relay_test_utils::MockUdpPeer;
use serde_json::json;
use std::time::Duration;
use synapse_relay::config::Config;
use synapse_relay::engine::RelayEngine;
use synapse_relay::events::topics;
use synapse_relay::model::{BufferStatus, Payload, Priority, RelayRequest, now_ms};
use synapse_relay::storage::Store;

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

fn build_engine(peers: &[(&str, u16)], ttl_hours: i64) -> RelayEngine {
    let mut config = Config::default();
    config.delivery.probe_ms = 100;
    config.buffer.ttl_hours = ttl_hours;
    // Tight backoff so the suite runs in milliseconds, not seconds.
    config.buffer.retry_intervals_ms = vec![50, 50, 50];
    config.peer_ports = peers
        .iter()
        .map(|(name, port)| ((*name).to_owned(), *port))
        .collect();
    RelayEngine::new(&config, Store::open_in_memory().unwrap())
}

fn request(target: &str) -> RelayRequest {
    RelayRequest {
        signal_type: 0x50,
        source_server: "test-harness".to_owned(),
        target_servers: vec![target.to_owned()],
        payload: payload(json!({"job": "sync"})),
        priority: Priority::Normal,
        buffer_if_offline: true,
    }
}

// ---------------------------------------------------------------------------
// Scenario: retry then succeed once the target comes online
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffered_signal_delivers_when_target_comes_online() {
    // Reserve a port, keep it closed for the first relay.
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("B", dead_port)], 24);
    let mut sent_events = engine.events().subscribe(topics::RELAY_SENT);

    let result = engine.relay_signal(request("B")).await.unwrap();
    assert_eq!(result.targets_buffered, vec!["B"]);
    let buffer_id = {
        let rows = engine.store().lock().await.pending_rows(Some("B")).unwrap();
        rows[0].id.clone()
    };

    // B comes online on the same port the engine has mapped.
    let listener = tokio::net::UdpSocket::bind(("127.0.0.1", dead_port))
        .await
        .expect("rebind reserved port");

    // First tick may still be inside the backoff window; two ticks with a
    // pause cover it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let mut delivered = engine.buffer().process_buffer().await.unwrap().delivered;
    if delivered == 0 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        delivered = engine.buffer().process_buffer().await.unwrap().delivered;
    }
    assert!(delivered >= 1, "buffered signal should deliver");

    let row = engine
        .store()
        .lock()
        .await
        .buffered_by_id(&buffer_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, BufferStatus::Delivered);

    // The delivery surfaced as a relay:sent event carrying the buffer id.
    let event = tokio::time::timeout(Duration::from_secs(2), sent_events.recv())
        .await
        .expect("event within deadline")
        .expect("bus open");
    assert_eq!(event.data["buffer_id"], json!(buffer_id));

    // And the datagram really arrived.
    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(1), listener.recv(&mut buf))
        .await
        .expect("datagram within deadline")
        .unwrap();
    let frame = relay_protocol::decode(&buf[..n]).expect("valid frame");
    assert_eq!(frame.signal_type, 0x50);
    assert_eq!(frame.payload.get("job"), Some(&json!("sync")));
}

// ---------------------------------------------------------------------------
// Scenario: TTL expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_ttl_signal_expires_on_the_next_tick() {
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("B", dead_port)], 0);
    let mut expired_events = engine.events().subscribe(topics::BUFFER_EXPIRED);

    engine.relay_signal(request("B")).await.unwrap();
    let buffer_id = {
        let rows = engine.store().lock().await.pending_rows(Some("B")).unwrap();
        rows[0].id.clone()
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let outcome = engine.buffer().process_buffer().await.unwrap();
    assert_eq!(outcome.expired, 1);

    let row = engine
        .store()
        .lock()
        .await
        .buffered_by_id(&buffer_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, BufferStatus::Expired);

    let event = tokio::time::timeout(Duration::from_secs(2), expired_events.recv())
        .await
        .expect("event within deadline")
        .expect("bus open");
    assert_eq!(event.data["buffer_id"], json!(buffer_id));
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_pending_row_outlives_its_expiry_after_a_pass() {
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("B", dead_port)], 0);

    for _ in 0..3 {
        engine.relay_signal(request("B")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.buffer().process_buffer().await.unwrap();

    let now = now_ms();
    let pending = engine.store().lock().await.pending_rows(None).unwrap();
    for row in pending {
        if let Some(expires_at) = row.expires_at {
            assert!(expires_at >= now, "pending row past expiry survived a pass");
        }
    }
}

#[tokio::test]
async fn retry_budget_is_monotonic_and_bounded() {
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("B", dead_port)], 24);

    engine.relay_signal(request("B")).await.unwrap();
    let buffer_id = {
        let rows = engine.store().lock().await.pending_rows(Some("B")).unwrap();
        rows[0].id.clone()
    };

    // Target stays offline: drive passes until the budget is spent.
    let mut last_count = 0;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.buffer().process_buffer().await.unwrap();
        let row = engine
            .store()
            .lock()
            .await
            .buffered_by_id(&buffer_id)
            .unwrap()
            .unwrap();
        assert!(row.retry_count >= last_count, "retry_count never regresses");
        assert!(row.retry_count <= row.max_retries);
        last_count = row.retry_count;
    }

    let row = engine
        .store()
        .lock()
        .await
        .buffered_by_id(&buffer_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, BufferStatus::Failed);
    assert_eq!(row.retry_count, row.max_retries);
}
