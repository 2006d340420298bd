//! Stats pipeline end to end: relays → forced rollup → grouped query
//! through the tool surface.

use relay_test_utils::MockUdpPeer;
use serde_json::json;
use synapse_relay::config::Config;
use synapse_relay::engine::RelayEngine;
use synapse_relay::model::{Payload, Priority, RelayRequest};
use synapse_relay::storage::Store;
use synapse_relay::tools::{RelayStatsParams, ToolSurface};

fn build_engine(peers: &[(&str, u16)]) -> RelayEngine {
    let mut config = Config::default();
    config.delivery.probe_ms = 100;
    config.peer_ports = peers
        .iter()
        .map(|(name, port)| ((*name).to_owned(), *port))
        .collect();
    RelayEngine::new(&config, Store::open_in_memory().unwrap())
}

fn request(source: &str, target: &str) -> RelayRequest {
    RelayRequest {
        signal_type: 0x50,
        source_server: source.to_owned(),
        target_servers: vec![target.to_owned()],
        payload: Payload::new(),
        priority: Priority::Normal,
        buffer_if_offline: false,
    }
}

#[tokio::test]
async fn grouped_stats_report_source_counts_and_rate() {
    let a = MockUdpPeer::start().await.unwrap();
    let port = a.port();
    let engine = build_engine(&[("A", port)]);

    // Two relays reach A.
    for _ in 0..2 {
        let result = engine.relay_signal(request("X", "A")).await.unwrap();
        assert!(result.relayed);
    }
    // A goes offline; the third relay fails.
    a.stop();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let result = engine.relay_signal(request("X", "A")).await.unwrap();
    assert!(!result.relayed, "offline target must fail the third relay");

    // Forced rollup, then the operator query.
    engine.stats().run_rollup().await.unwrap();
    let tools = ToolSurface::new(engine);
    let stats = tools
        .get_relay_stats(RelayStatsParams {
            since: Some(0),
            group_by: Some("source".to_owned()),
            ..RelayStatsParams::default()
        })
        .await
        .unwrap();

    assert_eq!(stats["total_relayed"], json!(3));
    let group = &stats["by_group"]["X"];
    assert_eq!(group["count"], json!(3));
    let rate = group["success_rate"].as_f64().unwrap();
    assert!((rate - 66.67).abs() < 0.01, "rounded to 2 decimals, got {rate}");
    assert!(group["avg_latency"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn window_totals_match_bucket_sums_and_rates_stay_bounded() {
    let a = MockUdpPeer::start().await.unwrap();
    let engine = build_engine(&[("A", a.port())]);

    for _ in 0..4 {
        engine.relay_signal(request("src-1", "A")).await.unwrap();
    }
    engine.relay_signal(request("src-2", "A")).await.unwrap();
    engine.stats().run_rollup().await.unwrap();

    let buckets = {
        let store = engine.store();
        let guard = store.lock().await;
        guard.stats_buckets(0, i64::MAX).unwrap()
    };
    let bucket_total: i64 = buckets.iter().map(|b| b.total_relayed).sum();

    let summary = engine.stats().query(0, None, None).await.unwrap();
    assert_eq!(summary.total_relayed, bucket_total);
    assert!(summary.success_rate >= 0.0 && summary.success_rate <= 100.0);
}

#[tokio::test]
async fn hour_grouping_uses_iso_hour_keys() {
    let a = MockUdpPeer::start().await.unwrap();
    let engine = build_engine(&[("A", a.port())]);
    engine.relay_signal(request("X", "A")).await.unwrap();
    engine.stats().run_rollup().await.unwrap();

    let tools = ToolSurface::new(engine);
    let stats = tools
        .get_relay_stats(RelayStatsParams {
            since: Some(0),
            group_by: Some("hour".to_owned()),
            ..RelayStatsParams::default()
        })
        .await
        .unwrap();

    let groups = stats["by_group"].as_object().expect("grouped");
    assert_eq!(groups.len(), 1);
    let key = groups.keys().next().unwrap();
    // "YYYY-MM-DDTHH"
    assert_eq!(key.len(), 13);
    assert_eq!(&key[10..11], "T");
}

#[tokio::test]
async fn buffer_stats_ride_along_with_the_query() {
    let dead_port = {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.local_addr().unwrap().port()
    };
    let engine = build_engine(&[("B", dead_port)]);

    let mut req = request("X", "B");
    req.buffer_if_offline = true;
    engine.relay_signal(req).await.unwrap();

    let tools = ToolSurface::new(engine);
    let stats = tools
        .get_relay_stats(RelayStatsParams {
            since: Some(0),
            ..RelayStatsParams::default()
        })
        .await
        .unwrap();
    assert_eq!(stats["buffer_stats"]["pending"], json!(1));
}
