//! Rule-driven fan-out with a payload transform, end to end: configure a
//! rule through the tool surface, relay a matching signal, and verify the
//! rewritten payload on the wire.

use relay_test_utils::MockUdpPeer;
use serde_json::json;
use std::time::Duration;
use synapse_relay::config::Config;
use synapse_relay::engine::RelayEngine;
use synapse_relay::model::Payload;
use synapse_relay::storage::Store;
use synapse_relay::tools::{ConfigureRelayParams, RelaySignalParams, ToolSurface};

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other:?}"),
    }
}

fn build_tools(peers: &[(&str, u16)]) -> ToolSurface {
    let mut config = Config::default();
    config.delivery.probe_ms = 100;
    config.peer_ports = peers
        .iter()
        .map(|(name, port)| ((*name).to_owned(), *port))
        .collect();
    ToolSurface::new(RelayEngine::new(&config, Store::open_in_memory().unwrap()))
}

fn add_rule_params(transform: serde_json::Value) -> ConfigureRelayParams {
    ConfigureRelayParams {
        action: "add".to_owned(),
        rule_id: None,
        signal_pattern: Some(0x50),
        source_filter: None,
        relay_to: Some(vec!["C".to_owned()]),
        transform: Some(payload(transform)),
        priority: Some(0),
        enabled: Some(true),
    }
}

#[tokio::test]
async fn matched_rule_rewrites_the_payload_on_the_wire() {
    let c = MockUdpPeer::start().await.unwrap();
    let tools = build_tools(&[("C", c.port())]);

    // Rename before delete, so the moved value survives the cleanup.
    let added = tools
        .configure_relay(add_rule_params(
            json!({"ts": 123, "new": {"rename": "old"}, "old": null}),
        ))
        .await
        .unwrap();
    assert_eq!(added["success"], json!(true));

    let result = tools
        .relay_signal(RelaySignalParams {
            signal_type: 0x50,
            target_servers: vec!["C".to_owned()],
            payload: payload(json!({"old": "v", "keep": true})),
            priority: None,
            retry_on_fail: None,
            buffer_if_offline: None,
        })
        .await
        .unwrap();
    assert_eq!(result["relayed"], json!(true));

    let frame = c
        .wait_for_signal(0x50, Duration::from_secs(2))
        .await
        .expect("transformed frame delivered");
    assert_eq!(frame.payload.get("keep"), Some(&json!(true)));
    assert_eq!(frame.payload.get("new"), Some(&json!("v")));
    assert_eq!(frame.payload.get("ts"), Some(&json!(123)));
    assert!(!frame.payload.contains_key("old"));

    // The rule matched exactly once.
    let listed = tools
        .configure_relay(ConfigureRelayParams {
            action: "list".to_owned(),
            rule_id: None,
            signal_pattern: None,
            source_filter: None,
            relay_to: None,
            transform: None,
            priority: None,
            enabled: None,
        })
        .await
        .unwrap();
    assert_eq!(listed["rules"][0]["match_count"], json!(1));
}

#[tokio::test]
async fn disabled_and_mismatched_rules_leave_the_payload_alone() {
    let c = MockUdpPeer::start().await.unwrap();
    let tools = build_tools(&[("C", c.port())]);

    // Disabled rule with a transform that would be visible.
    let mut params = add_rule_params(json!({"tampered": true}));
    params.enabled = Some(false);
    tools.configure_relay(params).await.unwrap();

    // Enabled rule for a different signal type.
    let mut params = add_rule_params(json!({"tampered": true}));
    params.signal_pattern = Some(0x04);
    tools.configure_relay(params).await.unwrap();

    tools
        .relay_signal(RelaySignalParams {
            signal_type: 0x50,
            target_servers: vec!["C".to_owned()],
            payload: payload(json!({"k": "v"})),
            priority: None,
            retry_on_fail: None,
            buffer_if_offline: None,
        })
        .await
        .unwrap();

    let frame = c
        .wait_for_signal(0x50, Duration::from_secs(2))
        .await
        .expect("frame delivered");
    assert_eq!(frame.payload.get("k"), Some(&json!("v")));
    assert!(!frame.payload.contains_key("tampered"));
}

#[tokio::test]
async fn higher_priority_rule_transforms_first() {
    let c = MockUdpPeer::start().await.unwrap();
    let tools = build_tools(&[("C", c.port())]);

    // Low priority overwrites "stage" after high priority set it: the
    // priority-desc composition makes the low-priority write final.
    let mut high = add_rule_params(json!({"stage": "first"}));
    high.priority = Some(10);
    tools.configure_relay(high).await.unwrap();
    let mut low = add_rule_params(json!({"stage": "second"}));
    low.priority = Some(1);
    tools.configure_relay(low).await.unwrap();

    tools
        .relay_signal(RelaySignalParams {
            signal_type: 0x50,
            target_servers: vec!["C".to_owned()],
            payload: Payload::new(),
            priority: None,
            retry_on_fail: None,
            buffer_if_offline: None,
        })
        .await
        .unwrap();

    let frame = c
        .wait_for_signal(0x50, Duration::from_secs(2))
        .await
        .expect("frame delivered");
    assert_eq!(frame.payload.get("stage"), Some(&json!("second")));
}
