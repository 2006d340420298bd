//! Inbound protocol handlers.
//!
//! Dispatch on the validated frame's signal type:
//! - PING → PONG to the sender's configured port, carrying the echoed
//!   payload and the past hour's stats.
//! - RELAY_REQUEST → `relay_signal`, answered with RELAY_RESPONSE (or
//!   RELAY_FAILED when the call itself errored).
//! - HEARTBEAT → recorded, never answered.
//! - Anything else is logged and dropped.
//!
//! Handlers return the reply as data; the caller owns the socket. Replies
//! address the sender's configured peer port, falling back to the
//! datagram's source address for senders we have no port mapping for.

use crate::engine::RelayEngine;
use crate::model::{Payload, Priority, RelayRequest, now_ms};
use relay_protocol::{SignalFrame, codes};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tracing::{debug, error, info};

/// A reply datagram to be sent by the caller.
#[derive(Debug)]
pub struct Reply {
    pub addr: SocketAddr,
    pub signal_type: u16,
    pub payload: Payload,
}

/// Dispatch one admitted frame. Returns the reply to send, if any.
pub async fn handle_frame(
    engine: &RelayEngine,
    frame: SignalFrame,
    src: SocketAddr,
) -> Option<Reply> {
    match frame.signal_type {
        codes::PING => Some(handle_ping(engine, &frame, src).await),
        codes::RELAY_REQUEST => Some(handle_relay_request(engine, &frame, src).await),
        codes::HEARTBEAT => {
            handle_heartbeat(engine, &frame, src).await;
            None
        }
        other => {
            debug!(signal_type = format!("0x{other:02X}"), %src, "unhandled signal type, dropping");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// PING
// ---------------------------------------------------------------------------

async fn handle_ping(engine: &RelayEngine, frame: &SignalFrame, src: SocketAddr) -> Reply {
    // Past-hour stats ride along on the pong; a store failure degrades the
    // reply to zeros rather than suppressing it.
    let (total_relayed, success_rate) = match engine
        .stats()
        .query(now_ms() - 3_600_000, None, None)
        .await
    {
        Ok(summary) => (summary.total_relayed, summary.success_rate),
        Err(e) => {
            error!(error = %e, "stats lookup for pong failed");
            (0, 0.0)
        }
    };

    let mut payload = Payload::new();
    payload.insert("echo".to_owned(), Value::Object(frame.payload.clone()));
    payload.insert("status".to_owned(), json!("operational"));
    payload.insert("total_relayed".to_owned(), json!(total_relayed));
    payload.insert("success_rate".to_owned(), json!(success_rate));

    Reply {
        addr: reply_addr(engine, frame, src),
        signal_type: codes::PONG,
        payload,
    }
}

// ---------------------------------------------------------------------------
// RELAY_REQUEST
// ---------------------------------------------------------------------------

async fn handle_relay_request(engine: &RelayEngine, frame: &SignalFrame, src: SocketAddr) -> Reply {
    let addr = reply_addr(engine, frame, src);
    let request = match parse_relay_request(frame) {
        Ok(request) => request,
        Err(message) => {
            error!(%src, error = %message, "malformed relay request");
            return failure_reply(addr, &message);
        }
    };

    match engine.relay_signal(request).await {
        Ok(result) => {
            let payload = match serde_json::to_value(&result) {
                Ok(Value::Object(map)) => map,
                _ => Payload::new(),
            };
            Reply {
                addr,
                signal_type: codes::RELAY_RESPONSE,
                payload,
            }
        }
        Err(e) => {
            error!(error = %e, "relay request failed");
            failure_reply(addr, &e.to_string())
        }
    }
}

/// Pull the relay parameters out of an inbound RELAY_REQUEST payload.
fn parse_relay_request(frame: &SignalFrame) -> Result<RelayRequest, String> {
    let signal_type = frame
        .payload
        .get("signal_type")
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or("missing or invalid signal_type")?;

    let targets = frame
        .payload
        .get("target_servers")
        .and_then(Value::as_array)
        .ok_or("missing target_servers")?;
    let target_servers: Vec<String> = targets
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect();
    if target_servers.is_empty() {
        return Err("target_servers must name at least one peer".to_owned());
    }

    let payload = match frame.payload.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        None => Payload::new(),
        Some(_) => return Err("payload must be an object".to_owned()),
    };

    let priority = match frame.payload.get("priority").and_then(Value::as_str) {
        Some(s) => Priority::try_from(s).map_err(|e| format!("{e}: '{s}'"))?,
        None => Priority::Normal,
    };

    let buffer_if_offline = frame
        .payload
        .get("buffer_if_offline")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    Ok(RelayRequest {
        signal_type,
        source_server: frame.sender().unwrap_or("unknown").to_owned(),
        target_servers,
        payload,
        priority,
        buffer_if_offline,
    })
}

fn failure_reply(addr: SocketAddr, message: &str) -> Reply {
    let mut payload = Payload::new();
    payload.insert("error".to_owned(), json!(message));
    Reply {
        addr,
        signal_type: codes::RELAY_FAILED,
        payload,
    }
}

// ---------------------------------------------------------------------------
// HEARTBEAT
// ---------------------------------------------------------------------------

async fn handle_heartbeat(engine: &RelayEngine, frame: &SignalFrame, src: SocketAddr) {
    // Unknown senders are welcome here; the name falls back to the source
    // address so their liveness still shows up.
    let peer = frame
        .sender()
        .map_or_else(|| src.to_string(), str::to_owned);
    info!(peer = %peer, "heartbeat received");
    engine.record_heartbeat(&peer).await;
}

/// Reply to the sender's configured port; unknown senders get the reply at
/// the datagram's source address.
fn reply_addr(engine: &RelayEngine, frame: &SignalFrame, src: SocketAddr) -> SocketAddr {
    frame
        .sender()
        .and_then(|name| engine.peer_addr(name))
        .unwrap_or(src)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
