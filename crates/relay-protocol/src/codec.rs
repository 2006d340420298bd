//! Datagram codec.
//!
//! # Binary format (the only format ever emitted)
//!
//! 12-byte header, all integers big-endian, followed by a UTF-8 JSON object:
//!
//! | Offset | Width | Field            |
//! |--------|-------|------------------|
//! | 0      | 2     | signal_type      |
//! | 2      | 2     | protocol_version |
//! | 4      | 4     | payload_length   |
//! | 8      | 4     | timestamp (unix seconds) |
//! | 12     | N     | payload JSON     |
//!
//! # Legacy text formats (decode-only, compatibility obligation)
//!
//! Tried in order when the binary decode fails:
//! 1. JSON `{t, s, d, ts}` — ts in epoch milliseconds
//! 2. JSON `{type, source, payload, timestamp}` — timestamp in epoch ms
//! 3. Colon-delimited `TYPE:SENDER:PAYLOAD_JSON:TIMESTAMP_MS`
//!
//! Decode failure is `None`, never a panic. New formats must not be added.

use crate::{SignalFrame, codes};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed binary header length in bytes.
pub const HEADER_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a signal into the framed binary format, stamped with the current
/// wall-clock time.
///
/// `sender` is injected into the payload object before serialization, so
/// every emitted frame is self-describing.
pub fn encode(
    signal_type: u16,
    sender: &str,
    payload: &Map<String, Value>,
) -> Result<Vec<u8>, serde_json::Error> {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    encode_at(signal_type, sender, payload, now_secs as u32)
}

/// Encode with an explicit wire timestamp (unix seconds).
pub fn encode_at(
    signal_type: u16,
    sender: &str,
    payload: &Map<String, Value>,
    timestamp_secs: u32,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = payload.clone();
    body.insert("sender".to_owned(), Value::String(sender.to_owned()));
    let body_bytes = serde_json::to_vec(&Value::Object(body))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body_bytes.len());
    frame.extend_from_slice(&signal_type.to_be_bytes());
    frame.extend_from_slice(&codes::PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&(body_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&timestamp_secs.to_be_bytes());
    frame.extend_from_slice(&body_bytes);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a datagram, trying the binary format first and then each legacy
/// text format in order. Returns `None` when nothing parses.
pub fn decode(data: &[u8]) -> Option<SignalFrame> {
    if let Some(frame) = decode_binary(data) {
        return Some(frame);
    }
    // Legacy formats are all UTF-8 text.
    let text = std::str::from_utf8(data).ok()?;
    decode_legacy_compact(text)
        .or_else(|| decode_legacy_verbose(text))
        .or_else(|| decode_legacy_colon(text))
}

fn decode_binary(data: &[u8]) -> Option<SignalFrame> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let signal_type = u16::from_be_bytes([data[0], data[1]]);
    let protocol_version = u16::from_be_bytes([data[2], data[3]]);
    let payload_length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let timestamp = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    // Valid wire types occupy one byte; zero is reserved-invalid.
    if signal_type == 0 || signal_type > 0xFF {
        return None;
    }
    if payload_length > data.len() - HEADER_LEN {
        return None;
    }

    let body = &data[HEADER_LEN..HEADER_LEN + payload_length];
    let payload = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };

    Some(SignalFrame {
        signal_type,
        protocol_version,
        timestamp,
        payload,
    })
}

/// Legacy format 1: `{"t": <type>, "s": <sender>, "d": {..}, "ts": <epoch_ms>}`.
fn decode_legacy_compact(text: &str) -> Option<SignalFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("t") {
        return None;
    }
    let signal_type = parse_type_value(obj.get("t")?);
    let sender = obj.get("s").and_then(Value::as_str);
    let payload = merge_payload(obj.get("d"), sender);
    let timestamp = millis_to_wire_secs(obj.get("ts"));
    Some(normalized(signal_type, timestamp, payload))
}

/// Legacy format 2: `{"type": .., "source": .., "payload": {..}, "timestamp": <epoch_ms>}`.
fn decode_legacy_verbose(text: &str) -> Option<SignalFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("type") {
        return None;
    }
    let signal_type = parse_type_value(obj.get("type")?);
    let sender = obj.get("source").and_then(Value::as_str);
    let payload = merge_payload(obj.get("payload"), sender);
    let timestamp = millis_to_wire_secs(obj.get("timestamp"));
    Some(normalized(signal_type, timestamp, payload))
}

/// Legacy format 3: `TYPE:SENDER:PAYLOAD_JSON:TIMESTAMP_MS`.
///
/// The payload JSON may itself contain colons, so the timestamp is split
/// off from the right and must be a bare integer.
fn decode_legacy_colon(text: &str) -> Option<SignalFrame> {
    let mut parts = text.splitn(3, ':');
    let type_part = parts.next()?;
    let sender_part = parts.next()?;
    let rest = parts.next()?;
    let (payload_part, ts_part) = rest.rsplit_once(':')?;

    let signal_type = parse_type_str(type_part);
    let ts_ms: i64 = ts_part.trim().parse().ok()?;
    let payload_value: Value = serde_json::from_str(payload_part).ok()?;
    let payload = merge_payload(Some(&payload_value), Some(sender_part));
    let timestamp = clamp_wire_secs(ts_ms / 1000);
    Some(normalized(signal_type, timestamp, payload))
}

// ---------------------------------------------------------------------------
// Legacy helpers
// ---------------------------------------------------------------------------

fn normalized(signal_type: u16, timestamp: u32, payload: Map<String, Value>) -> SignalFrame {
    SignalFrame {
        signal_type,
        protocol_version: codes::PROTOCOL_VERSION,
        timestamp,
        payload,
    }
}

/// Resolve a legacy type value: numeric as-is, string via hex/decimal parse
/// and then the symbolic name table. Anything unresolvable maps to `0x00`.
fn parse_type_value(value: &Value) -> u16 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(0x00),
        Value::String(s) => parse_type_str(s),
        _ => 0x00,
    }
}

fn parse_type_str(s: &str) -> u16 {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u16::from_str_radix(hex, 16).unwrap_or(0x00);
    }
    if let Ok(n) = s.parse::<u16>() {
        return n;
    }
    codes::from_name(s)
}

/// Merge a legacy data object into a fresh payload and fold the sender in.
/// A non-object data value carries no mergeable fields and is dropped.
fn merge_payload(data: Option<&Value>, sender: Option<&str>) -> Map<String, Value> {
    let mut payload = match data {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    if let Some(s) = sender {
        payload.insert("sender".to_owned(), Value::String(s.to_owned()));
    }
    payload
}

fn millis_to_wire_secs(value: Option<&Value>) -> u32 {
    let ms = value.and_then(Value::as_i64).unwrap_or(0);
    clamp_wire_secs(ms / 1000)
}

fn clamp_wire_secs(secs: i64) -> u32 {
    u32::try_from(secs).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
