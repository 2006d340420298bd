// relay-protocol: Mesh signal wire protocol frame types, signal-type
// registry, and the datagram codec.
//
// The numeric signal codes are part of the external contract and are frozen;
// see `codes`. The codec accepts one binary format and three legacy text
// formats but only ever emits the binary format.

use serde_json::{Map, Value};

pub mod codec;

pub use codec::{decode, encode, encode_at};

// ---------------------------------------------------------------------------
// Signal-type registry (frozen numeric contract)
// ---------------------------------------------------------------------------

/// Signal-type codes exchanged between mesh peers.
///
/// These numeric identities are shared with every deployed node; changing a
/// value is a wire-protocol break.
pub mod codes {
    pub const DOCK_REQUEST: u16 = 0x01;
    pub const DOCK_APPROVED: u16 = 0x02;
    pub const DOCK_REJECTED: u16 = 0x03;
    pub const HEARTBEAT: u16 = 0x04;
    pub const UNDOCK: u16 = 0x05;
    pub const RELAY_REQUEST: u16 = 0x50;
    pub const RELAY_RESPONSE: u16 = 0x51;
    pub const RELAY_FAILED: u16 = 0x52;
    pub const BUFFER_FLUSH: u16 = 0x53;
    pub const BUFFER_RETRY: u16 = 0x54;
    pub const ERROR: u16 = 0xF0;
    pub const PING: u16 = 0xF1;
    pub const PONG: u16 = 0xF2;
    pub const SHUTDOWN: u16 = 0xFF;

    /// Current framed-binary protocol version (major.minor as two bytes).
    pub const PROTOCOL_VERSION: u16 = 0x0100;

    /// Map a legacy symbolic type name to its numeric code.
    ///
    /// Legacy text frames carried names instead of numbers. Unknown names
    /// map to `0x00`, which no whitelist admits.
    pub fn from_name(name: &str) -> u16 {
        match name.to_ascii_lowercase().as_str() {
            "dock_request" => DOCK_REQUEST,
            "dock_approved" => DOCK_APPROVED,
            "dock_rejected" => DOCK_REJECTED,
            "heartbeat" => HEARTBEAT,
            "undock" => UNDOCK,
            "relay_request" => RELAY_REQUEST,
            "relay_response" => RELAY_RESPONSE,
            "relay_failed" => RELAY_FAILED,
            "buffer_flush" => BUFFER_FLUSH,
            "buffer_retry" => BUFFER_RETRY,
            "error" => ERROR,
            "ping" => PING,
            "pong" => PONG,
            "shutdown" => SHUTDOWN,
            _ => 0x00,
        }
    }
}

// ---------------------------------------------------------------------------
// SignalFrame
// ---------------------------------------------------------------------------

/// A decoded datagram, normalized to the current protocol shape.
///
/// Legacy text frames decode into the same struct: their symbolic type names
/// are resolved through [`codes::from_name`], their sender is folded into
/// `payload.sender`, and `protocol_version` is normalized to
/// [`codes::PROTOCOL_VERSION`].
#[derive(Debug, Clone, PartialEq)]
pub struct SignalFrame {
    pub signal_type: u16,
    pub protocol_version: u16,
    /// Unix seconds, as carried on the wire.
    pub timestamp: u32,
    pub payload: Map<String, Value>,
}

impl SignalFrame {
    /// The `sender` field injected into every encoded payload, if present.
    pub fn sender(&self) -> Option<&str> {
        self.payload.get("sender").and_then(Value::as_str)
    }

    /// Wire timestamp in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        i64::from(self.timestamp) * 1000
    }
}
