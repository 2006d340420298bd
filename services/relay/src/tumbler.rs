//! Inbound admission filter.
//!
//! A decoded frame is admitted iff its signal type is on the incoming
//! whitelist (when one is configured) and its wire timestamp is fresh:
//! within five minutes of local time overall, and no more than one minute
//! in the future.
//!
//! The peer whitelist is deliberately advisory: unknown senders are
//! admitted (heartbeats from anyone are welcomed), and the peer list only
//! resolves reply and heartbeat ports.
//!
//! Rejection is silent on the wire: the frame is logged and dropped.

use relay_protocol::SignalFrame;
use std::collections::HashSet;
use std::fmt;

/// Maximum allowed skew in either direction, ms.
const MAX_SKEW_MS: i64 = 300_000;
/// Tighter bound for timestamps ahead of local time, ms.
const MAX_FUTURE_MS: i64 = 60_000;

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownType(u16),
    Stale { age_ms: i64 },
    FarFuture { ahead_ms: i64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownType(t) => write!(f, "signal type 0x{t:02X} not whitelisted"),
            Rejection::Stale { age_ms } => write!(f, "stale timestamp ({age_ms} ms old)"),
            Rejection::FarFuture { ahead_ms } => {
                write!(f, "timestamp {ahead_ms} ms in the future")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tumbler
// ---------------------------------------------------------------------------

/// The admission filter, built once from config at startup.
#[derive(Debug, Clone)]
pub struct Tumbler {
    /// Empty set = admit every type.
    allowed_types: HashSet<u16>,
}

impl Tumbler {
    /// Build from configured hex/decimal code strings. Unparseable entries
    /// are logged and skipped rather than failing startup.
    pub fn new(incoming: &[String]) -> Self {
        let mut allowed_types = HashSet::new();
        for raw in incoming {
            match parse_signal_code(raw) {
                Some(code) => {
                    allowed_types.insert(code);
                }
                None => {
                    tracing::warn!(entry = %raw, "ignoring unparseable signal code in whitelist");
                }
            }
        }
        Tumbler { allowed_types }
    }

    /// Admit or reject a decoded frame against `now` (epoch ms).
    pub fn admit(&self, frame: &SignalFrame, now_ms: i64) -> Result<(), Rejection> {
        if !self.allowed_types.is_empty() && !self.allowed_types.contains(&frame.signal_type) {
            return Err(Rejection::UnknownType(frame.signal_type));
        }

        let ts_ms = frame.timestamp_ms();
        let skew = now_ms - ts_ms;
        if skew.abs() > MAX_SKEW_MS {
            return Err(Rejection::Stale { age_ms: skew });
        }
        if ts_ms - now_ms > MAX_FUTURE_MS {
            return Err(Rejection::FarFuture {
                ahead_ms: ts_ms - now_ms,
            });
        }
        Ok(())
    }
}

/// Parse a configured signal code: `"0x50"`, `"0X50"`, or decimal `"80"`.
pub fn parse_signal_code(raw: &str) -> Option<u16> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u16::from_str_radix(hex, 16).ok();
    }
    s.parse().ok()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
