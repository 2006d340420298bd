//! Domain types persisted by the store and passed between subsystems.
//!
//! The payload is an open JSON object everywhere: transforms and handlers
//! only read named fields, unknown fields round-trip verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Open JSON payload carried by every signal.
pub type Payload = Map<String, Value>;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Relay priority. Advisory: it orders rows within the offline buffer and
/// nothing else; in-flight sends are never preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric rank used for `priority desc` ordering in the buffer.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl TryFrom<&str> for Priority {
    type Error = &'static str;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err("invalid priority"),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Relay request / result
// ---------------------------------------------------------------------------

/// An in-flight relay: one signal bound for one or more named targets.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub signal_type: u16,
    pub source_server: String,
    pub target_servers: Vec<String>,
    pub payload: Payload,
    pub priority: Priority,
    pub buffer_if_offline: bool,
}

/// Outcome of one `relay_signal` call.
#[derive(Debug, Clone, Serialize)]
pub struct RelayResult {
    pub relay_id: String,
    pub relayed: bool,
    pub targets_reached: Vec<String>,
    pub targets_failed: Vec<String>,
    pub targets_buffered: Vec<String>,
    pub latency_ms: i64,
}

// ---------------------------------------------------------------------------
// RelayRecord (immutable history row)
// ---------------------------------------------------------------------------

/// One row of relay history. Created once per `relay_signal` call and never
/// updated afterwards.
#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub id: String,
    pub signal_type: u16,
    pub source_server: String,
    pub target_servers: Vec<String>,
    pub payload: Payload,
    pub priority: Priority,
    pub relayed_at: i64,
    pub success: bool,
    pub targets_reached: Vec<String>,
    pub targets_failed: Vec<String>,
    pub latency_ms: i64,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// RelayRule
// ---------------------------------------------------------------------------

/// A transform spec is an ordered JSON object applied entry-by-entry:
/// `null` deletes the key, `{"rename": "src"}` moves a field, anything else
/// sets the key to that literal.
pub type TransformSpec = Map<String, Value>;

/// An operator-configured routing rule.
#[derive(Debug, Clone, Serialize)]
pub struct RelayRule {
    pub id: i64,
    pub signal_pattern: u16,
    pub source_filter: Option<String>,
    pub relay_to: Vec<String>,
    pub transform: Option<TransformSpec>,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub match_count: i64,
}

// ---------------------------------------------------------------------------
// BufferedSignal
// ---------------------------------------------------------------------------

/// Buffered-signal lifecycle. `Pending` is the only non-terminal state; a
/// row that reaches a terminal state is never re-selected for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    Pending,
    Delivered,
    Expired,
    Failed,
}

impl BufferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferStatus::Pending => "pending",
            BufferStatus::Delivered => "delivered",
            BufferStatus::Expired => "expired",
            BufferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BufferStatus::Pending)
    }
}

impl TryFrom<&str> for BufferStatus {
    type Error = &'static str;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(BufferStatus::Pending),
            "delivered" => Ok(BufferStatus::Delivered),
            "expired" => Ok(BufferStatus::Expired),
            "failed" => Ok(BufferStatus::Failed),
            _ => Err("invalid buffer status"),
        }
    }
}

/// One buffered signal awaiting delivery to a single offline target.
/// The buffer is target-sharded: one row per (signal, target) pair.
#[derive(Debug, Clone, Serialize)]
pub struct BufferedSignal {
    pub id: String,
    pub signal_type: u16,
    pub source_server: String,
    pub target_server: String,
    pub payload: Payload,
    pub priority: Priority,
    pub buffered_at: i64,
    pub retry_count: i64,
    pub last_retry_at: Option<i64>,
    pub max_retries: i64,
    pub expires_at: Option<i64>,
    pub status: BufferStatus,
}

// ---------------------------------------------------------------------------
// RelayStatsBucket
// ---------------------------------------------------------------------------

/// One aggregated stats row. The dimensional fields (signal_type, source,
/// target) plus `period_start` form the aggregation key.
#[derive(Debug, Clone)]
pub struct StatsBucket {
    pub id: i64,
    /// Epoch ms aligned to the hour.
    pub period_start: i64,
    pub signal_type: Option<u16>,
    pub source_server: Option<String>,
    pub target_server: Option<String>,
    pub total_relayed: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_latency_ms: Option<f64>,
    pub max_latency_ms: Option<i64>,
    pub buffered_count: i64,
}

/// Live buffer state counts surfaced by the stats query and the status page.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BufferCounts {
    pub pending: i64,
    pub delivered: i64,
    pub expired: i64,
    pub failed: i64,
}
