//! One-way engine event fan-out.
//!
//! Every subscriber gets its own broadcast receiver; a slow subscriber that
//! lags skips the missed events and keeps receiving. Publishing never blocks
//! and succeeds with zero subscribers.
//!
//! Subscription patterns: `"*"` (everything), `"relay:*"` (topic prefix),
//! or an exact topic such as `"buffer:expired"`.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Event topics emitted by the engine.
pub mod topics {
    pub const RELAY_SENT: &str = "relay:sent";
    pub const RELAY_FAILED: &str = "relay:failed";
    pub const RELAY_BUFFERED: &str = "relay:buffered";
    pub const BUFFER_RETRY: &str = "buffer:retry";
    pub const BUFFER_EXPIRED: &str = "buffer:expired";
    pub const STATS_UPDATE: &str = "stats:update";
    pub const ERROR: &str = "error";
}

/// A broadcast engine event.
#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp_iso: String,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast fan-out of engine events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    /// `capacity` bounds how many events a lagging subscriber can fall
    /// behind before it starts skipping.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publish an event. Succeeds even with zero subscribers.
    pub fn emit(&self, topic: &str, data: Value) {
        let event = RelayEvent {
            kind: topic.to_owned(),
            data,
            timestamp_iso: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let _ = self.tx.send(event);
    }

    /// Subscribe with a topic pattern: exact topic, `prefix:*`, or `*`.
    pub fn subscribe(&self, pattern: &str) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter: TopicFilter::parse(pattern),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

// ---------------------------------------------------------------------------
// EventSubscription
// ---------------------------------------------------------------------------

/// A filtered receiver; `recv` yields only events matching the pattern.
pub struct EventSubscription {
    rx: broadcast::Receiver<RelayEvent>,
    filter: TopicFilter,
}

impl EventSubscription {
    /// Next matching event, or `None` once the bus is closed. Lagged
    /// subscribers skip missed events and continue.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event.kind) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicFilter {
    All,
    Prefix(String),
    Exact(String),
}

impl TopicFilter {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicFilter::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicFilter::Prefix(prefix.to_owned())
        } else {
            TopicFilter::Exact(pattern.to_owned())
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix),
            TopicFilter::Exact(exact) => topic == exact,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
