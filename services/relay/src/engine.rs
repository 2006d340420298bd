//! The engine handle.
//!
//! `RelayEngine` owns every shared resource: the store, the peer-port map
//! (via the delivery sender), the event bus, the rule engine, the buffer
//! manager, and the stats aggregator. All exported operations are methods
//! here or on the subsystems it exposes. The buffer manager's delivery
//! callback is installed exactly once, during construction.

use crate::buffer::{BufferConfig, BufferError, BufferManager};
use crate::config::Config;
use crate::delivery::DeliverySender;
use crate::events::{EventBus, topics};
use crate::model::{Priority, RelayRecord, RelayRequest, RelayResult, now_ms};
use crate::rules::{self, RuleEngine, RuleError};
use crate::stats::StatsAggregator;
use crate::storage::{Store, StoreError};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Rule(#[from] RuleError),
    #[error("{0}")]
    Buffer(#[from] BufferError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// RelayEngine
// ---------------------------------------------------------------------------

/// Cloneable handle to one running relay node's core.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    node_name: String,
    store: Arc<Mutex<Store>>,
    events: EventBus,
    sender: Arc<DeliverySender>,
    rules: RuleEngine,
    buffer: BufferManager,
    stats: StatsAggregator,
    /// Peer name → last HEARTBEAT arrival, epoch ms. Observational only.
    peer_last_seen: Mutex<HashMap<String, i64>>,
}

impl RelayEngine {
    /// Assemble the engine from config and an opened store, and install the
    /// buffer manager's delivery callback.
    pub fn new(config: &Config, store: Store) -> Self {
        let store = Arc::new(Mutex::new(store));
        let events = EventBus::default();

        let sender = Arc::new(DeliverySender::new(
            config.node_name.clone(),
            config.peer_ports.clone(),
            config.delivery.probe_ms,
            config
                .signals
                .outgoing
                .iter()
                .filter_map(|s| crate::tumbler::parse_signal_code(s))
                .collect(),
        ));

        let buffer = BufferManager::new(
            store.clone(),
            events.clone(),
            BufferConfig {
                max_size: config.buffer.max_size,
                ttl_hours: config.buffer.ttl_hours,
                max_retries: config.buffer.max_retries,
                retry_intervals_ms: config.buffer.retry_intervals_ms.clone(),
            },
        );

        // The one-time callback installation: buffered retries reuse the
        // same send path as live relays.
        let callback_sender = sender.clone();
        buffer.install_delivery_callback(Arc::new(move |row| {
            let sender = callback_sender.clone();
            Box::pin(async move {
                sender
                    .send_signal(&row.target_server, row.signal_type, &row.payload)
                    .await
                    .is_ok()
            })
        }));

        let engine = RelayEngine {
            inner: Arc::new(EngineInner {
                node_name: config.node_name.clone(),
                rules: RuleEngine::new(store.clone()),
                stats: StatsAggregator::new(store.clone(), events.clone()),
                buffer,
                sender,
                events,
                store,
                peer_last_seen: Mutex::new(HashMap::new()),
            }),
        };
        info!(node = %engine.inner.node_name, "relay engine assembled");
        engine
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.inner.rules
    }

    pub fn buffer(&self) -> &BufferManager {
        &self.inner.buffer
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.inner.stats
    }

    pub fn sender(&self) -> &DeliverySender {
        &self.inner.sender
    }

    /// Resolve a peer name to its loopback address.
    pub fn peer_addr(&self, name: &str) -> Option<SocketAddr> {
        self.inner.sender.resolve(name)
    }

    // -----------------------------------------------------------------------
    // Relay pipeline
    // -----------------------------------------------------------------------

    /// Fan one signal out to every target, record the attempt, and buffer
    /// the targets that could not be reached.
    pub async fn relay_signal(&self, request: RelayRequest) -> Result<RelayResult, EngineError> {
        if request.target_servers.is_empty() {
            return Err(EngineError::InvalidRequest(
                "target_servers must not be empty".to_owned(),
            ));
        }
        let start = Instant::now();
        let relay_id = Uuid::new_v4().to_string();

        // Rules first: every matched rule's transform applies, highest
        // priority first, before any datagram leaves.
        let matched = self
            .inner
            .rules
            .match_rules(request.signal_type, &request.source_server)
            .await?;
        let payload = rules::apply_rule_transforms(&request.payload, &matched);

        let outcomes = self
            .inner
            .sender
            .fan_out(request.signal_type, &payload, &request.target_servers)
            .await;

        let mut targets_reached = Vec::new();
        let mut targets_failed = Vec::new();
        let mut targets_buffered = Vec::new();
        let mut error_message: Option<String> = None;

        for (target, outcome) in outcomes {
            match outcome {
                Ok(()) => targets_reached.push(target),
                Err(e) => {
                    warn!(relay_id = %relay_id, target = %target, error = %e, "target send failed");
                    if error_message.is_none() {
                        error_message = Some(format!("{target}: {e}"));
                    }
                    targets_failed.push(target.clone());

                    if request.buffer_if_offline {
                        match self
                            .inner
                            .buffer
                            .buffer_signal(
                                request.signal_type,
                                &request.source_server,
                                &target,
                                payload.clone(),
                                request.priority,
                            )
                            .await
                        {
                            Ok(buffer_id) => {
                                targets_buffered.push(target.clone());
                                self.inner.events.emit(
                                    topics::RELAY_BUFFERED,
                                    json!({
                                        "relay_id": relay_id,
                                        "buffer_id": buffer_id,
                                        "target_server": target,
                                        "signal_type": request.signal_type,
                                    }),
                                );
                            }
                            // A full buffer downgrades to plain failure.
                            Err(BufferError::Full(_)) => {}
                            Err(e) => return Err(EngineError::Buffer(e)),
                        }
                    }
                }
            }
        }

        let latency_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
        let success = !targets_reached.is_empty();

        // The history insert happens-after every per-target send completed.
        let record = RelayRecord {
            id: relay_id.clone(),
            signal_type: request.signal_type,
            source_server: request.source_server.clone(),
            target_servers: request.target_servers.clone(),
            payload,
            priority: request.priority,
            relayed_at: now_ms(),
            success,
            targets_reached: targets_reached.clone(),
            targets_failed: targets_failed.clone(),
            latency_ms,
            error_message,
        };
        self.inner.store.lock().await.insert_relay(&record)?;

        if !targets_reached.is_empty() {
            self.inner.events.emit(
                topics::RELAY_SENT,
                json!({
                    "relay_id": relay_id,
                    "signal_type": request.signal_type,
                    "targets_reached": targets_reached,
                    "latency_ms": latency_ms,
                }),
            );
        }
        if !targets_failed.is_empty() {
            self.inner.events.emit(
                topics::RELAY_FAILED,
                json!({
                    "relay_id": relay_id,
                    "signal_type": request.signal_type,
                    "targets_failed": targets_failed,
                }),
            );
        }

        Ok(RelayResult {
            relay_id,
            relayed: success,
            targets_reached,
            targets_failed,
            targets_buffered,
            latency_ms,
        })
    }

    /// Relay to every configured peer except `exclude` (and the node
    /// itself, which has no entry in its own peer map).
    pub async fn multicast(
        &self,
        signal_type: u16,
        payload: crate::model::Payload,
        priority: Priority,
        exclude: &[String],
    ) -> Result<RelayResult, EngineError> {
        let mut targets = self.inner.sender.peer_names();
        targets.retain(|name| !exclude.contains(name));
        targets.sort();
        self.relay_signal(RelayRequest {
            signal_type,
            source_server: self.inner.node_name.clone(),
            target_servers: targets,
            payload,
            priority,
            buffer_if_offline: true,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Peer observations
    // -----------------------------------------------------------------------

    /// Record a HEARTBEAT arrival. Observational only; no reply is sent.
    pub async fn record_heartbeat(&self, peer: &str) {
        self.inner
            .peer_last_seen
            .lock()
            .await
            .insert(peer.to_owned(), now_ms());
    }

    pub async fn peers_last_seen(&self) -> HashMap<String, i64> {
        self.inner.peer_last_seen.lock().await.clone()
    }

    /// Emit one HEARTBEAT to every heartbeat peer, fire-and-forget.
    pub async fn send_heartbeats(&self, peers: &[String]) {
        for peer in peers {
            let Some(addr) = self.inner.sender.resolve(peer) else {
                warn!(peer = %peer, "heartbeat peer has no configured port");
                continue;
            };
            if let Err(e) = self
                .inner
                .sender
                .send_to_addr(addr, relay_protocol::codes::HEARTBEAT, &crate::model::Payload::new())
                .await
            {
                warn!(peer = %peer, error = %e, "heartbeat send failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Retention cleanup: drop history/stats and terminal buffer rows older
    /// than the horizon.
    pub async fn prune_history(&self, horizon_hours: i64) -> Result<usize, EngineError> {
        let cutoff = now_ms() - horizon_hours * 3_600_000;
        let pruned = self.inner.store.lock().await.prune_before(cutoff)?;
        if pruned > 0 {
            info!(pruned, "retention cleanup removed aged rows");
        }
        Ok(pruned)
    }

    /// Shared store handle, for read paths that live outside the engine
    /// (status page, tests).
    pub fn store(&self) -> Arc<Mutex<Store>> {
        self.inner.store.clone()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
