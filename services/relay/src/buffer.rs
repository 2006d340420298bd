//! Durable offline buffer with retry scheduling and TTL expiry.
//!
//! # Lifecycle
//!
//! ```text
//!            ┌── delivery callback returns true ──► delivered (terminal)
//! pending ───┤
//!            ├── retry budget exhausted ──────────► failed    (terminal)
//!            └── expires_at < now ────────────────► expired   (terminal)
//! ```
//!
//! Terminal rows are never re-selected; every transition in the store is
//! guarded by `status = 'pending'`.
//!
//! # Scheduling
//!
//! `process_buffer` runs on a host tick. Retry N waits
//! `retry_intervals_ms[min(N, last)]` after the previous attempt (or after
//! buffering, for the first), giving backoff with a clamped last step. One
//! pass is in flight at a time; an overlapping tick is skipped.
//!
//! The delivery callback is installed once at startup and owned here; it is
//! only ever invoked from this module.

use crate::events::{EventBus, topics};
use crate::model::{BufferStatus, BufferedSignal, Payload, Priority, now_ms};
use crate::storage::{BufferClearFilter, Store, StoreError};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Future returned by the delivery callback; resolves true on success.
pub type DeliveryFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// The host-installed delivery function. Write-once, read-many.
pub type DeliveryCallback = Arc<dyn Fn(BufferedSignal) -> DeliveryFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("buffer is full ({0} pending signals)")]
    Full(i64),
}

// ---------------------------------------------------------------------------
// Config and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Pending-row cap; new buffering is rejected once reached.
    pub max_size: i64,
    pub ttl_hours: i64,
    pub max_retries: i64,
    pub retry_intervals_ms: Vec<i64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_size: 1000,
            ttl_hours: 24,
            max_retries: 3,
            retry_intervals_ms: vec![1000, 5000, 15000],
        }
    }
}

/// Result of one `process_buffer` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// True when another pass was already in flight and this tick did nothing.
    pub skipped: bool,
    pub expired: usize,
    pub attempted: usize,
    pub delivered: usize,
    /// Rows that exhausted their retry budget this pass.
    pub failed: usize,
}

/// Result of `retry_buffered` / `flush`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptTally {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

enum Attempt {
    Delivered,
    RetryScheduled,
    Exhausted,
    /// Row went terminal between selection and the attempt, or no callback
    /// is installed yet.
    Skipped,
}

// ---------------------------------------------------------------------------
// BufferManager
// ---------------------------------------------------------------------------

pub struct BufferManager {
    store: Arc<Mutex<Store>>,
    events: EventBus,
    config: BufferConfig,
    callback: OnceLock<DeliveryCallback>,
    /// Serializes retry passes: a tick that finds this held is skipped.
    pass_gate: Mutex<()>,
}

impl BufferManager {
    pub fn new(store: Arc<Mutex<Store>>, events: EventBus, config: BufferConfig) -> Self {
        BufferManager {
            store,
            events,
            config,
            callback: OnceLock::new(),
            pass_gate: Mutex::new(()),
        }
    }

    /// Install the delivery callback. The first installation wins; later
    /// calls are logged and ignored.
    pub fn install_delivery_callback(&self, callback: DeliveryCallback) {
        if self.callback.set(callback).is_err() {
            warn!("delivery callback already installed, ignoring reinstallation");
        }
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Persist a new pending row for one (signal, target) pair and return
    /// its buffer id.
    pub async fn buffer_signal(
        &self,
        signal_type: u16,
        source_server: &str,
        target_server: &str,
        payload: Payload,
        priority: Priority,
    ) -> Result<String, BufferError> {
        let store = self.store.lock().await;
        let pending = store.pending_count()?;
        if pending >= self.config.max_size {
            warn!(target = target_server, pending, "buffer full, rejecting signal");
            return Err(BufferError::Full(pending));
        }

        let buffered_at = now_ms();
        let row = BufferedSignal {
            id: Uuid::new_v4().to_string(),
            signal_type,
            source_server: source_server.to_owned(),
            target_server: target_server.to_owned(),
            payload,
            priority,
            buffered_at,
            retry_count: 0,
            last_retry_at: None,
            max_retries: self.config.max_retries,
            expires_at: Some(buffered_at + self.config.ttl_hours.max(0) * 3_600_000),
            status: BufferStatus::Pending,
        };
        store.insert_buffered(&row)?;
        debug!(buffer_id = %row.id, target = target_server, "signal buffered");
        Ok(row.id)
    }

    // -----------------------------------------------------------------------
    // Periodic pass
    // -----------------------------------------------------------------------

    /// One full pass: expire sweep, then backoff-filtered retries.
    pub async fn process_buffer(&self) -> Result<ProcessOutcome, BufferError> {
        let Ok(_gate) = self.pass_gate.try_lock() else {
            debug!("retry pass already in flight, skipping tick");
            return Ok(ProcessOutcome {
                skipped: true,
                ..ProcessOutcome::default()
            });
        };

        let mut outcome = ProcessOutcome::default();
        let now = now_ms();

        // 1. Expire sweep, one atomic statement.
        let expired_ids = self.store.lock().await.expire_pending(now)?;
        outcome.expired = expired_ids.len();
        for id in &expired_ids {
            self.events
                .emit(topics::BUFFER_EXPIRED, json!({ "buffer_id": id }));
        }

        // 2. Select retryable rows, then apply the backoff filter here.
        let candidates = self.store.lock().await.pending_retryable(now)?;
        let due: Vec<BufferedSignal> = candidates
            .into_iter()
            .filter(|row| {
                let since = row.last_retry_at.unwrap_or(row.buffered_at);
                now - since >= self.interval_for(row.retry_count)
            })
            .collect();

        // 3. Attempt each due row once.
        for row in due {
            outcome.attempted += 1;
            match self.attempt(row).await? {
                Attempt::Delivered => outcome.delivered += 1,
                Attempt::Exhausted => outcome.failed += 1,
                Attempt::RetryScheduled | Attempt::Skipped => {}
            }
        }
        Ok(outcome)
    }

    /// Attempt the listed pending rows exactly once each, ignoring backoff.
    pub async fn retry_buffered(&self, ids: &[String]) -> Result<AttemptTally, BufferError> {
        let rows = self.store.lock().await.pending_by_ids(ids)?;
        let mut tally = AttemptTally::default();
        for row in rows {
            tally.attempted += 1;
            match self.attempt(row).await? {
                Attempt::Delivered => tally.delivered += 1,
                Attempt::Exhausted => tally.failed += 1,
                Attempt::RetryScheduled | Attempt::Skipped => {}
            }
        }
        Ok(tally)
    }

    /// Drain every pending row (optionally one target's): each row goes
    /// terminal on this pass, delivered on success and failed otherwise.
    pub async fn flush(&self, target: Option<&str>) -> Result<AttemptTally, BufferError> {
        let rows = self.store.lock().await.pending_rows(target)?;
        let mut tally = AttemptTally::default();
        for row in rows {
            tally.attempted += 1;
            let delivered = match self.callback.get() {
                Some(cb) => cb(row.clone()).await,
                None => false,
            };
            let store = self.store.lock().await;
            if delivered {
                if store.mark_delivered(&row.id)? {
                    tally.delivered += 1;
                    self.emit_buffered_sent(&row);
                }
            } else if store.mark_failed(&row.id)? {
                tally.failed += 1;
            }
        }
        Ok(tally)
    }

    /// Delete rows matching the filter. At least one filter is required;
    /// ids take precedence.
    pub async fn clear(&self, filter: &BufferClearFilter) -> Result<usize, BufferError> {
        Ok(self.store.lock().await.delete_buffered(filter, now_ms())?)
    }

    /// Newest-first listing for the tool surface.
    pub async fn list(
        &self,
        target: Option<&str>,
        limit: usize,
    ) -> Result<Vec<BufferedSignal>, BufferError> {
        Ok(self.store.lock().await.list_buffered(target, limit)?)
    }

    pub async fn counts(&self) -> Result<crate::model::BufferCounts, BufferError> {
        Ok(self.store.lock().await.buffer_counts()?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn interval_for(&self, retry_count: i64) -> i64 {
        let intervals = &self.config.retry_intervals_ms;
        let idx = usize::try_from(retry_count.max(0)).unwrap_or(0);
        intervals
            .get(idx)
            .or_else(|| intervals.last())
            .copied()
            .unwrap_or(0)
    }

    /// One delivery attempt for one row. The store guard on `pending` makes
    /// this safe against the row having gone terminal since selection.
    async fn attempt(&self, row: BufferedSignal) -> Result<Attempt, BufferError> {
        let Some(callback) = self.callback.get() else {
            warn!(buffer_id = %row.id, "no delivery callback installed, skipping attempt");
            return Ok(Attempt::Skipped);
        };

        let delivered = callback(row.clone()).await;
        if delivered {
            if self.store.lock().await.mark_delivered(&row.id)? {
                self.emit_buffered_sent(&row);
                return Ok(Attempt::Delivered);
            }
            return Ok(Attempt::Skipped);
        }

        match self.store.lock().await.record_retry_failure(&row.id, now_ms())? {
            Some(BufferStatus::Pending) => {
                self.events.emit(
                    topics::BUFFER_RETRY,
                    json!({
                        "buffer_id": row.id,
                        "target_server": row.target_server,
                        "retry_count": row.retry_count + 1,
                        "exhausted": false,
                    }),
                );
                Ok(Attempt::RetryScheduled)
            }
            Some(BufferStatus::Failed) => {
                // Budget exhausted: this is the row's final event.
                self.events.emit(
                    topics::BUFFER_RETRY,
                    json!({
                        "buffer_id": row.id,
                        "target_server": row.target_server,
                        "retry_count": row.retry_count + 1,
                        "exhausted": true,
                    }),
                );
                Ok(Attempt::Exhausted)
            }
            _ => Ok(Attempt::Skipped),
        }
    }

    fn emit_buffered_sent(&self, row: &BufferedSignal) {
        self.events.emit(
            topics::RELAY_SENT,
            json!({
                "buffer_id": row.id,
                "target_server": row.target_server,
                "signal_type": row.signal_type,
                "buffered": true,
            }),
        );
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
