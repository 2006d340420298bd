//! Durable SQLite store for relay history, rules, the offline buffer, and
//! aggregated stats.
//!
//! # Schema
//! Four tables (`signal_relays`, `relay_rules`, `signal_buffer`,
//! `relay_stats`); see `schema.sql`. List- and object-valued columns hold
//! JSON text.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON. `PRAGMA integrity_check` runs at open; returns an error
//! if it fails.
//!
//! # Atomicity
//! Every method is one statement or one transaction. Status transitions on
//! `signal_buffer` are guarded by `status = 'pending'` so a terminal row can
//! never regress, even under concurrent writers.

use crate::model::{
    BufferCounts, BufferStatus, BufferedSignal, Payload, Priority, RelayRecord, RelayRule,
    StatsBucket, TransformSpec,
};
use rusqlite::types::Type;
use rusqlite::{Connection, params};
use std::path::Path;
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Buffer-ordering expression: priority desc, oldest first within a band.
const BUFFER_ORDER: &str = "CASE priority
         WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0
     END DESC, buffered_at ASC";

// ---------------------------------------------------------------------------
// Input / filter types
// ---------------------------------------------------------------------------

/// Fields required to create a rule; id, timestamps and match_count are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub signal_pattern: u16,
    pub source_filter: Option<String>,
    pub relay_to: Vec<String>,
    pub transform: Option<TransformSpec>,
    pub priority: i64,
    pub enabled: bool,
}

/// Filter for `delete_buffered`. At least one field must be set; `ids`
/// takes precedence over every other filter when both are given.
#[derive(Debug, Clone, Default)]
pub struct BufferClearFilter {
    pub ids: Option<Vec<String>>,
    pub target_server: Option<String>,
    pub signal_type: Option<u16>,
    pub max_age_hours: Option<i64>,
}

impl BufferClearFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.target_server.is_none()
            && self.signal_type.is_none()
            && self.max_age_hours.is_none()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The durable store for a single relay node.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed. Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(Store { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Store { conn })
    }

    // -----------------------------------------------------------------------
    // Relay history
    // -----------------------------------------------------------------------

    /// Insert one immutable relay history row.
    pub fn insert_relay(&self, record: &RelayRecord) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO signal_relays
                 (id, signal_type, source_server, target_servers, payload, priority,
                  relayed_at, success, targets_reached, targets_failed, latency_ms,
                  error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.signal_type,
                record.source_server,
                json_text(&record.target_servers)?,
                payload_text(&record.payload)?,
                record.priority.as_str(),
                record.relayed_at,
                record.success,
                json_text(&record.targets_reached)?,
                json_text(&record.targets_failed)?,
                record.latency_ms,
                record.error_message,
            ],
        )?;
        Ok(())
    }

    /// Relay rows with `relayed_at >= since`, oldest first, capped at `limit`.
    pub fn relays_since(&self, since: i64, limit: usize) -> StoreResult<Vec<RelayRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, signal_type, source_server, target_servers, payload, priority,
                    relayed_at, success, targets_reached, targets_failed, latency_ms,
                    error_message
             FROM signal_relays
             WHERE relayed_at >= ?1
             ORDER BY relayed_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit as i64], map_relay_row)?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// Insert a rule and return its assigned id.
    pub fn insert_rule(&self, rule: &NewRule, now: i64) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO relay_rules
                 (signal_pattern, source_filter, relay_to, transform, priority,
                  enabled, created_at, match_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                rule.signal_pattern,
                rule.source_filter,
                json_text(&rule.relay_to)?,
                rule.transform.as_ref().map(payload_text).transpose()?,
                rule.priority,
                rule.enabled,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn rule_by_id(&self, id: i64) -> StoreResult<Option<RelayRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, signal_pattern, source_filter, relay_to, transform, priority,
                    enabled, created_at, updated_at, match_count
             FROM relay_rules WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_rule_row)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    /// Overwrite the mutable fields of a rule. Returns false when the id is
    /// unknown.
    pub fn update_rule(&self, rule: &RelayRule, now: i64) -> StoreResult<bool> {
        let affected = self.conn.execute(
            "UPDATE relay_rules
             SET signal_pattern = ?2, source_filter = ?3, relay_to = ?4,
                 transform = ?5, priority = ?6, enabled = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                rule.id,
                rule.signal_pattern,
                rule.source_filter,
                json_text(&rule.relay_to)?,
                rule.transform.as_ref().map(payload_text).transpose()?,
                rule.priority,
                rule.enabled,
                now,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Returns false when the id is unknown.
    pub fn delete_rule(&self, id: i64) -> StoreResult<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM relay_rules WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// All rules (enabled and disabled), priority descending.
    pub fn list_rules(&self) -> StoreResult<Vec<RelayRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, signal_pattern, source_filter, relay_to, transform, priority,
                    enabled, created_at, updated_at, match_count
             FROM relay_rules
             ORDER BY priority DESC, id ASC",
        )?;
        let rows = stmt.query_map([], map_rule_row)?;
        collect_rows(rows)
    }

    /// Enabled rules for a signal type, priority descending. Regex source
    /// filtering happens in the rule engine, not here.
    pub fn enabled_rules_for(&self, signal_type: u16) -> StoreResult<Vec<RelayRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, signal_pattern, source_filter, relay_to, transform, priority,
                    enabled, created_at, updated_at, match_count
             FROM relay_rules
             WHERE enabled = 1 AND signal_pattern = ?1
             ORDER BY priority DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![signal_type], map_rule_row)?;
        collect_rows(rows)
    }

    /// Increment match_count for every listed rule in one statement.
    pub fn bump_match_counts(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = placeholders(ids.len());
        let sql =
            format!("UPDATE relay_rules SET match_count = match_count + 1 WHERE id IN ({placeholders})");
        let bound: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        self.conn.execute(&sql, bound.as_slice())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Offline buffer
    // -----------------------------------------------------------------------

    pub fn insert_buffered(&self, row: &BufferedSignal) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO signal_buffer
                 (id, signal_type, source_server, target_server, payload, priority,
                  buffered_at, retry_count, last_retry_at, max_retries, expires_at,
                  status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.id,
                row.signal_type,
                row.source_server,
                row.target_server,
                payload_text(&row.payload)?,
                row.priority.as_str(),
                row.buffered_at,
                row.retry_count,
                row.last_retry_at,
                row.max_retries,
                row.expires_at,
                row.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn buffered_by_id(&self, id: &str) -> StoreResult<Option<BufferedSignal>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BUFFER_COLUMNS} FROM signal_buffer WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], map_buffered_row)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    /// Mark every overdue pending row expired and return the affected ids.
    /// Runs as one transaction so the sweep is atomic.
    pub fn expire_pending(&mut self, now: i64) -> StoreResult<Vec<String>> {
        let tx = self.conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM signal_buffer
                 WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        tx.execute(
            "UPDATE signal_buffer SET status = 'expired'
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    /// Pending rows still holding retry budget and not yet expired, ordered
    /// by priority desc then oldest first. The backoff-interval filter is
    /// applied by the buffer manager.
    pub fn pending_retryable(&self, now: i64) -> StoreResult<Vec<BufferedSignal>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BUFFER_COLUMNS} FROM signal_buffer
             WHERE status = 'pending'
               AND retry_count < max_retries
               AND (expires_at IS NULL OR expires_at >= ?1)
             ORDER BY {BUFFER_ORDER}"
        ))?;
        let rows = stmt.query_map(params![now], map_buffered_row)?;
        collect_rows(rows)
    }

    /// All pending rows, optionally for one target, ordered like
    /// `pending_retryable`. Used by flush.
    pub fn pending_rows(&self, target: Option<&str>) -> StoreResult<Vec<BufferedSignal>> {
        match target {
            Some(t) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {BUFFER_COLUMNS} FROM signal_buffer
                     WHERE status = 'pending' AND target_server = ?1
                     ORDER BY {BUFFER_ORDER}"
                ))?;
                let rows = stmt.query_map(params![t], map_buffered_row)?;
                collect_rows(rows)
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {BUFFER_COLUMNS} FROM signal_buffer
                     WHERE status = 'pending'
                     ORDER BY {BUFFER_ORDER}"
                ))?;
                let rows = stmt.query_map([], map_buffered_row)?;
                collect_rows(rows)
            }
        }
    }

    /// Pending rows among the given ids (unknown and terminal ids drop out).
    pub fn pending_by_ids(&self, ids: &[String]) -> StoreResult<Vec<BufferedSignal>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {BUFFER_COLUMNS} FROM signal_buffer
             WHERE status = 'pending' AND id IN ({})
             ORDER BY {BUFFER_ORDER}",
            placeholders(ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bound: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(bound.as_slice(), map_buffered_row)?;
        collect_rows(rows)
    }

    /// Newest-first listing for the operator tool surface.
    pub fn list_buffered(&self, target: Option<&str>, limit: usize) -> StoreResult<Vec<BufferedSignal>> {
        match target {
            Some(t) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {BUFFER_COLUMNS} FROM signal_buffer
                     WHERE target_server = ?1
                     ORDER BY buffered_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![t, limit as i64], map_buffered_row)?;
                collect_rows(rows)
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {BUFFER_COLUMNS} FROM signal_buffer
                     ORDER BY buffered_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], map_buffered_row)?;
                collect_rows(rows)
            }
        }
    }

    /// Transition a pending row to delivered. Returns false if the row is
    /// already terminal (or unknown); the guard keeps transitions one-way.
    pub fn mark_delivered(&self, id: &str) -> StoreResult<bool> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer SET status = 'delivered'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Transition a pending row straight to failed (flush path).
    pub fn mark_failed(&self, id: &str) -> StoreResult<bool> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer SET status = 'failed'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Record a failed retry attempt in one statement: bump retry_count,
    /// stamp last_retry_at, and transition to failed when the budget is
    /// exhausted. Returns the row's status after the update, or None when
    /// the row was not pending.
    pub fn record_retry_failure(&self, id: &str, now: i64) -> StoreResult<Option<BufferStatus>> {
        let affected = self.conn.execute(
            "UPDATE signal_buffer
             SET retry_count = retry_count + 1,
                 last_retry_at = ?2,
                 status = CASE WHEN retry_count + 1 >= max_retries
                               THEN 'failed' ELSE 'pending' END
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        let status: String = self.conn.query_row(
            "SELECT status FROM signal_buffer WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let status = BufferStatus::try_from(status.as_str())
            .map_err(|e| StoreError::InvalidData(e.to_owned()))?;
        Ok(Some(status))
    }

    /// Delete buffered rows matching the filter; `ids` wins over the other
    /// filters. Returns the number of rows deleted.
    pub fn delete_buffered(&self, filter: &BufferClearFilter, now: i64) -> StoreResult<usize> {
        if filter.is_empty() {
            return Err(StoreError::InvalidData(
                "clear requires at least one filter".to_owned(),
            ));
        }
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(0);
            }
            let sql = format!(
                "DELETE FROM signal_buffer WHERE id IN ({})",
                placeholders(ids.len())
            );
            let bound: Vec<&dyn rusqlite::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            return Ok(self.conn.execute(&sql, bound.as_slice())?);
        }

        let mut clauses: Vec<String> = Vec::new();
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = &filter.target_server {
            clauses.push(format!("target_server = ?{}", bound.len() + 1));
            bound.push(Box::new(t.clone()));
        }
        if let Some(st) = filter.signal_type {
            clauses.push(format!("signal_type = ?{}", bound.len() + 1));
            bound.push(Box::new(i64::from(st)));
        }
        if let Some(hours) = filter.max_age_hours {
            clauses.push(format!("buffered_at < ?{}", bound.len() + 1));
            bound.push(Box::new(now - hours * 3_600_000));
        }
        let sql = format!("DELETE FROM signal_buffer WHERE {}", clauses.join(" AND "));
        let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        Ok(self.conn.execute(&sql, refs.as_slice())?)
    }

    pub fn pending_count(&self) -> StoreResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM signal_buffer WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Live counts of the four buffer states.
    pub fn buffer_counts(&self) -> StoreResult<BufferCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM signal_buffer GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BufferCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "pending" => counts.pending = n,
                "delivered" => counts.delivered = n,
                "expired" => counts.expired = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Per-(type, source, target) counts of rows buffered inside a period.
    pub fn buffered_key_counts(
        &self,
        period_start: i64,
        period_end: i64,
    ) -> StoreResult<Vec<(u16, String, String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT signal_type, source_server, target_server, COUNT(*)
             FROM signal_buffer
             WHERE buffered_at >= ?1 AND buffered_at < ?2
             GROUP BY signal_type, source_server, target_server",
        )?;
        let rows = stmt.query_map(params![period_start, period_end], |row| {
            Ok((
                row.get::<_, i64>(0)? as u16,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Stats buckets
    // -----------------------------------------------------------------------

    /// Replace all buckets for one period in a single transaction, keeping
    /// re-rollups idempotent (one bucket per dimensional key per period).
    pub fn replace_stats_buckets(
        &mut self,
        period_start: i64,
        buckets: &[StatsBucket],
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM relay_stats WHERE period_start = ?1",
            params![period_start],
        )?;
        for b in buckets {
            tx.execute(
                "INSERT INTO relay_stats
                     (period_start, signal_type, source_server, target_server,
                      total_relayed, success_count, failure_count, avg_latency_ms,
                      max_latency_ms, buffered_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    b.period_start,
                    b.signal_type.map(i64::from),
                    b.source_server,
                    b.target_server,
                    b.total_relayed,
                    b.success_count,
                    b.failure_count,
                    b.avg_latency_ms,
                    b.max_latency_ms,
                    b.buffered_count,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Buckets with `period_start` inside `[since, until]`.
    pub fn stats_buckets(&self, since: i64, until: i64) -> StoreResult<Vec<StatsBucket>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, period_start, signal_type, source_server, target_server,
                    total_relayed, success_count, failure_count, avg_latency_ms,
                    max_latency_ms, buffered_count
             FROM relay_stats
             WHERE period_start >= ?1 AND period_start <= ?2
             ORDER BY period_start ASC",
        )?;
        let rows = stmt.query_map(params![since, until], map_bucket_row)?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Drop history and stats older than the cutoff, plus terminal buffer
    /// rows older than the cutoff. Pending buffer rows are never pruned.
    pub fn prune_before(&self, cutoff: i64) -> StoreResult<usize> {
        let mut total = 0;
        total += self.conn.execute(
            "DELETE FROM signal_relays WHERE relayed_at < ?1",
            params![cutoff],
        )?;
        total += self.conn.execute(
            "DELETE FROM relay_stats WHERE period_start < ?1",
            params![cutoff],
        )?;
        total += self.conn.execute(
            "DELETE FROM signal_buffer WHERE status != 'pending' AND buffered_at < ?1",
            params![cutoff],
        )?;
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

const BUFFER_COLUMNS: &str = "id, signal_type, source_server, target_server, payload, priority,
     buffered_at, retry_count, last_retry_at, max_retries, expires_at, status";

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> StoreResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 1..=n {
        if i > 1 {
            s.push(',');
        }
        s.push('?');
        s.push_str(&i.to_string());
    }
    s
}

fn collect_rows<T>(
    rows: impl Iterator<Item = Result<T, rusqlite::Error>>,
) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn json_text(list: &[String]) -> StoreResult<String> {
    serde_json::to_string(list).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn payload_text(payload: &Payload) -> StoreResult<String> {
    serde_json::to_string(payload).map_err(|e| StoreError::InvalidData(e.to_string()))
}

/// Decode a JSON column inside a row mapper, surfacing parse failures as
/// column conversion errors.
fn column_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    text: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn column_priority(idx: usize, text: &str) -> Result<Priority, rusqlite::Error> {
    Priority::try_from(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(std::io::Error::other(e)))
    })
}

fn map_relay_row(row: &rusqlite::Row<'_>) -> Result<RelayRecord, rusqlite::Error> {
    Ok(RelayRecord {
        id: row.get(0)?,
        signal_type: row.get::<_, i64>(1)? as u16,
        source_server: row.get(2)?,
        target_servers: column_json(3, &row.get::<_, String>(3)?)?,
        payload: column_json(4, &row.get::<_, String>(4)?)?,
        priority: column_priority(5, &row.get::<_, String>(5)?)?,
        relayed_at: row.get(6)?,
        success: row.get(7)?,
        targets_reached: column_json(8, &row.get::<_, String>(8)?)?,
        targets_failed: column_json(9, &row.get::<_, String>(9)?)?,
        latency_ms: row.get(10)?,
        error_message: row.get(11)?,
    })
}

fn map_rule_row(row: &rusqlite::Row<'_>) -> Result<RelayRule, rusqlite::Error> {
    let transform: Option<String> = row.get(4)?;
    Ok(RelayRule {
        id: row.get(0)?,
        signal_pattern: row.get::<_, i64>(1)? as u16,
        source_filter: row.get(2)?,
        relay_to: column_json(3, &row.get::<_, String>(3)?)?,
        transform: transform.as_deref().map(|t| column_json(4, t)).transpose()?,
        priority: row.get(5)?,
        enabled: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        match_count: row.get(9)?,
    })
}

fn map_buffered_row(row: &rusqlite::Row<'_>) -> Result<BufferedSignal, rusqlite::Error> {
    let status: String = row.get(11)?;
    Ok(BufferedSignal {
        id: row.get(0)?,
        signal_type: row.get::<_, i64>(1)? as u16,
        source_server: row.get(2)?,
        target_server: row.get(3)?,
        payload: column_json(4, &row.get::<_, String>(4)?)?,
        priority: column_priority(5, &row.get::<_, String>(5)?)?,
        buffered_at: row.get(6)?,
        retry_count: row.get(7)?,
        last_retry_at: row.get(8)?,
        max_retries: row.get(9)?,
        expires_at: row.get(10)?,
        status: BufferStatus::try_from(status.as_str()).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(std::io::Error::other(e)))
        })?,
    })
}

fn map_bucket_row(row: &rusqlite::Row<'_>) -> Result<StatsBucket, rusqlite::Error> {
    Ok(StatsBucket {
        id: row.get(0)?,
        period_start: row.get(1)?,
        signal_type: row.get::<_, Option<i64>>(2)?.map(|n| n as u16),
        source_server: row.get(3)?,
        target_server: row.get(4)?,
        total_relayed: row.get(5)?,
        success_count: row.get(6)?,
        failure_count: row.get(7)?,
        avg_latency_ms: row.get(8)?,
        max_latency_ms: row.get(9)?,
        buffered_count: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
