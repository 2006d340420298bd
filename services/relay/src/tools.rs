//! Operator tool surface: four transport-neutral operations.
//!
//! Each operation validates its inputs (client errors) before touching the
//! engine (whose failures surface as server errors), and returns a JSON
//! value ready for whatever transport hosts the tools. Numeric rates and
//! latencies are rounded to two decimals at this boundary, nowhere deeper.
//!
//! `retry_on_fail` and `include_failures` are accepted for compatibility
//! and are advisory: buffering is governed solely by `buffer_if_offline`,
//! and failure counts are always included.

use crate::buffer::BufferError;
use crate::engine::{EngineError, RelayEngine};
use crate::model::{Payload, Priority, RelayRequest, TransformSpec, now_ms};
use crate::rules::{RuleError, RulePatch};
use crate::stats::GroupBy;
use crate::storage::{BufferClearFilter, NewRule};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    /// The request itself is malformed; the caller should fix and resend.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The engine failed; the request may succeed on retry.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ToolError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidRequest(msg) => ToolError::InvalidRequest(msg),
            EngineError::Rule(RuleError::InvalidRule(msg)) => ToolError::InvalidRequest(msg),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<RuleError> for ToolError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::InvalidRule(msg) => ToolError::InvalidRequest(msg),
            RuleError::Store(e) => ToolError::Internal(e.to_string()),
        }
    }
}

impl From<BufferError> for ToolError {
    fn from(e: BufferError) -> Self {
        ToolError::Internal(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySignalParams {
    pub signal_type: u16,
    pub target_servers: Vec<String>,
    #[serde(default)]
    pub payload: Payload,
    pub priority: Option<String>,
    /// Advisory; accepted and ignored.
    pub retry_on_fail: Option<bool>,
    pub buffer_if_offline: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureRelayParams {
    pub action: String,
    pub rule_id: Option<i64>,
    pub signal_pattern: Option<u16>,
    pub source_filter: Option<String>,
    pub relay_to: Option<Vec<String>>,
    pub transform: Option<TransformSpec>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayStatsParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub group_by: Option<String>,
    /// Advisory; failure counts are always included.
    pub include_failures: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BufferSignalsParams {
    pub action: String,
    pub buffer_ids: Option<Vec<String>>,
    pub target_server: Option<String>,
    pub signal_type: Option<u16>,
    pub max_age_hours: Option<i64>,
}

/// Rows returned by `buffer_signals {action: list}`.
const LIST_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// ToolSurface
// ---------------------------------------------------------------------------

/// The four operator operations, bound to one engine handle.
pub struct ToolSurface {
    engine: RelayEngine,
}

impl ToolSurface {
    pub fn new(engine: RelayEngine) -> Self {
        ToolSurface { engine }
    }

    /// `relay_signal`: fan a signal out to named targets.
    pub async fn relay_signal(&self, params: RelaySignalParams) -> Result<Value, ToolError> {
        if params.target_servers.is_empty() {
            return Err(ToolError::InvalidRequest(
                "target_servers must name at least one peer".to_owned(),
            ));
        }
        let priority = match params.priority.as_deref() {
            Some(s) => Priority::try_from(s)
                .map_err(|e| ToolError::InvalidRequest(format!("{e}: '{s}'")))?,
            None => Priority::Normal,
        };
        let _ = params.retry_on_fail;

        let result = self
            .engine
            .relay_signal(RelayRequest {
                signal_type: params.signal_type,
                source_server: self.engine.node_name().to_owned(),
                target_servers: params.target_servers,
                payload: params.payload,
                priority,
                buffer_if_offline: params.buffer_if_offline.unwrap_or(true),
            })
            .await?;
        serde_json::to_value(&result).map_err(|e| ToolError::Internal(e.to_string()))
    }

    /// `configure_relay`: rule CRUD.
    pub async fn configure_relay(&self, params: ConfigureRelayParams) -> Result<Value, ToolError> {
        match params.action.as_str() {
            "add" => {
                let signal_pattern = params.signal_pattern.ok_or_else(|| {
                    ToolError::InvalidRequest("add requires signal_pattern".to_owned())
                })?;
                let relay_to = params.relay_to.unwrap_or_default();
                if relay_to.is_empty() {
                    return Err(ToolError::InvalidRequest(
                        "add requires a non-empty relay_to".to_owned(),
                    ));
                }
                let rule_id = self
                    .engine
                    .rules()
                    .add_rule(
                        NewRule {
                            signal_pattern,
                            source_filter: params.source_filter,
                            relay_to,
                            transform: params.transform,
                            priority: params.priority.unwrap_or(0),
                            enabled: params.enabled.unwrap_or(true),
                        },
                        now_ms(),
                    )
                    .await?;
                Ok(json!({ "rule_id": rule_id, "action": "add", "success": true }))
            }
            "update" => {
                let rule_id = require_rule_id(params.rule_id, "update")?;
                let success = self
                    .engine
                    .rules()
                    .update_rule(
                        rule_id,
                        RulePatch {
                            signal_pattern: params.signal_pattern,
                            source_filter: params.source_filter,
                            relay_to: params.relay_to,
                            transform: params.transform,
                            priority: params.priority,
                            enabled: params.enabled,
                        },
                        now_ms(),
                    )
                    .await?;
                Ok(json!({ "rule_id": rule_id, "action": "update", "success": success }))
            }
            "remove" => {
                let rule_id = require_rule_id(params.rule_id, "remove")?;
                let success = self.engine.rules().remove_rule(rule_id).await?;
                Ok(json!({ "rule_id": rule_id, "action": "remove", "success": success }))
            }
            "list" => {
                let rules = self.engine.rules().list_rules().await?;
                Ok(json!({ "action": "list", "success": true, "rules": rules }))
            }
            other => Err(ToolError::InvalidRequest(format!(
                "unknown action '{other}' (expected add/update/remove/list)"
            ))),
        }
    }

    /// `get_relay_stats`: aggregate query over the stats window.
    pub async fn get_relay_stats(&self, params: RelayStatsParams) -> Result<Value, ToolError> {
        let since = params.since.unwrap_or_else(|| now_ms() - 24 * 3_600_000);
        let group_by = params
            .group_by
            .as_deref()
            .map(GroupBy::try_from)
            .transpose()
            .map_err(|e| ToolError::InvalidRequest(e.to_owned()))?;
        let _ = params.include_failures;

        let summary = self
            .engine
            .stats()
            .query(since, params.until, group_by)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        let by_group = summary.by_group.map(|groups| {
            groups
                .into_iter()
                .map(|(key, g)| {
                    (
                        key,
                        json!({
                            "count": g.count,
                            "success_rate": round2(g.success_rate),
                            "avg_latency": g.avg_latency.map(round2),
                        }),
                    )
                })
                .collect::<serde_json::Map<String, Value>>()
        });

        let mut response = json!({
            "total_relayed": summary.total_relayed,
            "success_rate": round2(summary.success_rate),
            "avg_latency_ms": summary.avg_latency_ms.map(round2),
            "buffer_stats": summary.buffer_stats,
        });
        if let Some(groups) = by_group {
            response["by_group"] = Value::Object(groups);
        }
        Ok(response)
    }

    /// `buffer_signals`: list / retry / clear / flush the offline buffer.
    pub async fn buffer_signals(&self, params: BufferSignalsParams) -> Result<Value, ToolError> {
        match params.action.as_str() {
            "list" => {
                let items = self
                    .engine
                    .buffer()
                    .list(params.target_server.as_deref(), LIST_LIMIT)
                    .await?;
                Ok(json!({
                    "action": "list",
                    "affected_count": items.len(),
                    "buffer_items": items,
                }))
            }
            "retry" => {
                let ids = params.buffer_ids.ok_or_else(|| {
                    ToolError::InvalidRequest("retry requires buffer_ids".to_owned())
                })?;
                let tally = self.engine.buffer().retry_buffered(&ids).await?;
                Ok(json!({
                    "action": "retry",
                    "affected_count": tally.attempted,
                    "delivered": tally.delivered,
                    "failed": tally.failed,
                }))
            }
            "clear" => {
                let filter = BufferClearFilter {
                    ids: params.buffer_ids,
                    target_server: params.target_server,
                    signal_type: params.signal_type,
                    max_age_hours: params.max_age_hours,
                };
                if filter.is_empty() {
                    return Err(ToolError::InvalidRequest(
                        "clear requires at least one filter".to_owned(),
                    ));
                }
                let deleted = self.engine.buffer().clear(&filter).await?;
                Ok(json!({ "action": "clear", "affected_count": deleted }))
            }
            "flush" => {
                let tally = self
                    .engine
                    .buffer()
                    .flush(params.target_server.as_deref())
                    .await?;
                Ok(json!({
                    "action": "flush",
                    "affected_count": tally.attempted,
                    "delivered": tally.delivered,
                    "failed": tally.failed,
                }))
            }
            other => Err(ToolError::InvalidRequest(format!(
                "unknown action '{other}' (expected list/retry/clear/flush)"
            ))),
        }
    }
}

fn require_rule_id(rule_id: Option<i64>, action: &str) -> Result<i64, ToolError> {
    rule_id.ok_or_else(|| ToolError::InvalidRequest(format!("{action} requires rule_id")))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
