//! Relay statistics: periodic rollup of raw history into hourly buckets,
//! and the query API over them.
//!
//! A rollup covers the previous aligned hour. Each relay record is expanded
//! per target: one contribution to the `(signal_type, source, target)` key.
//! Re-rolling a period replaces its buckets, so buckets stay unique per key.
//!
//! The query's `avg_latency_ms` is a sample-weighted mean of bucket means,
//! an accepted approximation of the true per-relay mean given the rollup
//! design.

use crate::events::{EventBus, topics};
use crate::model::{BufferCounts, StatsBucket, now_ms};
use crate::storage::{Store, StoreError};
use chrono::DateTime;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const HOUR_MS: i64 = 3_600_000;
/// Row cap per rollup tick.
const ROLLUP_CAP: usize = 10_000;

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    SignalType,
    Source,
    Target,
    Hour,
    Day,
}

impl TryFrom<&str> for GroupBy {
    type Error = &'static str;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "signal_type" => Ok(GroupBy::SignalType),
            "source" => Ok(GroupBy::Source),
            "target" => Ok(GroupBy::Target),
            "hour" => Ok(GroupBy::Hour),
            "day" => Ok(GroupBy::Day),
            _ => Err("invalid group_by"),
        }
    }
}

/// Per-group aggregate in a query response.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct GroupStats {
    pub count: i64,
    /// Percentage in [0, 100].
    pub success_rate: f64,
    pub avg_latency: Option<f64>,
}

/// Query response over a stats window.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_relayed: i64,
    /// Percentage in [0, 100]; zero when the window is empty.
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_group: Option<BTreeMap<String, GroupStats>>,
    pub buffer_stats: BufferCounts,
}

// ---------------------------------------------------------------------------
// StatsAggregator
// ---------------------------------------------------------------------------

pub struct StatsAggregator {
    store: Arc<Mutex<Store>>,
    events: EventBus,
}

impl StatsAggregator {
    pub fn new(store: Arc<Mutex<Store>>, events: EventBus) -> Self {
        StatsAggregator { store, events }
    }

    /// Roll up the previous aligned hour relative to now.
    pub async fn run_rollup(&self) -> Result<usize, StoreError> {
        self.run_rollup_at(now_ms()).await
    }

    /// Roll up the previous aligned hour relative to `now`. Returns the
    /// number of buckets written.
    pub async fn run_rollup_at(&self, now: i64) -> Result<usize, StoreError> {
        let period_start = ((now - HOUR_MS) / HOUR_MS) * HOUR_MS;
        let period_end = period_start + HOUR_MS;

        let mut store = self.store.lock().await;
        let records = store.relays_since(period_start, ROLLUP_CAP)?;
        let buffered = store.buffered_key_counts(period_start, period_end)?;

        // Expand each record per target into its dimensional key. The read
        // is bounded below only; rows newer than the period boundary land
        // in this period's buckets.
        let mut acc: BTreeMap<(u16, String, String), Contribution> = BTreeMap::new();
        for record in &records {
            for target in &record.target_servers {
                let entry = acc
                    .entry((
                        record.signal_type,
                        record.source_server.clone(),
                        target.clone(),
                    ))
                    .or_default();
                entry.total += 1;
                if record.targets_reached.iter().any(|t| t == target) {
                    entry.success += 1;
                }
                if record.targets_failed.iter().any(|t| t == target) {
                    entry.failure += 1;
                }
                entry.latency_samples.push(record.latency_ms);
            }
        }

        let buffered_by_key: BTreeMap<(u16, String, String), i64> = buffered
            .into_iter()
            .map(|(ty, src, tgt, n)| ((ty, src, tgt), n))
            .collect();

        let buckets: Vec<StatsBucket> = acc
            .into_iter()
            .map(|((signal_type, source, target), c)| {
                let buffered_count = buffered_by_key
                    .get(&(signal_type, source.clone(), target.clone()))
                    .copied()
                    .unwrap_or(0);
                StatsBucket {
                    id: 0,
                    period_start,
                    signal_type: Some(signal_type),
                    source_server: Some(source),
                    target_server: Some(target),
                    total_relayed: c.total,
                    success_count: c.success,
                    failure_count: c.failure,
                    avg_latency_ms: c.avg_latency(),
                    max_latency_ms: c.latency_samples.iter().copied().max(),
                    buffered_count,
                }
            })
            .collect();

        store.replace_stats_buckets(period_start, &buckets)?;
        drop(store);

        info!(period_start, buckets = buckets.len(), "stats rollup complete");
        self.events.emit(
            topics::STATS_UPDATE,
            json!({ "period_start": period_start, "buckets": buckets.len() }),
        );
        Ok(buckets.len())
    }

    /// Aggregate the buckets whose period falls inside `[since, until]`.
    pub async fn query(
        &self,
        since: i64,
        until: Option<i64>,
        group_by: Option<GroupBy>,
    ) -> Result<StatsSummary, StoreError> {
        let until = until.unwrap_or_else(now_ms);
        let store = self.store.lock().await;
        let buckets = store.stats_buckets(since, until)?;
        let buffer_stats = store.buffer_counts()?;
        drop(store);

        let total: i64 = buckets.iter().map(|b| b.total_relayed).sum();
        let success: i64 = buckets.iter().map(|b| b.success_count).sum();
        let success_rate = rate(success, total);
        let avg_latency_ms = weighted_avg(buckets.iter());

        let by_group = group_by.map(|mode| {
            let mut groups: BTreeMap<String, Vec<&StatsBucket>> = BTreeMap::new();
            for bucket in &buckets {
                groups.entry(group_key(bucket, mode)).or_default().push(bucket);
            }
            groups
                .into_iter()
                .map(|(key, members)| {
                    let count: i64 = members.iter().map(|b| b.total_relayed).sum();
                    let success: i64 = members.iter().map(|b| b.success_count).sum();
                    let stats = GroupStats {
                        count,
                        success_rate: rate(success, count),
                        avg_latency: weighted_avg(members.into_iter()),
                    };
                    (key, stats)
                })
                .collect()
        });

        Ok(StatsSummary {
            total_relayed: total,
            success_rate,
            avg_latency_ms,
            by_group,
            buffer_stats,
        })
    }
}

#[derive(Default)]
struct Contribution {
    total: i64,
    success: i64,
    failure: i64,
    latency_samples: Vec<i64>,
}

impl Contribution {
    fn avg_latency(&self) -> Option<f64> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let sum: i64 = self.latency_samples.iter().sum();
        Some(sum as f64 / self.latency_samples.len() as f64)
    }
}

fn rate(success: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64 * 100.0
    }
}

/// Sample-weighted mean of bucket means, restricted to buckets that carry a
/// latency average.
fn weighted_avg<'a>(buckets: impl Iterator<Item = &'a StatsBucket>) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight = 0i64;
    for bucket in buckets {
        if let Some(avg) = bucket.avg_latency_ms {
            weighted_sum += avg * bucket.total_relayed as f64;
            weight += bucket.total_relayed;
        }
    }
    if weight == 0 {
        None
    } else {
        Some(weighted_sum / weight as f64)
    }
}

fn group_key(bucket: &StatsBucket, mode: GroupBy) -> String {
    match mode {
        GroupBy::SignalType => format!("signal_{}", bucket.signal_type.unwrap_or(0)),
        GroupBy::Source => bucket
            .source_server
            .clone()
            .unwrap_or_else(|| "unknown".to_owned()),
        GroupBy::Target => bucket
            .target_server
            .clone()
            .unwrap_or_else(|| "unknown".to_owned()),
        GroupBy::Hour => format_period(bucket.period_start, "%Y-%m-%dT%H"),
        GroupBy::Day => format_period(bucket.period_start, "%Y-%m-%d"),
    }
}

fn format_period(period_start: i64, fmt: &str) -> String {
    match DateTime::from_timestamp_millis(period_start) {
        Some(dt) => dt.format(fmt).to_string(),
        None => "invalid".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Payload, Priority, RelayRecord};

    fn record(
        id: &str,
        relayed_at: i64,
        source: &str,
        targets: &[&str],
        reached: &[&str],
        latency_ms: i64,
    ) -> RelayRecord {
        let targets: Vec<String> = targets.iter().map(|s| (*s).to_owned()).collect();
        let reached: Vec<String> = reached.iter().map(|s| (*s).to_owned()).collect();
        let failed = targets
            .iter()
            .filter(|t| !reached.contains(t))
            .cloned()
            .collect();
        RelayRecord {
            id: id.to_owned(),
            signal_type: 0x50,
            source_server: source.to_owned(),
            target_servers: targets,
            payload: Payload::new(),
            priority: Priority::Normal,
            relayed_at,
            success: !reached.is_empty(),
            targets_reached: reached,
            targets_failed: failed,
            latency_ms,
            error_message: None,
        }
    }

    fn aggregator() -> StatsAggregator {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        StatsAggregator::new(store, EventBus::new(16))
    }

    #[tokio::test]
    async fn rollup_expands_records_per_target() {
        let agg = aggregator();
        let now = 10 * HOUR_MS;
        {
            let store = agg.store.lock().await;
            store
                .insert_relay(&record("r1", now - HOUR_MS + 1, "x", &["a", "b"], &["a"], 10))
                .unwrap();
            store
                .insert_relay(&record("r2", now - HOUR_MS + 2, "x", &["a"], &["a"], 20))
                .unwrap();
        }

        let written = agg.run_rollup_at(now).await.unwrap();
        assert_eq!(written, 2, "one bucket per (type, source, target) key");

        let buckets = agg.store.lock().await.stats_buckets(0, now).unwrap();
        let a = buckets
            .iter()
            .find(|b| b.target_server.as_deref() == Some("a"))
            .unwrap();
        assert_eq!(a.total_relayed, 2);
        assert_eq!(a.success_count, 2);
        assert_eq!(a.failure_count, 0);
        assert_eq!(a.avg_latency_ms, Some(15.0));
        assert_eq!(a.max_latency_ms, Some(20));

        let b = buckets
            .iter()
            .find(|b| b.target_server.as_deref() == Some("b"))
            .unwrap();
        assert_eq!(b.total_relayed, 1);
        assert_eq!(b.success_count, 0);
        assert_eq!(b.failure_count, 1);
    }

    #[tokio::test]
    async fn query_totals_and_rate_bounds() {
        let agg = aggregator();
        let now = 10 * HOUR_MS;
        {
            let store = agg.store.lock().await;
            store
                .insert_relay(&record("r1", now - HOUR_MS + 1, "x", &["a"], &["a"], 5))
                .unwrap();
            store
                .insert_relay(&record("r2", now - HOUR_MS + 2, "x", &["a"], &["a"], 7))
                .unwrap();
            store
                .insert_relay(&record("r3", now - HOUR_MS + 3, "x", &["a"], &[], 9))
                .unwrap();
        }
        agg.run_rollup_at(now).await.unwrap();

        let summary = agg.query(0, Some(now), None).await.unwrap();
        assert_eq!(summary.total_relayed, 3);
        assert!((summary.success_rate - 200.0 / 3.0).abs() < 1e-9);
        assert!(summary.success_rate >= 0.0 && summary.success_rate <= 100.0);
        assert_eq!(summary.avg_latency_ms, Some(7.0));
    }

    #[tokio::test]
    async fn empty_window_reports_zero_rate_and_no_latency() {
        let agg = aggregator();
        let summary = agg.query(0, Some(1), None).await.unwrap();
        assert_eq!(summary.total_relayed, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.avg_latency_ms, None);
    }

    #[tokio::test]
    async fn group_by_source_matches_scenario_shape() {
        let agg = aggregator();
        let now = 10 * HOUR_MS;
        {
            let store = agg.store.lock().await;
            for (id, reached) in [("r1", true), ("r2", true), ("r3", false)] {
                let reached: &[&str] = if reached { &["a"] } else { &[] };
                store
                    .insert_relay(&record(id, now - HOUR_MS + 1, "X", &["a"], reached, 3))
                    .unwrap();
            }
        }
        agg.run_rollup_at(now).await.unwrap();

        let summary = agg
            .query(0, Some(now), Some(GroupBy::Source))
            .await
            .unwrap();
        let groups = summary.by_group.expect("grouped");
        let x = groups.get("X").expect("source group");
        assert_eq!(x.count, 3);
        assert!((x.success_rate - 200.0 / 3.0).abs() < 1e-9);
        assert!(x.avg_latency.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn hour_and_day_group_keys_are_iso_prefixes() {
        // 2023-11-14T22:00:00Z
        let period = 1_700_000_400_000 / HOUR_MS * HOUR_MS;
        let bucket = StatsBucket {
            id: 0,
            period_start: period,
            signal_type: Some(0x50),
            source_server: Some("s".to_owned()),
            target_server: Some("t".to_owned()),
            total_relayed: 1,
            success_count: 1,
            failure_count: 0,
            avg_latency_ms: None,
            max_latency_ms: None,
            buffered_count: 0,
        };
        let hour_key = group_key(&bucket, GroupBy::Hour);
        let day_key = group_key(&bucket, GroupBy::Day);
        assert_eq!(hour_key.len(), "YYYY-MM-DDTHH".len());
        assert!(hour_key.starts_with(&day_key));
        assert_eq!(group_key(&bucket, GroupBy::SignalType), "signal_80");
    }

    #[tokio::test]
    async fn weighted_average_restricts_to_buckets_with_samples() {
        let with = StatsBucket {
            id: 0,
            period_start: 0,
            signal_type: None,
            source_server: None,
            target_server: None,
            total_relayed: 3,
            success_count: 3,
            failure_count: 0,
            avg_latency_ms: Some(10.0),
            max_latency_ms: Some(12),
            buffered_count: 0,
        };
        let without = StatsBucket {
            avg_latency_ms: None,
            total_relayed: 97,
            ..with.clone()
        };
        let avg = weighted_avg([&with, &without].into_iter()).unwrap();
        assert!((avg - 10.0).abs() < 1e-9, "latency-free buckets carry no weight");
    }
}
