//! Relay rule engine: CRUD, signal matching, and payload transforms.
//!
//! Matching is two-stage: the store narrows to enabled rules with the exact
//! signal pattern, then the optional `source_filter` regex is applied here.
//! A filter that fails to compile is treated as "no filter"; a malformed
//! rule must not poison the matcher. Compiled regexes are cached by pattern
//! text.
//!
//! Match-count bumps happen under the same store lock as the query, so the
//! counter can never under-count concurrent matches.

use crate::model::{Payload, RelayRule, TransformSpec};
use crate::storage::{NewRule, Store, StoreError};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

/// Partial update for `update_rule`. Unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub signal_pattern: Option<u16>,
    pub source_filter: Option<String>,
    pub relay_to: Option<Vec<String>>,
    pub transform: Option<TransformSpec>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// RuleEngine
// ---------------------------------------------------------------------------

pub struct RuleEngine {
    store: Arc<Mutex<Store>>,
    /// Pattern text → compiled regex; `None` records a failed compile so the
    /// failure is logged once, not per match.
    regex_cache: StdMutex<HashMap<String, Option<Regex>>>,
}

impl RuleEngine {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        RuleEngine {
            store,
            regex_cache: StdMutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Add a rule and return its id. `relay_to` must be non-empty.
    pub async fn add_rule(&self, rule: NewRule, now: i64) -> Result<i64, RuleError> {
        if rule.relay_to.is_empty() {
            return Err(RuleError::InvalidRule("relay_to must not be empty".to_owned()));
        }
        Ok(self.store.lock().await.insert_rule(&rule, now)?)
    }

    /// Apply a partial update. Returns false when the id is unknown.
    pub async fn update_rule(
        &self,
        id: i64,
        patch: RulePatch,
        now: i64,
    ) -> Result<bool, RuleError> {
        if let Some(targets) = &patch.relay_to
            && targets.is_empty()
        {
            return Err(RuleError::InvalidRule("relay_to must not be empty".to_owned()));
        }

        let store = self.store.lock().await;
        let Some(mut rule) = store.rule_by_id(id)? else {
            return Ok(false);
        };
        if let Some(v) = patch.signal_pattern {
            rule.signal_pattern = v;
        }
        if let Some(v) = patch.source_filter {
            rule.source_filter = Some(v);
        }
        if let Some(v) = patch.relay_to {
            rule.relay_to = v;
        }
        if let Some(v) = patch.transform {
            rule.transform = Some(v);
        }
        if let Some(v) = patch.priority {
            rule.priority = v;
        }
        if let Some(v) = patch.enabled {
            rule.enabled = v;
        }
        Ok(store.update_rule(&rule, now)?)
    }

    /// Returns false when the id is unknown.
    pub async fn remove_rule(&self, id: i64) -> Result<bool, RuleError> {
        Ok(self.store.lock().await.delete_rule(id)?)
    }

    /// All rules, enabled and disabled, priority descending.
    pub async fn list_rules(&self) -> Result<Vec<RelayRule>, RuleError> {
        Ok(self.store.lock().await.list_rules()?)
    }

    // -----------------------------------------------------------------------
    // Matching
    // -----------------------------------------------------------------------

    /// Enabled rules matching the signal type whose source filter (if any)
    /// matches `source_server`. Each returned rule's match_count is bumped
    /// atomically with the query.
    pub async fn match_rules(
        &self,
        signal_type: u16,
        source_server: &str,
    ) -> Result<Vec<RelayRule>, RuleError> {
        let store = self.store.lock().await;
        let candidates = store.enabled_rules_for(signal_type)?;
        let matched: Vec<RelayRule> = candidates
            .into_iter()
            .filter(|rule| self.source_matches(rule, source_server))
            .collect();
        let ids: Vec<i64> = matched.iter().map(|r| r.id).collect();
        store.bump_match_counts(&ids)?;
        Ok(matched)
    }

    /// Deduplicated union of `relay_to` across all matched rules.
    pub async fn auto_relay_targets(
        &self,
        signal_type: u16,
        source_server: &str,
    ) -> Result<Vec<String>, RuleError> {
        let matched = self.match_rules(signal_type, source_server).await?;
        let mut targets: Vec<String> = Vec::new();
        for rule in matched {
            for target in rule.relay_to {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        Ok(targets)
    }

    fn source_matches(&self, rule: &RelayRule, source_server: &str) -> bool {
        let Some(pattern) = &rule.source_filter else {
            return true;
        };
        let mut cache = self.regex_cache.lock().expect("regex cache poisoned");
        let compiled = cache.entry(pattern.clone()).or_insert_with(|| {
            match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(rule_id = rule.id, pattern = %pattern, error = %e,
                        "invalid source_filter regex, treating as no filter");
                    None
                }
            }
        });
        match compiled {
            Some(re) => re.is_match(source_server),
            // Invalid regex: the rule still matches on signal type alone.
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Apply one transform spec, producing a new payload.
///
/// Entries apply in the spec's own key order: `null` deletes the key, an
/// object of shape `{"rename": "src"}` (when `src` exists in the current
/// output) moves that field under the entry's key, and any other value is
/// set verbatim, overwriting.
pub fn apply_transform(payload: &Payload, spec: &TransformSpec) -> Payload {
    let mut output = payload.clone();
    for (key, op) in spec {
        match op {
            Value::Null => {
                output.remove(key);
            }
            Value::Object(obj) if obj.len() == 1 => {
                match obj.get("rename").and_then(Value::as_str) {
                    Some(src) if output.contains_key(src) => {
                        let moved = output.remove(src).unwrap_or(Value::Null);
                        output.insert(key.clone(), moved);
                    }
                    // Not a rename (or source absent): plain literal set.
                    _ => {
                        output.insert(key.clone(), op.clone());
                    }
                }
            }
            other => {
                output.insert(key.clone(), other.clone());
            }
        }
    }
    output
}

/// Compose every matched rule's transform over the payload. `rules` must
/// already be in priority-descending order (as returned by `match_rules`).
pub fn apply_rule_transforms(payload: &Payload, rules: &[RelayRule]) -> Payload {
    let mut output = payload.clone();
    for rule in rules {
        if let Some(spec) = &rule.transform {
            output = apply_transform(&output, spec);
        }
    }
    output
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
