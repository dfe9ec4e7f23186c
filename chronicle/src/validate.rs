use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use crate::config::{Config, FkPolicy};
use crate::metrics_consts::{EVENTS_INVALID, EVENTS_VALID, FK_ADVISORY_FAILURES,
    VALIDATION_RULE_FAILURES};
use crate::schema::SchemaRegistry;
use crate::types::{CdcEvent, EventType, ValidEvent};

// Rule tags, used for per-rule failure counters and metric labels
pub const RULE_EVENT_TYPE: &str = "event_type";
pub const RULE_OBJECT_TYPE: &str = "object_type";
pub const RULE_RECORD_ID: &str = "record_id";
pub const RULE_TIMESTAMP: &str = "timestamp";
pub const RULE_SNAPSHOTS: &str = "snapshots";
pub const RULE_REQUIRED_FIELDS: &str = "required_fields";
pub const RULE_FIELD_TYPES: &str = "field_types";
pub const RULE_CHANGED_FIELDS: &str = "changed_fields";
pub const RULE_FOREIGN_KEYS: &str = "foreign_keys";

/// Running validation statistics, injected into the validator and the
/// alert emitter rather than living in a process-wide global, so each
/// processing context (and each test) gets its own counters.
#[derive(Default)]
pub struct ValidationStats {
    total: AtomicU64,
    invalid: AtomicU64,
    rule_failures: DashMap<&'static str, u64>,
}

impl ValidationStats {
    pub fn record_valid(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self, failed_rules: &[&'static str]) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.invalid.fetch_add(1, Ordering::Relaxed);
        for rule in failed_rules.iter().copied() {
            *self.rule_failures.entry(rule).or_insert(0) += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn invalid(&self) -> u64 {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn failure_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.invalid() as f64 / total as f64
    }

    pub fn failures_for(&self, rule: &str) -> u64 {
        self.rule_failures.get(rule).map(|v| *v).unwrap_or(0)
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.invalid.store(0, Ordering::Relaxed);
        self.rule_failures.clear();
    }
}

pub struct Validator {
    registry: Arc<SchemaRegistry>,
    stats: Arc<ValidationStats>,
    fk_policy: FkPolicy,
    future_tolerance: Duration,
    max_age: Duration,
}

impl Validator {
    pub fn new(registry: Arc<SchemaRegistry>, stats: Arc<ValidationStats>, config: &Config) -> Self {
        Self {
            registry,
            stats,
            fk_policy: config.fk_policy,
            future_tolerance: Duration::seconds(config.timestamp_future_tolerance_secs),
            max_age: Duration::days(config.timestamp_max_age_days),
        }
    }

    /// Run every rule, accumulating all failures in rule order. On
    /// success the resolved event type and timestamp come back attached,
    /// so downstream stages never re-parse them.
    pub fn validate(&self, event: &CdcEvent, now: DateTime<Utc>) -> Result<ValidEvent, Vec<String>> {
        let mut errors = Vec::new();
        let mut failed_rules: Vec<&'static str> = Vec::new();

        let event_type = match EventType::from_str(&event.event_type) {
            Ok(t) => Some(t),
            Err(_) => {
                errors.push(format!(
                    "invalid event_type: '{}', must be one of INSERT, UPDATE, DELETE",
                    event.event_type
                ));
                failed_rules.push(RULE_EVENT_TYPE);
                None
            }
        };

        let schema = match self.registry.get(&event.object_type) {
            Some(s) => Some(s),
            None => {
                // Unknown types only poison this event, not the stream
                warn!(
                    object_type = %event.object_type,
                    event_id = %event.event_id,
                    "unknown object_type"
                );
                errors.push(format!("unknown object_type: '{}'", event.object_type));
                failed_rules.push(RULE_OBJECT_TYPE);
                None
            }
        };

        if !self.registry.id_pattern().is_match(&event.record_id) {
            errors.push(format!(
                "invalid record_id format: '{}', must be 15-18 alphanumeric characters",
                event.record_id
            ));
            failed_rules.push(RULE_RECORD_ID);
        }

        let timestamp = match self.check_timestamp(event, now) {
            Ok(ts) => Some(ts),
            Err(e) => {
                errors.push(e);
                failed_rules.push(RULE_TIMESTAMP);
                None
            }
        };

        if let Some(event_type) = event_type {
            if let Some(es) = self.check_snapshots(event, event_type) {
                errors.extend(es);
                failed_rules.push(RULE_SNAPSHOTS);
            }

            if let Some(schema) = schema {
                let missing = self.check_required_fields(event, event_type, schema);
                if !missing.is_empty() {
                    errors.extend(missing);
                    failed_rules.push(RULE_REQUIRED_FIELDS);
                }

                let mismatched = self.check_field_types(event, schema);
                if !mismatched.is_empty() {
                    errors.extend(mismatched);
                    failed_rules.push(RULE_FIELD_TYPES);
                }
            }

            if event_type == EventType::Update {
                if let Some(es) = self.check_changed_fields(event) {
                    errors.extend(es);
                    failed_rules.push(RULE_CHANGED_FIELDS);
                }
            }

            if let Some(schema) = schema {
                let fk_errors = self.check_foreign_keys(event, schema);
                if !fk_errors.is_empty() {
                    match self.fk_policy {
                        FkPolicy::Fatal => {
                            errors.extend(fk_errors);
                            failed_rules.push(RULE_FOREIGN_KEYS);
                        }
                        FkPolicy::Advisory => {
                            for e in &fk_errors {
                                warn!(event_id = %event.event_id, "{e}");
                            }
                            metrics::counter!(FK_ADVISORY_FAILURES)
                                .increment(fk_errors.len() as u64);
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            self.stats.record_valid();
            metrics::counter!(EVENTS_VALID).increment(1);
            // Both unwraps are guarded by the empty error list
            Ok(ValidEvent {
                event: event.clone(),
                event_type: event_type.expect("checked above"),
                timestamp: timestamp.expect("checked above"),
            })
        } else {
            self.stats.record_invalid(&failed_rules);
            metrics::counter!(EVENTS_INVALID).increment(1);
            for rule in failed_rules {
                metrics::counter!(VALIDATION_RULE_FAILURES, "rule" => rule).increment(1);
            }
            Err(errors)
        }
    }

    fn check_timestamp(&self, event: &CdcEvent, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        let ts = DateTime::parse_from_rfc3339(&event.event_timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| {
                format!(
                    "invalid event_timestamp format: '{}', must be ISO 8601",
                    event.event_timestamp
                )
            })?;

        if ts > now + self.future_tolerance {
            return Err(format!(
                "event_timestamp is in the future: '{}'",
                event.event_timestamp
            ));
        }
        if ts < now - self.max_age {
            return Err(format!(
                "event_timestamp is too old: '{}'",
                event.event_timestamp
            ));
        }
        Ok(ts)
    }

    // Exactly one of {before, after} may be absent, and which one is
    // determined by the event type.
    fn check_snapshots(&self, event: &CdcEvent, event_type: EventType) -> Option<Vec<String>> {
        let mut errors = Vec::new();
        match event_type {
            EventType::Insert => {
                if event.after.is_none() {
                    errors.push("missing 'after' data for INSERT event".to_string());
                }
                if event.before.is_some() {
                    errors.push("unexpected 'before' data for INSERT event".to_string());
                }
            }
            EventType::Update => {
                if event.before.is_none() {
                    errors.push("missing 'before' data for UPDATE event".to_string());
                }
                if event.after.is_none() {
                    errors.push("missing 'after' data for UPDATE event".to_string());
                }
            }
            EventType::Delete => {
                if event.before.is_none() {
                    errors.push("missing 'before' data for DELETE event".to_string());
                }
                if event.after.is_some() {
                    errors.push("unexpected 'after' data for DELETE event".to_string());
                }
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors)
        }
    }

    fn check_required_fields(
        &self,
        event: &CdcEvent,
        event_type: EventType,
        schema: &crate::schema::ObjectSchema,
    ) -> Vec<String> {
        let (snapshot, label) = match event_type {
            EventType::Insert | EventType::Update => (event.after.as_ref(), "after"),
            EventType::Delete => (event.before.as_ref(), "before"),
        };
        let Some(snapshot) = snapshot else {
            // Absence itself is reported by the snapshot rule
            return Vec::new();
        };

        schema
            .required_fields
            .iter()
            .filter(|field| snapshot.get(**field).map(Value::is_null).unwrap_or(true))
            .map(|field| format!("required field '{field}' is null or missing in '{label}' data"))
            .collect()
    }

    fn check_field_types(
        &self,
        event: &CdcEvent,
        schema: &crate::schema::ObjectSchema,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        for (snapshot, label) in [(event.before.as_ref(), "before"), (event.after.as_ref(), "after")]
        {
            let Some(snapshot) = snapshot else { continue };
            // Iterate the schema, not the snapshot, for deterministic error order
            let mut fields: Vec<_> = schema.field_types.iter().collect();
            fields.sort_by_key(|(name, _)| *name);
            for (field, expected) in fields {
                if let Some(value) = snapshot.get(*field) {
                    if !expected.matches(value) {
                        errors.push(format!(
                            "field '{field}' has wrong type in '{label}': expected {}",
                            expected.name()
                        ));
                    }
                }
            }
        }
        errors
    }

    fn check_changed_fields(&self, event: &CdcEvent) -> Option<Vec<String>> {
        let Some(changed) = event.changed_fields.as_ref() else {
            return Some(vec!["missing 'changed_fields' for UPDATE event".to_string()]);
        };
        if changed.is_empty() {
            return Some(vec![
                "'changed_fields' cannot be empty for UPDATE event".to_string(),
            ]);
        }

        let mut errors = Vec::new();
        let empty = Map::new();
        let before = event.before.as_ref().unwrap_or(&empty);
        let after = event.after.as_ref().unwrap_or(&empty);
        for field in changed {
            if !before.contains_key(field) {
                errors.push(format!("changed field '{field}' missing from 'before' snapshot"));
            }
            if !after.contains_key(field) {
                errors.push(format!("changed field '{field}' missing from 'after' snapshot"));
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors)
        }
    }

    fn check_foreign_keys(
        &self,
        event: &CdcEvent,
        schema: &crate::schema::ObjectSchema,
    ) -> Vec<String> {
        let Some(after) = event.after.as_ref() else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        for fk in &schema.foreign_keys {
            match after.get(*fk) {
                None => {}
                Some(Value::Null) => {}
                Some(Value::String(v)) if self.registry.id_pattern().is_match(v) => {}
                Some(other) => {
                    let shown = match other {
                        Value::String(s) => s.clone(),
                        v => v.to_string(),
                    };
                    errors.push(format!("foreign key '{fk}' has invalid format: '{shown}'"));
                }
            }
        }
        errors
    }
}
