use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::config::AnomalyPolicy;
use crate::extract::Clock;
use crate::metrics_consts::{HISTORY_ANOMALIES, HISTORY_GROUP_FAILED, HISTORY_NOOP_UPDATES,
    HISTORY_ROWS_CLOSED, HISTORY_STALE_EVENTS, HISTORY_VERSIONS_INSERTED};
use crate::sinks::history::{CloseOp, HistoryStore, HistoryStoreError};
use crate::types::{EventType, HistoryRecord, ValidEvent};

// Fields stamped on by the pipeline, never part of an entity's state
const METADATA_FIELDS: [&str; 6] = [
    "ingestion_timestamp",
    "source",
    "_cdc_event_id",
    "_cdc_event_type",
    "_cdc_event_timestamp",
    "system_modstamp",
];

/// Field-level diff between two snapshots, sorted for determinism.
/// A field absent on one side and null on the other is not a change.
pub fn detect_changes(before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<String> {
    let mut fields: Vec<&str> = before
        .keys()
        .chain(after.keys())
        .map(String::as_str)
        .filter(|f| !METADATA_FIELDS.contains(f))
        .collect();
    fields.sort_unstable();
    fields.dedup();

    fields
        .into_iter()
        .filter(|f| before.get(*f).unwrap_or(&Value::Null) != after.get(*f).unwrap_or(&Value::Null))
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub events: u64,
    pub groups: u64,
    pub versions_inserted: u64,
    pub rows_closed: u64,
    pub noop_updates: u64,
    pub stale_events: u64,
    pub anomalies_synthesized: u64,
    pub anomalies_dropped: u64,
    pub failed_groups: u64,
}

/// A valid event whose required prior state was missing (or conflicting)
/// in the history store. Surfaced to the alert emitter by the caller.
#[derive(Clone, Debug)]
pub struct IntegrityAnomaly {
    pub object_type: String,
    pub record_id: String,
    pub event_id: String,
    pub event_type: EventType,
    pub detail: String,
}

/// A group whose store writes kept failing after retries. The events are
/// returned so the caller can dead-letter them.
pub struct FailedGroup {
    pub object_type: String,
    pub record_id: String,
    pub detail: String,
    pub events: Vec<ValidEvent>,
}

pub struct WindowOutcome {
    pub stats: WindowStats,
    pub anomalies: Vec<IntegrityAnomaly>,
    pub failures: Vec<FailedGroup>,
}

/// Where the walk's "current state" lives: nowhere, in the store, or in
/// a row planned earlier in this window that isn't persisted yet.
enum Cursor {
    None,
    Stored(HistoryRecord),
    Fresh(usize),
}

struct GroupPlan {
    closes: Vec<CloseOp>,
    inserts: Vec<HistoryRecord>,
    rows_closed: u64,
    noop_updates: u64,
    stale_events: u64,
    anomalies_synthesized: u64,
    anomalies_dropped: u64,
    anomalies: Vec<IntegrityAnomaly>,
}

impl GroupPlan {
    fn new() -> Self {
        Self {
            closes: Vec::new(),
            inserts: Vec::new(),
            rows_closed: 0,
            noop_updates: 0,
            stale_events: 0,
            anomalies_synthesized: 0,
            anomalies_dropped: 0,
            anomalies: Vec::new(),
        }
    }

    fn cursor_valid_from(&self, cursor: &Cursor) -> Option<DateTime<Utc>> {
        match cursor {
            Cursor::None => None,
            Cursor::Stored(row) => Some(row.valid_from),
            Cursor::Fresh(idx) => Some(self.inserts[*idx].valid_from),
        }
    }

    fn cursor_data<'a>(&'a self, cursor: &'a Cursor) -> Option<&'a Map<String, Value>> {
        match cursor {
            Cursor::None => None,
            Cursor::Stored(row) => Some(&row.record_data),
            Cursor::Fresh(idx) => Some(&self.inserts[*idx].record_data),
        }
    }

    /// Close the cursor's row at `valid_to`. Stored rows become an UPDATE
    /// against the table; rows planned in this window are amended in place.
    fn close_cursor(&mut self, cursor: &Cursor, valid_to: DateTime<Utc>) {
        match cursor {
            Cursor::None => {}
            Cursor::Stored(row) => {
                self.closes.push(CloseOp {
                    id: row.id.clone(),
                    valid_to,
                });
                self.rows_closed += 1;
            }
            Cursor::Fresh(idx) => {
                self.inserts[*idx].valid_to = Some(valid_to);
                self.inserts[*idx].is_current = false;
                self.rows_closed += 1;
            }
        }
    }

    fn push_version(&mut self, row: HistoryRecord) -> Cursor {
        self.inserts.push(row);
        Cursor::Fresh(self.inserts.len() - 1)
    }
}

/// Plan one entity's history changes for a window of its events, already
/// sorted by `(event_timestamp, event_id)`. Pure: all store effects are
/// described by the returned closes and inserts, closes applying first.
fn plan_group(
    object_type: &str,
    record_id: &str,
    current: Option<HistoryRecord>,
    events: &[ValidEvent],
    ingested_at: DateTime<Utc>,
    policy: AnomalyPolicy,
) -> GroupPlan {
    let mut plan = GroupPlan::new();
    let mut cursor = match current {
        Some(row) => Cursor::Stored(row),
        None => Cursor::None,
    };

    for e in events {
        let ts = e.timestamp;

        // A superseding event must be strictly later than the current
        // version; anything else is a replay or an out-of-order straggler
        // beyond the lateness horizon, and must not rewrite history.
        if let Some(valid_from) = plan.cursor_valid_from(&cursor) {
            if ts <= valid_from {
                warn!(
                    object_type,
                    record_id,
                    event_id = %e.event.event_id,
                    "skipping stale event at or before current version"
                );
                plan.stale_events += 1;
                continue;
            }
        }

        match e.event_type {
            EventType::Insert => {
                let after = e.event.after.clone().unwrap_or_default();
                match plan.cursor_data(&cursor) {
                    None => {
                        cursor = plan.push_version(HistoryRecord {
                            id: record_id.to_string(),
                            valid_from: ts,
                            valid_to: None,
                            is_current: true,
                            change_type: EventType::Insert,
                            changed_fields: vec![],
                            record_data: after,
                            ingestion_timestamp: ingested_at,
                        });
                    }
                    Some(data) => {
                        // An INSERT over live state: replays diff to
                        // nothing, genuine conflicts supersede
                        let diff = detect_changes(data, &after);
                        if diff.is_empty() {
                            plan.noop_updates += 1;
                            continue;
                        }
                        plan.anomalies.push(IntegrityAnomaly {
                            object_type: object_type.to_string(),
                            record_id: record_id.to_string(),
                            event_id: e.event.event_id.clone(),
                            event_type: e.event_type,
                            detail: "INSERT for an entity with a live current row".to_string(),
                        });
                        plan.close_cursor(&cursor, ts);
                        cursor = plan.push_version(HistoryRecord {
                            id: record_id.to_string(),
                            valid_from: ts,
                            valid_to: None,
                            is_current: true,
                            change_type: EventType::Insert,
                            changed_fields: diff,
                            record_data: after,
                            ingestion_timestamp: ingested_at,
                        });
                    }
                }
            }

            EventType::Update => {
                let after = e.event.after.clone().unwrap_or_default();
                match plan.cursor_data(&cursor) {
                    Some(data) => {
                        // The event's changed_fields claim is advisory;
                        // the recomputed diff is the source of truth
                        let diff = detect_changes(data, &after);
                        if diff.is_empty() {
                            plan.noop_updates += 1;
                            continue;
                        }
                        plan.close_cursor(&cursor, ts);
                        cursor = plan.push_version(HistoryRecord {
                            id: record_id.to_string(),
                            valid_from: ts,
                            valid_to: None,
                            is_current: true,
                            change_type: EventType::Update,
                            changed_fields: diff,
                            record_data: after,
                            ingestion_timestamp: ingested_at,
                        });
                    }
                    None => {
                        plan.anomalies.push(IntegrityAnomaly {
                            object_type: object_type.to_string(),
                            record_id: record_id.to_string(),
                            event_id: e.event.event_id.clone(),
                            event_type: e.event_type,
                            detail: "UPDATE with no current history row".to_string(),
                        });
                        match policy {
                            AnomalyPolicy::Synthesize => {
                                let before = e.event.before.clone().unwrap_or_default();
                                cursor = plan.push_version(HistoryRecord {
                                    id: record_id.to_string(),
                                    valid_from: ts,
                                    valid_to: None,
                                    is_current: true,
                                    change_type: EventType::Update,
                                    changed_fields: detect_changes(&before, &after),
                                    record_data: after,
                                    ingestion_timestamp: ingested_at,
                                });
                                plan.anomalies_synthesized += 1;
                            }
                            AnomalyPolicy::DropAndAlert => {
                                plan.anomalies_dropped += 1;
                            }
                        }
                    }
                }
            }

            EventType::Delete => {
                match plan.cursor_data(&cursor) {
                    Some(data) => {
                        let record_data = e.event.before.clone().unwrap_or_else(|| data.clone());
                        plan.close_cursor(&cursor, ts);
                        // The terminal row records the deletion without
                        // claiming to be current; the entity has no live
                        // version afterwards
                        plan.inserts.push(HistoryRecord {
                            id: record_id.to_string(),
                            valid_from: ts,
                            valid_to: Some(ts),
                            is_current: false,
                            change_type: EventType::Delete,
                            changed_fields: vec![],
                            record_data,
                            ingestion_timestamp: ingested_at,
                        });
                        cursor = Cursor::None;
                    }
                    None => {
                        // Nothing to close; synthesizing terminal rows
                        // would duplicate them on replay, so always drop
                        plan.anomalies.push(IntegrityAnomaly {
                            object_type: object_type.to_string(),
                            record_id: record_id.to_string(),
                            event_id: e.event.event_id.clone(),
                            event_type: e.event_type,
                            detail: "DELETE with no current history row".to_string(),
                        });
                        plan.anomalies_dropped += 1;
                    }
                }
            }
        }
    }

    plan
}

/// Applies a window's worth of events to the history store, one entity
/// group at a time.
pub struct HistoryProcessor<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: AnomalyPolicy,
    max_attempts: u64,
    retry_delay_ms: u64,
}

impl<S: HistoryStore> HistoryProcessor<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        policy: AnomalyPolicy,
        max_attempts: u64,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            max_attempts,
            retry_delay_ms,
        }
    }

    /// Process one closed window. Groups by `(object_type, id)`, orders
    /// each group by `(event_timestamp, event_id)`, and applies closes
    /// before inserts per group, so at most one row per id is current at
    /// every commit point. Failures are isolated to their group.
    pub async fn process_window(&self, events: Vec<ValidEvent>) -> WindowOutcome {
        let mut outcome = WindowOutcome {
            stats: WindowStats {
                events: events.len() as u64,
                ..Default::default()
            },
            anomalies: Vec::new(),
            failures: Vec::new(),
        };

        let mut groups: HashMap<(String, String), Vec<ValidEvent>> = HashMap::new();
        for event in events {
            groups
                .entry((event.event.object_type.clone(), event.event.record_id.clone()))
                .or_default()
                .push(event);
        }
        outcome.stats.groups = groups.len() as u64;

        let mut keys: Vec<_> = groups.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let (object_type, record_id) = &key;
            let mut events = groups.remove(&key).expect("key came from the map");
            events.sort_by(|a, b| {
                (a.timestamp, &a.event.event_id).cmp(&(b.timestamp, &b.event.event_id))
            });

            let mut attempt: u64 = 1;
            let applied = loop {
                let result = self
                    .fetch_plan_apply(object_type, record_id, &events)
                    .await;
                match result {
                    Ok(plan) => break Some(plan),
                    Err(e) if attempt < self.max_attempts => {
                        let jitter = rand::random::<u64>() % 50;
                        let delay = attempt * self.retry_delay_ms + jitter;
                        warn!(
                            %object_type,
                            %record_id,
                            "history write failed: {:?}, sleeping for {}ms", e, delay
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        error!(
                            %object_type,
                            %record_id,
                            "history write failed after {} attempts: {:?}", attempt, e
                        );
                        metrics::counter!(HISTORY_GROUP_FAILED).increment(1);
                        outcome.stats.failed_groups += 1;
                        outcome.failures.push(FailedGroup {
                            object_type: object_type.clone(),
                            record_id: record_id.clone(),
                            detail: e.to_string(),
                            events,
                        });
                        break None;
                    }
                }
            };

            let Some(plan) = applied else { continue };

            outcome.stats.versions_inserted += plan.inserts.len() as u64;
            outcome.stats.rows_closed += plan.rows_closed;
            outcome.stats.noop_updates += plan.noop_updates;
            outcome.stats.stale_events += plan.stale_events;
            outcome.stats.anomalies_synthesized += plan.anomalies_synthesized;
            outcome.stats.anomalies_dropped += plan.anomalies_dropped;
            outcome.anomalies.extend(plan.anomalies);
        }

        metrics::counter!(HISTORY_VERSIONS_INSERTED).increment(outcome.stats.versions_inserted);
        metrics::counter!(HISTORY_ROWS_CLOSED).increment(outcome.stats.rows_closed);
        metrics::counter!(HISTORY_NOOP_UPDATES).increment(outcome.stats.noop_updates);
        metrics::counter!(HISTORY_STALE_EVENTS).increment(outcome.stats.stale_events);
        metrics::counter!(HISTORY_ANOMALIES, "action" => "synthesized")
            .increment(outcome.stats.anomalies_synthesized);
        metrics::counter!(HISTORY_ANOMALIES, "action" => "dropped")
            .increment(outcome.stats.anomalies_dropped);

        outcome
    }

    // Refetching on retry keeps the plan honest if a previous attempt
    // died between the close and the insert.
    async fn fetch_plan_apply(
        &self,
        object_type: &str,
        record_id: &str,
        events: &[ValidEvent],
    ) -> Result<GroupPlan, HistoryStoreError> {
        let current = self.store.fetch_current(object_type, record_id).await?;
        let plan = plan_group(
            object_type,
            record_id,
            current,
            events,
            self.clock.now(),
            self.policy,
        );
        self.store
            .apply(object_type, &plan.closes, &plan.inserts)
            .await?;
        Ok(plan)
    }
}
