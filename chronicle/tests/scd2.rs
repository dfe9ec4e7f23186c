use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronicle::config::AnomalyPolicy;
use chronicle::extract::FixedClock;
use chronicle::scd2::HistoryProcessor;
use chronicle::sinks::history::{CloseOp, HistoryStore, HistoryStoreError, MemoryHistoryStore};
use chronicle::types::{CdcEvent, EventType, HistoryRecord, ValidEvent};
use serde_json::{json, Map, Value};

const ACCOUNT_ID: &str = "001000000000001AAA";

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn snapshot(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => panic!("snapshot must be an object"),
    }
}

fn event(
    event_id: &str,
    event_type: EventType,
    at: &str,
    before: Option<Value>,
    after: Option<Value>,
) -> ValidEvent {
    event_for(ACCOUNT_ID, event_id, event_type, at, before, after)
}

fn event_for(
    record_id: &str,
    event_id: &str,
    event_type: EventType,
    at: &str,
    before: Option<Value>,
    after: Option<Value>,
) -> ValidEvent {
    ValidEvent {
        event: CdcEvent {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            object_type: "Account".to_string(),
            record_id: record_id.to_string(),
            event_timestamp: at.to_string(),
            changed_fields: None,
            before: before.map(snapshot),
            after: after.map(snapshot),
            source: Some("cdc_simulator".to_string()),
        },
        event_type,
        timestamp: ts(at),
    }
}

fn processor(
    store: Arc<MemoryHistoryStore>,
    policy: AnomalyPolicy,
) -> HistoryProcessor<MemoryHistoryStore> {
    let clock = Arc::new(FixedClock(ts("2024-03-01T12:00:00Z")));
    HistoryProcessor::new(store, clock, policy, 3, 1)
}

async fn assert_at_most_one_current(store: &MemoryHistoryStore, id: &str) {
    let current: Vec<_> = store
        .rows_for("Account", id)
        .await
        .into_iter()
        .filter(|r| r.is_current)
        .collect();
    assert!(
        current.len() <= 1,
        "{} current rows for {id}",
        current.len()
    );
}

#[tokio::test]
async fn insert_with_no_history_creates_the_first_version() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    let outcome = processor
        .process_window(vec![event(
            "evt-1",
            EventType::Insert,
            "2024-03-01T00:00:00Z",
            None,
            Some(json!({"id": "A1", "name": "Acme"})),
        )])
        .await;

    assert_eq!(outcome.stats.versions_inserted, 1);
    assert!(outcome.anomalies.is_empty());

    let rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.valid_from, ts("2024-03-01T00:00:00Z"));
    assert_eq!(row.valid_to, None);
    assert!(row.is_current);
    assert_eq!(row.change_type, EventType::Insert);
    assert!(row.changed_fields.is_empty());
    assert_eq!(row.record_data, snapshot(json!({"id": "A1", "name": "Acme"})));
}

#[tokio::test]
async fn update_closes_the_prior_version_and_opens_a_new_one() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    processor
        .process_window(vec![event(
            "evt-1",
            EventType::Insert,
            "2024-03-01T00:00:00Z",
            None,
            Some(json!({"id": "A1", "name": "Acme"})),
        )])
        .await;

    // The update lands in a later window, so the prior version is fetched
    // from the store rather than carried in the batch
    let outcome = processor
        .process_window(vec![event(
            "evt-2",
            EventType::Update,
            "2024-03-01T01:00:00Z",
            Some(json!({"id": "A1", "name": "Acme"})),
            Some(json!({"id": "A1", "name": "Acme Corp"})),
        )])
        .await;

    assert_eq!(outcome.stats.versions_inserted, 1);
    assert_eq!(outcome.stats.rows_closed, 1);

    let rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows.len(), 2);

    let closed = &rows[0];
    assert!(!closed.is_current);
    assert_eq!(closed.valid_to, Some(ts("2024-03-01T01:00:00Z")));

    let current = &rows[1];
    assert!(current.is_current);
    assert_eq!(current.valid_from, ts("2024-03-01T01:00:00Z"));
    assert_eq!(current.changed_fields, vec!["name"]);
    assert_eq!(
        current.record_data,
        snapshot(json!({"id": "A1", "name": "Acme Corp"}))
    );
    assert_at_most_one_current(&store, ACCOUNT_ID).await;
}

#[tokio::test]
async fn redundant_update_produces_no_new_version() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    processor
        .process_window(vec![event(
            "evt-1",
            EventType::Insert,
            "2024-03-01T00:00:00Z",
            None,
            Some(json!({"id": "A1", "name": "Acme"})),
        )])
        .await;

    // `after` is identical to the current row's state
    let outcome = processor
        .process_window(vec![event(
            "evt-2",
            EventType::Update,
            "2024-03-01T01:00:00Z",
            Some(json!({"id": "A1", "name": "Acme"})),
            Some(json!({"id": "A1", "name": "Acme"})),
        )])
        .await;

    assert_eq!(outcome.stats.noop_updates, 1);
    assert_eq!(outcome.stats.versions_inserted, 0);

    let rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_current);
    assert_eq!(rows[0].valid_from, ts("2024-03-01T00:00:00Z"));
}

#[tokio::test]
async fn replaying_the_same_events_is_a_noop() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    let window = vec![
        event(
            "evt-1",
            EventType::Insert,
            "2024-03-01T00:00:00Z",
            None,
            Some(json!({"id": "A1", "name": "Acme"})),
        ),
        event(
            "evt-2",
            EventType::Update,
            "2024-03-01T01:00:00Z",
            Some(json!({"id": "A1", "name": "Acme"})),
            Some(json!({"id": "A1", "name": "Acme Corp"})),
        ),
    ];

    processor.process_window(window.clone()).await;
    let rows_before = store.rows_for("Account", ACCOUNT_ID).await;

    // Replay the whole window (e.g. after an upstream log re-read)
    let outcome = processor.process_window(window).await;
    assert_eq!(outcome.stats.versions_inserted, 0);

    let rows_after = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows_before, rows_after);
    assert_at_most_one_current(&store, ACCOUNT_ID).await;
}

#[tokio::test]
async fn out_of_arrival_order_events_apply_in_timestamp_order() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    // The UPDATE (t2) arrived before the INSERT (t1); both fell within
    // the window's lateness allowance, so they share a batch
    let outcome = processor
        .process_window(vec![
            event(
                "evt-2",
                EventType::Update,
                "2024-03-01T02:00:00Z",
                Some(json!({"id": "A1", "name": "Acme"})),
                Some(json!({"id": "A1", "name": "Acme Corp"})),
            ),
            event(
                "evt-1",
                EventType::Insert,
                "2024-03-01T01:00:00Z",
                None,
                Some(json!({"id": "A1", "name": "Acme"})),
            ),
        ])
        .await;

    assert_eq!(outcome.stats.versions_inserted, 2);
    assert!(outcome.anomalies.is_empty());

    let rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].change_type, EventType::Insert);
    assert_eq!(rows[0].valid_from, ts("2024-03-01T01:00:00Z"));
    assert_eq!(rows[0].valid_to, Some(ts("2024-03-01T02:00:00Z")));
    assert!(!rows[0].is_current);
    assert_eq!(rows[1].change_type, EventType::Update);
    assert!(rows[1].is_current);
    assert_at_most_one_current(&store, ACCOUNT_ID).await;
}

#[tokio::test]
async fn delete_closes_the_current_row_and_writes_a_terminal_row() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    processor
        .process_window(vec![
            event(
                "evt-1",
                EventType::Insert,
                "2024-03-01T00:00:00Z",
                None,
                Some(json!({"id": "A1", "name": "Acme"})),
            ),
            event(
                "evt-2",
                EventType::Update,
                "2024-03-01T01:00:00Z",
                Some(json!({"id": "A1", "name": "Acme"})),
                Some(json!({"id": "A1", "name": "Acme Corp"})),
            ),
        ])
        .await;

    let outcome = processor
        .process_window(vec![event(
            "evt-3",
            EventType::Delete,
            "2024-03-01T02:00:00Z",
            Some(json!({"id": "A1", "name": "Acme Corp"})),
            None,
        )])
        .await;

    assert_eq!(outcome.stats.rows_closed, 1);
    assert_eq!(outcome.stats.versions_inserted, 1);

    let rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows.len(), 3);

    let closed = &rows[1];
    assert_eq!(closed.valid_to, Some(ts("2024-03-01T02:00:00Z")));
    assert!(!closed.is_current);

    let terminal = &rows[2];
    assert_eq!(terminal.change_type, EventType::Delete);
    assert_eq!(terminal.valid_from, ts("2024-03-01T02:00:00Z"));
    assert_eq!(terminal.valid_to, Some(ts("2024-03-01T02:00:00Z")));
    assert!(!terminal.is_current);
    assert_eq!(
        terminal.record_data,
        snapshot(json!({"id": "A1", "name": "Acme Corp"}))
    );

    // Post-delete, zero current rows
    assert!(store
        .fetch_current("Account", ACCOUNT_ID)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn full_lifecycle_holds_the_single_current_invariant() {
    let store = Arc::new(MemoryHistoryStore::new());
    let processor = processor(store.clone(), AnomalyPolicy::Synthesize);

    let second_id = "001000000000002AAA";
    processor
        .process_window(vec![
            event(
                "evt-1",
                EventType::Insert,
                "2024-03-01T00:00:00Z",
                None,
                Some(json!({"id": "A1", "name": "Acme"})),
            ),
            event_for(
                second_id,
                "evt-2",
                EventType::Insert,
                "2024-03-01T00:10:00Z",
                None,
                Some(json!({"id": "A2", "name": "Globex"})),
            ),
            event(
                "evt-3",
                EventType::Update,
                "2024-03-01T00:20:00Z",
                Some(json!({"id": "A1", "name": "Acme"})),
                Some(json!({"id": "A1", "name": "Acme Corp"})),
            ),
            event(
                "evt-4",
                EventType::Update,
                "2024-03-01T00:30:00Z",
                Some(json!({"id": "A1", "name": "Acme Corp"})),
                Some(json!({"id": "A1", "name": "Acme Corp Intl"})),
            ),
        ])
        .await;

    assert_at_most_one_current(&store, ACCOUNT_ID).await;
    assert_at_most_one_current(&store, second_id).await;

    let a1_rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(a1_rows.len(), 3);
    // valid_to of each closed version equals valid_from of its successor
    assert_eq!(a1_rows[0].valid_to, Some(a1_rows[1].valid_from));
    assert_eq!(a1_rows[1].valid_to, Some(a1_rows[2].valid_from));
    assert_eq!(a1_rows[2].valid_to, None);

    let a2_rows = store.rows_for("Account", second_id).await;
    assert_eq!(a2_rows.len(), 1);
    assert!(a2_rows[0].is_current);
}

#[tokio::test]
async fn update_without_prior_state_follows_the_anomaly_policy() {
    let orphan_update = |id: &str| {
        event_for(
            id,
            "evt-1",
            EventType::Update,
            "2024-03-01T01:00:00Z",
            Some(json!({"id": "X", "name": "Acme"})),
            Some(json!({"id": "X", "name": "Acme Corp"})),
        )
    };

    // Synthesize: the event's own snapshots seed a new current version
    let store = Arc::new(MemoryHistoryStore::new());
    let p = processor(store.clone(), AnomalyPolicy::Synthesize);
    let outcome = p.process_window(vec![orphan_update(ACCOUNT_ID)]).await;
    assert_eq!(outcome.stats.anomalies_synthesized, 1);
    assert_eq!(outcome.anomalies.len(), 1);
    assert!(outcome.anomalies[0].detail.contains("UPDATE with no current"));
    let rows = store.rows_for("Account", ACCOUNT_ID).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_current);
    assert_eq!(rows[0].changed_fields, vec!["name"]);

    // Drop-and-alert: nothing is written
    let store = Arc::new(MemoryHistoryStore::new());
    let p = processor(store.clone(), AnomalyPolicy::DropAndAlert);
    let outcome = p.process_window(vec![orphan_update(ACCOUNT_ID)]).await;
    assert_eq!(outcome.stats.anomalies_dropped, 1);
    assert_eq!(outcome.anomalies.len(), 1);
    assert!(store.rows_for("Account", ACCOUNT_ID).await.is_empty());
}

#[tokio::test]
async fn delete_without_prior_state_is_dropped_with_an_alert() {
    let store = Arc::new(MemoryHistoryStore::new());
    let p = processor(store.clone(), AnomalyPolicy::Synthesize);
    let outcome = p
        .process_window(vec![event(
            "evt-1",
            EventType::Delete,
            "2024-03-01T01:00:00Z",
            Some(json!({"id": "A1", "name": "Acme"})),
            None,
        )])
        .await;

    assert_eq!(outcome.stats.anomalies_dropped, 1);
    assert_eq!(outcome.anomalies.len(), 1);
    assert!(outcome.anomalies[0].detail.contains("DELETE with no current"));
    assert!(store.rows_for("Account", ACCOUNT_ID).await.is_empty());
}

/// Store wrapper that fails `apply` a configured number of times before
/// delegating, to exercise the per-group retry path.
struct FlakyStore {
    inner: MemoryHistoryStore,
    apply_failures: AtomicU64,
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn fetch_current(
        &self,
        object_type: &str,
        id: &str,
    ) -> Result<Option<HistoryRecord>, HistoryStoreError> {
        self.inner.fetch_current(object_type, id).await
    }

    async fn apply(
        &self,
        object_type: &str,
        closes: &[CloseOp],
        inserts: &[HistoryRecord],
    ) -> Result<(), HistoryStoreError> {
        if self
            .apply_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HistoryStoreError::Corrupt("synthetic write failure".into()));
        }
        self.inner.apply(object_type, closes, inserts).await
    }
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let store = Arc::new(FlakyStore {
        inner: MemoryHistoryStore::new(),
        apply_failures: AtomicU64::new(2),
    });
    let clock = Arc::new(FixedClock(ts("2024-03-01T12:00:00Z")));
    let p = HistoryProcessor::new(store.clone(), clock, AnomalyPolicy::Synthesize, 3, 1);

    let outcome = p
        .process_window(vec![event(
            "evt-1",
            EventType::Insert,
            "2024-03-01T00:00:00Z",
            None,
            Some(json!({"id": "A1", "name": "Acme"})),
        )])
        .await;

    assert_eq!(outcome.stats.versions_inserted, 1);
    assert!(outcome.failures.is_empty());
    assert_eq!(store.inner.rows_for("Account", ACCOUNT_ID).await.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_group() {
    // More failures than one group's retry budget, but the second group
    // (processed after the first, in sorted id order) gets a recovered
    // store and must still land
    let store = Arc::new(FlakyStore {
        inner: MemoryHistoryStore::new(),
        apply_failures: AtomicU64::new(3),
    });
    let clock = Arc::new(FixedClock(ts("2024-03-01T12:00:00Z")));
    let p = HistoryProcessor::new(store.clone(), clock, AnomalyPolicy::Synthesize, 3, 1);

    let second_id = "001000000000002AAA";
    let outcome = p
        .process_window(vec![
            event(
                "evt-1",
                EventType::Insert,
                "2024-03-01T00:00:00Z",
                None,
                Some(json!({"id": "A1", "name": "Acme"})),
            ),
            event_for(
                second_id,
                "evt-2",
                EventType::Insert,
                "2024-03-01T00:10:00Z",
                None,
                Some(json!({"id": "A2", "name": "Globex"})),
            ),
        ])
        .await;

    assert_eq!(outcome.stats.failed_groups, 1);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].record_id, ACCOUNT_ID);
    assert_eq!(outcome.failures[0].events.len(), 1);

    assert!(store.inner.rows_for("Account", ACCOUNT_ID).await.is_empty());
    assert_eq!(store.inner.rows_for("Account", second_id).await.len(), 1);
}
