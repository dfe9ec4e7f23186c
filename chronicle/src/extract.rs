use chrono::{DateTime, Utc};
use serde_json::Map;

use crate::types::{stringify_complex, ExtractedRecord, ValidEvent, CDC_SOURCE_TAG};

/// The only non-determinism in extraction is the ingestion timestamp, so
/// the clock is injected and tests supply a fixed one.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for tests and replays.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Derive the flat row for the raw table from a validated event: the
/// relevant snapshot with complex values stringified, plus ingestion
/// metadata and the CDC trace fields.
pub fn extract_record(valid: &ValidEvent, clock: &dyn Clock) -> ExtractedRecord {
    let snapshot = valid
        .event
        .relevant_snapshot(valid.event_type)
        .cloned()
        .unwrap_or_default();

    let mut fields = Map::with_capacity(snapshot.len());
    for (key, value) in snapshot {
        fields.insert(key, stringify_complex(value));
    }

    ExtractedRecord {
        object_type: valid.event.object_type.clone(),
        record_id: valid.event.record_id.clone(),
        fields,
        ingestion_timestamp: clock.now(),
        source: CDC_SOURCE_TAG.to_string(),
        cdc_event_id: valid.event.event_id.clone(),
        cdc_event_type: valid.event_type,
        cdc_event_timestamp: valid.timestamp,
    }
}
