use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use crate::config::Config;
use crate::metrics_consts::{REALTIME_ROWS_UPSERTED, REALTIME_WRITE_ATTEMPT};
use crate::types::ExtractedRecord;

/// Upserts windowed micro-batches into the per-object raw tables.
pub struct RawTableWriter {
    pool: PgPool,
    table_prefix: String,
    max_attempts: u64,
    retry_delay_ms: u64,
}

impl RawTableWriter {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            table_prefix: config.raw_table_prefix.clone(),
            max_attempts: config.sink_write_max_attempts,
            retry_delay_ms: config.sink_retry_delay_ms,
        }
    }

    fn table_name(&self, object_type: &str) -> String {
        format!("{}{}", self.table_prefix, object_type.to_lowercase())
    }

    /// Write one window's records for one object type, retrying with
    /// backoff and jitter. Exhausted retries bubble up so the caller can
    /// dead-letter the batch; later windows are unaffected.
    pub async fn write_batch_with_retries(
        &self,
        object_type: &str,
        records: &[ExtractedRecord],
    ) -> Result<u64, sqlx::Error> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tries: u64 = 1;
        loop {
            match self.write_batch(object_type, records).await {
                Ok(count) => {
                    metrics::counter!(REALTIME_WRITE_ATTEMPT, "result" => "success").increment(1);
                    metrics::counter!(REALTIME_ROWS_UPSERTED).increment(count);
                    return Ok(count);
                }
                Err(e) => {
                    if tries == self.max_attempts {
                        metrics::counter!(REALTIME_WRITE_ATTEMPT, "result" => "failed")
                            .increment(1);
                        return Err(e);
                    }
                    metrics::counter!(REALTIME_WRITE_ATTEMPT, "result" => "retry").increment(1);
                    let jitter = rand::random::<u64>() % 50;
                    let delay = tries * self.retry_delay_ms + jitter;
                    warn!("Raw batch write failed: {:?}, sleeping for {}ms", e, delay);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    tries += 1;
                }
            }
        }
    }

    async fn write_batch(
        &self,
        object_type: &str,
        records: &[ExtractedRecord],
    ) -> Result<u64, sqlx::Error> {
        let mut ids = Vec::with_capacity(records.len());
        let mut datas: Vec<Value> = Vec::with_capacity(records.len());
        let mut ingestion_timestamps = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut event_ids = Vec::with_capacity(records.len());
        let mut event_types = Vec::with_capacity(records.len());
        let mut event_timestamps = Vec::with_capacity(records.len());

        for rec in records {
            ids.push(rec.record_id.clone());
            datas.push(Value::Object(rec.fields.clone()));
            ingestion_timestamps.push(rec.ingestion_timestamp);
            sources.push(rec.source.clone());
            event_ids.push(rec.cdc_event_id.clone());
            event_types.push(rec.cdc_event_type.to_string());
            event_timestamps.push(rec.cdc_event_timestamp);
        }

        // The timestamp guard makes replayed batches no-ops instead of
        // churning rows backwards
        let sql = format!(
            r#"
            INSERT INTO "{table}" (id, data, ingestion_timestamp, source,
                                   _cdc_event_id, _cdc_event_type, _cdc_event_timestamp)
            SELECT * FROM UNNEST($1::text[], $2::jsonb[], $3::timestamptz[], $4::text[],
                                 $5::text[], $6::text[], $7::timestamptz[])
            ON CONFLICT (id) DO UPDATE SET
                data = EXCLUDED.data,
                ingestion_timestamp = EXCLUDED.ingestion_timestamp,
                source = EXCLUDED.source,
                _cdc_event_id = EXCLUDED._cdc_event_id,
                _cdc_event_type = EXCLUDED._cdc_event_type,
                _cdc_event_timestamp = EXCLUDED._cdc_event_timestamp
            WHERE "{table}"._cdc_event_timestamp < EXCLUDED._cdc_event_timestamp
            "#,
            table = self.table_name(object_type)
        );

        let result = sqlx::query(&sql)
            .bind(&ids)
            .bind(&datas)
            .bind(&ingestion_timestamps)
            .bind(&sources)
            .bind(&event_ids)
            .bind(&event_types)
            .bind(&event_timestamps)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Collapse a window's records to one row per entity, keeping the one
/// with the latest event timestamp (ties broken by event id). Postgres
/// refuses to update the same row twice in a single upsert statement.
pub fn dedupe_batch(records: Vec<ExtractedRecord>) -> Vec<ExtractedRecord> {
    let mut latest: HashMap<String, ExtractedRecord> = HashMap::with_capacity(records.len());
    for rec in records {
        match latest.get(&rec.record_id) {
            Some(existing)
                if (existing.cdc_event_timestamp, &existing.cdc_event_id)
                    >= (rec.cdc_event_timestamp, &rec.cdc_event_id) => {}
            _ => {
                latest.insert(rec.record_id.clone(), rec);
            }
        }
    }
    let mut deduped: Vec<_> = latest.into_values().collect();
    deduped.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use chrono::{DateTime, Utc};
    use serde_json::Map;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(id: &str, event_id: &str, event_ts: &str) -> ExtractedRecord {
        ExtractedRecord {
            object_type: "Account".to_string(),
            record_id: id.to_string(),
            fields: Map::new(),
            ingestion_timestamp: ts(event_ts),
            source: "salesforce_cdc".to_string(),
            cdc_event_id: event_id.to_string(),
            cdc_event_type: EventType::Update,
            cdc_event_timestamp: ts(event_ts),
        }
    }

    #[test]
    fn dedupe_keeps_the_latest_event_per_entity() {
        let batch = vec![
            record("A1", "evt-2", "2024-03-01T10:00:05Z"),
            record("A1", "evt-1", "2024-03-01T10:00:01Z"),
            record("B1", "evt-3", "2024-03-01T10:00:02Z"),
        ];
        let deduped = dedupe_batch(batch);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].record_id, "A1");
        assert_eq!(deduped[0].cdc_event_id, "evt-2");
        assert_eq!(deduped[1].record_id, "B1");
    }

    #[test]
    fn dedupe_breaks_timestamp_ties_by_event_id() {
        let batch = vec![
            record("A1", "evt-b", "2024-03-01T10:00:05Z"),
            record("A1", "evt-a", "2024-03-01T10:00:05Z"),
        ];
        let deduped = dedupe_batch(batch);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].cdc_event_id, "evt-b");
    }

    #[test]
    fn dedupe_of_distinct_entities_is_an_identity() {
        let batch = vec![
            record("A1", "evt-1", "2024-03-01T10:00:01Z"),
            record("B1", "evt-2", "2024-03-01T10:00:02Z"),
        ];
        assert_eq!(dedupe_batch(batch).len(), 2);
    }
}
