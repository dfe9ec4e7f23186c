use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{EventType, HistoryRecord};

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt history row: {0}")]
    Corrupt(String),
}

/// Close an existing current row at `valid_to`.
#[derive(Clone, Debug)]
pub struct CloseOp {
    pub id: String,
    pub valid_to: DateTime<Utc>,
}

/// The history table surface the SCD2 processor needs: read the current
/// version of an entity, and apply a window's changes. Implementations
/// must apply closes before inserts so no commit point ever shows two
/// current rows for one id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn fetch_current(
        &self,
        object_type: &str,
        id: &str,
    ) -> Result<Option<HistoryRecord>, HistoryStoreError>;

    async fn apply(
        &self,
        object_type: &str,
        closes: &[CloseOp],
        inserts: &[HistoryRecord],
    ) -> Result<(), HistoryStoreError>;
}

pub struct PostgresHistoryStore {
    pool: PgPool,
    table_suffix: String,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool, table_suffix: String) -> Self {
        Self { pool, table_suffix }
    }

    // Object types come from the schema registry, so the interpolated
    // identifier is never attacker-controlled.
    fn table_name(&self, object_type: &str) -> String {
        format!("{}{}", object_type.to_lowercase(), self.table_suffix)
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn fetch_current(
        &self,
        object_type: &str,
        id: &str,
    ) -> Result<Option<HistoryRecord>, HistoryStoreError> {
        let sql = format!(
            r#"
            SELECT id, valid_from, valid_to, is_current, change_type,
                   changed_fields, record_data, ingestion_timestamp
            FROM "{}"
            WHERE id = $1 AND is_current
            LIMIT 1
            "#,
            self.table_name(object_type)
        );

        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let change_type: String = row.try_get("change_type")?;
        let change_type = EventType::from_str(&change_type)
            .map_err(|_| HistoryStoreError::Corrupt(format!("change_type '{change_type}'")))?;

        let changed_fields: Value = row.try_get("changed_fields")?;
        let changed_fields = serde_json::from_value(changed_fields)
            .map_err(|e| HistoryStoreError::Corrupt(format!("changed_fields: {e}")))?;

        let record_data: Value = row.try_get("record_data")?;
        let Value::Object(record_data) = record_data else {
            return Err(HistoryStoreError::Corrupt("record_data is not an object".into()));
        };

        Ok(Some(HistoryRecord {
            id: row.try_get("id")?,
            valid_from: row.try_get("valid_from")?,
            valid_to: row.try_get("valid_to")?,
            is_current: row.try_get("is_current")?,
            change_type,
            changed_fields,
            record_data,
            ingestion_timestamp: row.try_get("ingestion_timestamp")?,
        }))
    }

    async fn apply(
        &self,
        object_type: &str,
        closes: &[CloseOp],
        inserts: &[HistoryRecord],
    ) -> Result<(), HistoryStoreError> {
        if closes.is_empty() && inserts.is_empty() {
            return Ok(());
        }

        let table = self.table_name(object_type);
        let mut tx = self.pool.begin().await?;

        if !closes.is_empty() {
            let (ids, valid_tos): (Vec<String>, Vec<DateTime<Utc>>) = closes
                .iter()
                .map(|c| (c.id.clone(), c.valid_to))
                .unzip();

            let sql = format!(
                r#"
                UPDATE "{table}" AS h
                SET valid_to = c.valid_to, is_current = FALSE
                FROM UNNEST($1::text[], $2::timestamptz[]) AS c(id, valid_to)
                WHERE h.id = c.id AND h.is_current
                "#
            );
            sqlx::query(&sql)
                .bind(&ids)
                .bind(&valid_tos)
                .execute(&mut *tx)
                .await?;
        }

        if !inserts.is_empty() {
            let mut ids = Vec::with_capacity(inserts.len());
            let mut valid_froms = Vec::with_capacity(inserts.len());
            let mut valid_tos: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(inserts.len());
            let mut is_currents = Vec::with_capacity(inserts.len());
            let mut change_types = Vec::with_capacity(inserts.len());
            let mut changed_fields: Vec<Value> = Vec::with_capacity(inserts.len());
            let mut record_datas: Vec<Value> = Vec::with_capacity(inserts.len());
            let mut ingestion_timestamps = Vec::with_capacity(inserts.len());

            for rec in inserts {
                ids.push(rec.id.clone());
                valid_froms.push(rec.valid_from);
                valid_tos.push(rec.valid_to);
                is_currents.push(rec.is_current);
                change_types.push(rec.change_type.to_string());
                changed_fields.push(Value::from(
                    rec.changed_fields
                        .iter()
                        .map(|f| Value::String(f.clone()))
                        .collect::<Vec<_>>(),
                ));
                record_datas.push(Value::Object(rec.record_data.clone()));
                ingestion_timestamps.push(rec.ingestion_timestamp);
            }

            let sql = format!(
                r#"
                INSERT INTO "{table}" (id, valid_from, valid_to, is_current, change_type,
                                       changed_fields, record_data, ingestion_timestamp)
                SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::timestamptz[],
                                     $4::boolean[], $5::text[], $6::jsonb[], $7::jsonb[],
                                     $8::timestamptz[])
                "#
            );
            sqlx::query(&sql)
                .bind(&ids)
                .bind(&valid_froms)
                .bind(&valid_tos)
                .bind(&is_currents)
                .bind(&change_types)
                .bind(&changed_fields)
                .bind(&record_datas)
                .bind(&ingestion_timestamps)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// In-memory store, for local development and the processor test suite.
#[derive(Default)]
pub struct MemoryHistoryStore {
    tables: RwLock<HashMap<String, Vec<HistoryRecord>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows for an object type, insertion order.
    pub async fn rows(&self, object_type: &str) -> Vec<HistoryRecord> {
        self.tables
            .read()
            .await
            .get(object_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Rows for one entity, insertion order.
    pub async fn rows_for(&self, object_type: &str, id: &str) -> Vec<HistoryRecord> {
        self.rows(object_type)
            .await
            .into_iter()
            .filter(|r| r.id == id)
            .collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn fetch_current(
        &self,
        object_type: &str,
        id: &str,
    ) -> Result<Option<HistoryRecord>, HistoryStoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(object_type)
            .and_then(|rows| rows.iter().find(|r| r.id == id && r.is_current))
            .cloned())
    }

    async fn apply(
        &self,
        object_type: &str,
        closes: &[CloseOp],
        inserts: &[HistoryRecord],
    ) -> Result<(), HistoryStoreError> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(object_type.to_string()).or_default();

        for close in closes {
            for row in rows.iter_mut() {
                if row.id == close.id && row.is_current {
                    row.valid_to = Some(close.valid_to);
                    row.is_current = false;
                }
            }
        }
        rows.extend(inserts.iter().cloned());
        Ok(())
    }
}
