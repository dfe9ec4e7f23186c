use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Provenance tag stamped on every row we write
pub const CDC_SOURCE_TAG: &str = "salesforce_cdc";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for EventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(EventType::Insert),
            "UPDATE" => Ok(EventType::Update),
            "DELETE" => Ok(EventType::Delete),
            _ => Err(()),
        }
    }
}

/// A change notification as it arrives on the wire.
///
/// `event_type` and `object_type` stay raw strings here so that bad
/// values surface as validation failures (alerted, with the full error
/// list) instead of serde errors that would send the whole payload to
/// the dead letter topic.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CdcEvent {
    pub event_id: String,
    pub event_type: String,
    pub object_type: String,
    pub record_id: String,
    pub event_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Map<String, Value>>,
    #[serde(default)]
    pub source: Option<String>,
}

impl CdcEvent {
    /// The snapshot a flat row should be built from: post-state for
    /// INSERT/UPDATE, prior state for DELETE.
    pub fn relevant_snapshot(&self, event_type: EventType) -> Option<&Map<String, Value>> {
        match event_type {
            EventType::Insert | EventType::Update => self.after.as_ref(),
            EventType::Delete => self.before.as_ref(),
        }
    }
}

/// A CdcEvent that passed validation, with the fields the rest of the
/// pipeline needs already resolved. Built by the validator only.
#[derive(Clone, Debug)]
pub struct ValidEvent {
    pub event: CdcEvent,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// The flattened row destined for a raw table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtractedRecord {
    pub object_type: String,
    pub record_id: String,
    /// Snapshot fields, complex values already stringified
    pub fields: Map<String, Value>,
    pub ingestion_timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "_cdc_event_id")]
    pub cdc_event_id: String,
    #[serde(rename = "_cdc_event_type")]
    pub cdc_event_type: EventType,
    #[serde(rename = "_cdc_event_timestamp")]
    pub cdc_event_timestamp: DateTime<Utc>,
}

/// One row per distinct validity interval of an entity (SCD Type 2).
/// `(id, valid_from)` is the row key; at most one row per id is current.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
    pub change_type: EventType,
    pub changed_fields: Vec<String>,
    pub record_data: Map<String, Value>,
    pub ingestion_timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum AlertSeverity {
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "CRITICAL")]
    Critical,
}

/// Outbound data-quality alert, published to the alerts topic.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub validation_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
}

/// Serialize nested structures to their string-encoded form; scalars
/// pass through unchanged. Raw tables store complex fields as strings.
pub fn stringify_complex(value: Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) => {
            // Maps and arrays always serialize cleanly
            Value::String(serde_json::to_string(&value).expect("json value serializes"))
        }
        other => other,
    }
}
