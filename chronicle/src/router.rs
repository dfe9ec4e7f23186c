use std::hash::Hasher;
use std::sync::Arc;

use siphasher::sip::SipHasher13;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::metrics_consts::UNKNOWN_OBJECT_DROPPED;
use crate::schema::SchemaRegistry;
use crate::types::{ExtractedRecord, ValidEvent};

/// Stable shard assignment for an entity. Routing every event for a
/// `(object_type, record_id)` pair to the same worker is what serializes
/// per-entity history writes without any store-level locking.
pub fn shard_for(object_type: &str, record_id: &str, shards: usize) -> usize {
    let mut hasher = SipHasher13::new();
    hasher.write(object_type.as_bytes());
    hasher.write(&[0]);
    hasher.write(record_id.as_bytes());
    (hasher.finish() % shards as u64) as usize
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown object_type: {0}")]
    UnknownObjectType(String),
    #[error("worker channels closed")]
    Closed,
}

/// Fans validated events out to both processing paths, sharded by
/// entity. Every valid event goes to the real-time writer AND the
/// history processor.
pub struct ObjectRouter {
    registry: Arc<SchemaRegistry>,
    realtime: Vec<mpsc::Sender<ExtractedRecord>>,
    history: Vec<mpsc::Sender<ValidEvent>>,
}

impl ObjectRouter {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        realtime: Vec<mpsc::Sender<ExtractedRecord>>,
        history: Vec<mpsc::Sender<ValidEvent>>,
    ) -> Self {
        assert!(!realtime.is_empty() && !history.is_empty());
        Self {
            registry,
            realtime,
            history,
        }
    }

    /// Sends block when a worker's channel is full, which is exactly how
    /// sink backpressure propagates upstream to slowed consumption.
    pub async fn route(
        &self,
        valid: ValidEvent,
        record: ExtractedRecord,
    ) -> Result<(), RouteError> {
        let object_type = valid.event.object_type.as_str();

        // The validator already vetted this; a miss here means a
        // misconfigured registry, which is worth a warning but not a crash
        if !self.registry.contains(object_type) {
            warn!(object_type, "record for unregistered object_type dropped");
            metrics::counter!(UNKNOWN_OBJECT_DROPPED).increment(1);
            return Err(RouteError::UnknownObjectType(object_type.to_string()));
        }

        let record_id = valid.event.record_id.as_str();
        let realtime_shard = shard_for(object_type, record_id, self.realtime.len());
        let history_shard = shard_for(object_type, record_id, self.history.len());

        self.realtime[realtime_shard]
            .send(record)
            .await
            .map_err(|_| RouteError::Closed)?;
        self.history[history_shard]
            .send(valid)
            .await
            .map_err(|_| RouteError::Closed)?;
        Ok(())
    }
}
