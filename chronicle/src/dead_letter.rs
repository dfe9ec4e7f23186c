use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_kafka::kafka_producer::{send_iter_to_kafka, KafkaContext};
use rdkafka::producer::FutureProducer;
use serde::Serialize;
use tracing::error;

use crate::config::Config;
use crate::extract::Clock;
use crate::metrics_consts::{DEAD_LETTERS, DEAD_LETTER_PUBLISH_FAILED};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    ParseFailure,
    LateArrival,
    SinkWriteFailure,
    UnknownObjectType,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::ParseFailure => "parse_failure",
            DeadLetterReason::LateArrival => "late_arrival",
            DeadLetterReason::SinkWriteFailure => "sink_write_failure",
            DeadLetterReason::UnknownObjectType => "unknown_object_type",
        }
    }
}

/// What lands on the dead-letter topic: the payload as received (or the
/// serialized batch, for sink failures), plus why it couldn't be
/// processed. Kept for inspection and replay, never silently discarded.
#[derive(Clone, Debug, Serialize)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    pub detail: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

pub struct DeadLetterQueue {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            producer,
            topic: config.dead_letter_topic.clone(),
            clock,
        }
    }

    pub async fn publish(&self, reason: DeadLetterReason, detail: String, payload: String) {
        let letter = DeadLetter {
            reason,
            detail,
            payload,
            timestamp: self.clock.now(),
        };

        let results = send_iter_to_kafka(&self.producer, &self.topic, [&letter]).await;
        for result in results {
            match result {
                Ok(()) => {
                    metrics::counter!(DEAD_LETTERS, "reason" => reason.as_str()).increment(1)
                }
                Err(e) => {
                    // Nowhere further to push it; the error log is the
                    // last resort record
                    metrics::counter!(DEAD_LETTER_PUBLISH_FAILED).increment(1);
                    error!(
                        "Failed to publish dead letter ({}): {:?}; detail: {}",
                        reason.as_str(),
                        e,
                        letter.detail
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&DeadLetterReason::ParseFailure).unwrap(),
            r#""parse_failure""#
        );
        assert_eq!(
            serde_json::to_string(&DeadLetterReason::LateArrival).unwrap(),
            r#""late_arrival""#
        );
        assert_eq!(DeadLetterReason::SinkWriteFailure.as_str(), "sink_write_failure");
    }
}
