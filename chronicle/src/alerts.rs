use std::sync::Arc;
use std::time::{Duration, Instant};

use common_kafka::kafka_producer::{send_keyed_iter_to_kafka, KafkaContext};
use rdkafka::producer::FutureProducer;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::config::Config;
use crate::extract::Clock;
use crate::metrics_consts::{ALERTS_EMITTED, ALERT_PUBLISH_FAILED};
use crate::scd2::IntegrityAnomaly;
use crate::types::{Alert, AlertSeverity, CdcEvent};
use crate::validate::ValidationStats;

pub const ALERT_DATA_QUALITY: &str = "data_quality_violation";
pub const ALERT_INTEGRITY_ANOMALY: &str = "integrity_anomaly";
pub const ALERT_FAILURE_RATIO: &str = "validation_failure_ratio";

/// True once enough events have been seen and the failure ratio is over
/// the configured threshold.
pub fn ratio_breached(stats: &ValidationStats, threshold: f64, min_samples: u64) -> bool {
    stats.total() >= min_samples && stats.failure_ratio() > threshold
}

/// Publishes structured alerts to the alerting topic: one per rejected
/// event or integrity anomaly, plus a higher-severity aggregate when the
/// failure ratio breaches the threshold (rate-limited by a cooldown).
pub struct AlertEmitter {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    stats: Arc<ValidationStats>,
    clock: Arc<dyn Clock>,
    threshold: f64,
    min_samples: u64,
    cooldown: Duration,
    last_aggregate: Mutex<Option<Instant>>,
}

impl AlertEmitter {
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        config: &Config,
        stats: Arc<ValidationStats>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            producer,
            topic: config.alerts_topic.clone(),
            stats,
            clock,
            threshold: config.alert_threshold_ratio,
            min_samples: config.alert_min_samples,
            cooldown: Duration::from_secs(config.aggregate_alert_cooldown_secs),
            last_aggregate: Mutex::new(None),
        }
    }

    /// Alert on an event the validator rejected, then check whether the
    /// overall failure ratio warrants the aggregate alert.
    pub async fn emit_validation_failure(&self, event: &CdcEvent, errors: Vec<String>) {
        let alert = Alert {
            alert_type: ALERT_DATA_QUALITY.to_string(),
            severity: AlertSeverity::Error,
            timestamp: self.clock.now(),
            event_id: Some(event.event_id.clone()),
            object_type: Some(event.object_type.clone()),
            record_id: Some(event.record_id.clone()),
            validation_errors: errors,
            event_data: serde_json::to_value(event).ok(),
        };
        self.publish(alert).await;
        self.maybe_emit_aggregate().await;
    }

    pub async fn emit_integrity_anomaly(&self, anomaly: &IntegrityAnomaly) {
        let alert = Alert {
            alert_type: ALERT_INTEGRITY_ANOMALY.to_string(),
            severity: AlertSeverity::Error,
            timestamp: self.clock.now(),
            event_id: Some(anomaly.event_id.clone()),
            object_type: Some(anomaly.object_type.clone()),
            record_id: Some(anomaly.record_id.clone()),
            validation_errors: vec![anomaly.detail.clone()],
            event_data: None,
        };
        self.publish(alert).await;
    }

    async fn maybe_emit_aggregate(&self) {
        if !ratio_breached(&self.stats, self.threshold, self.min_samples) {
            return;
        }

        let mut last = self.last_aggregate.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.cooldown {
                return;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        let ratio = self.stats.failure_ratio();
        warn!(
            "validation failure ratio {:.4} over {} events breaches threshold {:.4}",
            ratio,
            self.stats.total(),
            self.threshold
        );
        let alert = Alert {
            alert_type: ALERT_FAILURE_RATIO.to_string(),
            severity: AlertSeverity::Critical,
            timestamp: self.clock.now(),
            event_id: None,
            object_type: None,
            record_id: None,
            validation_errors: vec![format!(
                "validation failure ratio {:.4} over {} events exceeds threshold {:.4}",
                ratio,
                self.stats.total(),
                self.threshold
            )],
            event_data: None,
        };
        self.publish(alert).await;
    }

    // Alerting is best effort: a broken alert topic must not stall the
    // event stream, so failures are logged and counted only.
    async fn publish(&self, alert: Alert) {
        let alert_type = alert.alert_type.clone();
        let results = send_keyed_iter_to_kafka(
            &self.producer,
            &self.topic,
            |a: &Alert| a.record_id.clone(),
            [alert],
        )
        .await;

        for result in results {
            match result {
                Ok(()) => {
                    metrics::counter!(ALERTS_EMITTED, "type" => alert_type.clone()).increment(1)
                }
                Err(e) => {
                    metrics::counter!(ALERT_PUBLISH_FAILED).increment(1);
                    error!("Failed to publish {} alert: {:?}", alert_type, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::RULE_RECORD_ID;

    #[test]
    fn ratio_gate_needs_samples_and_breach() {
        let stats = ValidationStats::default();
        // 1 invalid out of 10: ratio 0.1
        for _ in 0..9 {
            stats.record_valid();
        }
        stats.record_invalid(&[RULE_RECORD_ID]);

        // Breaching ratio, but not enough samples yet
        assert!(!ratio_breached(&stats, 0.05, 100));
        // Enough samples at a lower floor
        assert!(ratio_breached(&stats, 0.05, 10));
        // Threshold at or above the ratio doesn't fire
        assert!(!ratio_breached(&stats, 0.1, 10));
    }
}
