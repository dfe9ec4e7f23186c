use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use common_kafka::kafka_consumer::{Offset, RecvErr, SingleTopicConsumer};
use health::HealthHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alerts::AlertEmitter;
use crate::dead_letter::{DeadLetterQueue, DeadLetterReason};
use crate::extract::{extract_record, Clock};
use crate::metrics_consts::{EMPTY_EVENTS, EVENTS_RECEIVED, HISTORY_FLUSH_TIME,
    HISTORY_OPEN_WINDOWS, HISTORY_WINDOWS_FLUSHED, LATE_EVENTS, OFFSET_STORE_FAILED,
    PARSE_ERRORS, REALTIME_BATCH_DEAD_LETTERED, REALTIME_FLUSH_TIME, REALTIME_OPEN_WINDOWS,
    REALTIME_WINDOWS_FLUSHED};
use crate::parse::parse_event;
use crate::router::{ObjectRouter, RouteError};
use crate::scd2::HistoryProcessor;
use crate::sinks::history::HistoryStore;
use crate::sinks::raw::{dedupe_batch, RawTableWriter};
use crate::types::{ExtractedRecord, ValidEvent};
use crate::validate::Validator;
use crate::window::{InsertOutcome, WindowBuffer};

pub mod alerts;
pub mod app_context;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod extract;
pub mod metrics_consts;
pub mod parse;
pub mod router;
pub mod scd2;
pub mod schema;
pub mod sinks;
pub mod types;
pub mod validate;
pub mod window;

/// Consume raw messages, parse, validate, extract, and fan out to the
/// two processing paths. Invalid events become alerts; undecodable ones
/// become dead letters. Returns when the shutdown token fires or the
/// worker channels close.
#[allow(clippy::too_many_arguments)]
pub async fn intake_loop(
    consumer: SingleTopicConsumer,
    validator: Arc<Validator>,
    clock: Arc<dyn Clock>,
    router: ObjectRouter,
    alerts: Arc<AlertEmitter>,
    dead_letters: Arc<DeadLetterQueue>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    loop {
        liveness.report_healthy().await;

        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Intake stopping, downstream windows will drain");
                return;
            }
            r = consumer.recv_raw() => r,
        };

        let (payload, offset) = match received {
            Ok(r) => r,
            Err(RecvErr::Empty) => {
                warn!("Received empty payload");
                metrics::counter!(EMPTY_EVENTS).increment(1);
                continue;
            }
            Err(RecvErr::Kafka(e)) => {
                panic!("Kafka error: {:?}", e); // If kafka's down, we're down
            }
        };

        // Offsets are stored as soon as we've taken ownership of the
        // message. An abrupt kill can lose not-yet-closed windows, which
        // is the accepted at-least-once tradeoff: the upstream log is
        // durable and a fresh consumer group replays it.
        store_offset(offset);

        metrics::counter!(EVENTS_RECEIVED).increment(1);

        let event = match parse_event(&payload) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!(PARSE_ERRORS).increment(1);
                dead_letters
                    .publish(
                        DeadLetterReason::ParseFailure,
                        e.to_string(),
                        String::from_utf8_lossy(&payload).into_owned(),
                    )
                    .await;
                continue;
            }
        };

        let valid = match validator.validate(&event, clock.now()) {
            Ok(valid) => valid,
            Err(errors) => {
                alerts.emit_validation_failure(&event, errors).await;
                continue;
            }
        };

        let record = extract_record(&valid, clock.as_ref());
        match router.route(valid, record).await {
            Ok(()) => {}
            Err(RouteError::UnknownObjectType(object_type)) => {
                dead_letters
                    .publish(
                        DeadLetterReason::UnknownObjectType,
                        format!("no processing path registered for '{object_type}'"),
                        String::from_utf8_lossy(&payload).into_owned(),
                    )
                    .await;
            }
            Err(RouteError::Closed) => {
                error!("Worker channels closed, stopping intake");
                return;
            }
        }
    }
}

fn store_offset(offset: Offset) {
    if let Err(e) = offset.store() {
        metrics::counter!(OFFSET_STORE_FAILED).increment(1);
        error!("Failed to store consumer offset: {}", e);
    }
}

/// One shard of the real-time path: buffer records into short windows,
/// and upsert each window into the raw tables when its grace period
/// elapses. Drains open windows before exiting once the intake is gone.
pub async fn realtime_worker_loop(
    mut rx: mpsc::Receiver<ExtractedRecord>,
    writer: Arc<RawTableWriter>,
    dead_letters: Arc<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
    window: ChronoDuration,
    allowed_lateness: ChronoDuration,
    liveness: HealthHandle,
) {
    let mut buffer: WindowBuffer<ExtractedRecord> = WindowBuffer::new(window, allowed_lateness);
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    match buffer.insert(record.cdc_event_timestamp, clock.now(), record) {
                        InsertOutcome::Accepted => {}
                        InsertOutcome::Late(record) => {
                            metrics::counter!(LATE_EVENTS, "path" => "realtime").increment(1);
                            dead_letters
                                .publish(
                                    DeadLetterReason::LateArrival,
                                    format!(
                                        "window for event at {} already emitted",
                                        record.cdc_event_timestamp
                                    ),
                                    serde_json::to_string(&record).unwrap_or_default(),
                                )
                                .await;
                        }
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                liveness.report_healthy().await;
                metrics::gauge!(REALTIME_OPEN_WINDOWS).set(buffer.open_windows() as f64);
                let closed = buffer.drain_closed(clock.now());
                flush_realtime_windows(closed, &writer, &dead_letters).await;
            }
        }
    }

    let remaining = buffer.drain_all();
    flush_realtime_windows(remaining, &writer, &dead_letters).await;
    info!("Realtime worker drained");
}

async fn flush_realtime_windows(
    windows: Vec<(chrono::DateTime<chrono::Utc>, Vec<ExtractedRecord>)>,
    writer: &RawTableWriter,
    dead_letters: &DeadLetterQueue,
) {
    for (window_start, records) in windows {
        let flush_time = common_metrics::timing_guard(REALTIME_FLUSH_TIME, &[]);
        metrics::counter!(REALTIME_WINDOWS_FLUSHED).increment(1);

        let mut by_object: HashMap<String, Vec<ExtractedRecord>> = HashMap::new();
        for record in records {
            by_object.entry(record.object_type.clone()).or_default().push(record);
        }

        for (object_type, batch) in by_object {
            let batch = dedupe_batch(batch);
            if let Err(e) = writer.write_batch_with_retries(&object_type, &batch).await {
                metrics::counter!(REALTIME_BATCH_DEAD_LETTERED).increment(1);
                error!(
                    %object_type,
                    %window_start,
                    "Raw batch write exhausted retries, dead-lettering: {:?}", e
                );
                dead_letters
                    .publish(
                        DeadLetterReason::SinkWriteFailure,
                        e.to_string(),
                        serde_json::to_string(&batch).unwrap_or_default(),
                    )
                    .await;
            }
        }
        flush_time.fin();
    }
}

/// One shard of the history path: buffer validated events into long
/// windows and run the SCD2 processor on each window once its grace
/// period elapses.
#[allow(clippy::too_many_arguments)]
pub async fn history_worker_loop<S: HistoryStore>(
    mut rx: mpsc::Receiver<ValidEvent>,
    processor: Arc<HistoryProcessor<S>>,
    alerts: Arc<AlertEmitter>,
    dead_letters: Arc<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
    window: ChronoDuration,
    allowed_lateness: ChronoDuration,
    liveness: HealthHandle,
) {
    let mut buffer: WindowBuffer<ValidEvent> = WindowBuffer::new(window, allowed_lateness);
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    match buffer.insert(event.timestamp, clock.now(), event) {
                        InsertOutcome::Accepted => {}
                        InsertOutcome::Late(event) => {
                            metrics::counter!(LATE_EVENTS, "path" => "history").increment(1);
                            dead_letters
                                .publish(
                                    DeadLetterReason::LateArrival,
                                    format!(
                                        "window for event at {} already emitted",
                                        event.timestamp
                                    ),
                                    serde_json::to_string(&event.event).unwrap_or_default(),
                                )
                                .await;
                        }
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                liveness.report_healthy().await;
                metrics::gauge!(HISTORY_OPEN_WINDOWS).set(buffer.open_windows() as f64);
                let closed = buffer.drain_closed(clock.now());
                flush_history_windows(closed, &processor, &alerts, &dead_letters).await;
            }
        }
    }

    let remaining = buffer.drain_all();
    flush_history_windows(remaining, &processor, &alerts, &dead_letters).await;
    info!("History worker drained");
}

async fn flush_history_windows<S: HistoryStore>(
    windows: Vec<(chrono::DateTime<chrono::Utc>, Vec<ValidEvent>)>,
    processor: &HistoryProcessor<S>,
    alerts: &AlertEmitter,
    dead_letters: &DeadLetterQueue,
) {
    for (window_start, events) in windows {
        let flush_time = common_metrics::timing_guard(HISTORY_FLUSH_TIME, &[]);
        metrics::counter!(HISTORY_WINDOWS_FLUSHED).increment(1);

        let outcome = processor.process_window(events).await;
        info!(
            %window_start,
            events = outcome.stats.events,
            groups = outcome.stats.groups,
            versions = outcome.stats.versions_inserted,
            closed = outcome.stats.rows_closed,
            noops = outcome.stats.noop_updates,
            "History window processed"
        );

        for anomaly in &outcome.anomalies {
            alerts.emit_integrity_anomaly(anomaly).await;
        }

        for failure in outcome.failures {
            let events: Vec<_> = failure.events.iter().map(|e| &e.event).collect();
            dead_letters
                .publish(
                    DeadLetterReason::SinkWriteFailure,
                    format!(
                        "history writes for {} {} failed: {}",
                        failure.object_type, failure.record_id, failure.detail
                    ),
                    serde_json::to_string(&events).unwrap_or_default(),
                )
                .await;
        }
        flush_time.fin();
    }
}
