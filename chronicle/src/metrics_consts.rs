pub const EVENTS_RECEIVED: &str = "chronicle_events_received";
pub const EMPTY_EVENTS: &str = "chronicle_empty_events";
pub const PARSE_ERRORS: &str = "chronicle_parse_errors";
pub const EVENTS_VALID: &str = "chronicle_valid_events";
pub const EVENTS_INVALID: &str = "chronicle_invalid_events";
pub const VALIDATION_RULE_FAILURES: &str = "chronicle_validation_rule_failures";
pub const FK_ADVISORY_FAILURES: &str = "chronicle_fk_advisory_failures";
pub const ALERTS_EMITTED: &str = "chronicle_alerts_emitted";
pub const ALERT_PUBLISH_FAILED: &str = "chronicle_alert_publish_failed";
pub const DEAD_LETTERS: &str = "chronicle_dead_letters";
pub const DEAD_LETTER_PUBLISH_FAILED: &str = "chronicle_dead_letter_publish_failed";
pub const LATE_EVENTS: &str = "chronicle_late_events";
pub const UNKNOWN_OBJECT_DROPPED: &str = "chronicle_unknown_object_dropped";
pub const OFFSET_STORE_FAILED: &str = "chronicle_offset_store_failed";

pub const REALTIME_WINDOWS_FLUSHED: &str = "chronicle_realtime_windows_flushed";
pub const REALTIME_ROWS_UPSERTED: &str = "chronicle_realtime_rows_upserted";
pub const REALTIME_WRITE_ATTEMPT: &str = "chronicle_realtime_write_attempt";
pub const REALTIME_BATCH_DEAD_LETTERED: &str = "chronicle_realtime_batch_dead_lettered";
pub const REALTIME_FLUSH_TIME: &str = "chronicle_realtime_flush_time_ms";
pub const REALTIME_OPEN_WINDOWS: &str = "chronicle_realtime_open_windows";

pub const HISTORY_WINDOWS_FLUSHED: &str = "chronicle_history_windows_flushed";
pub const HISTORY_VERSIONS_INSERTED: &str = "chronicle_history_versions_inserted";
pub const HISTORY_ROWS_CLOSED: &str = "chronicle_history_rows_closed";
pub const HISTORY_NOOP_UPDATES: &str = "chronicle_history_noop_updates";
pub const HISTORY_STALE_EVENTS: &str = "chronicle_history_stale_events";
pub const HISTORY_ANOMALIES: &str = "chronicle_history_anomalies";
pub const HISTORY_GROUP_FAILED: &str = "chronicle_history_group_failed";
pub const HISTORY_FLUSH_TIME: &str = "chronicle_history_flush_time_ms";
pub const HISTORY_OPEN_WINDOWS: &str = "chronicle_history_open_windows";
