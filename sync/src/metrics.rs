use std::future::Future;
use std::sync::Once;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use tracing::debug;

use crate::error::SyncResult;

static REGISTER_METRICS: Once = Once::new();

pub const SYNC_EVENTS_TOTAL: &str = "sync_events_total";
pub const SYNC_EVENT_DURATION_SECONDS: &str = "sync_event_duration_seconds";
pub const SYNC_ROWS_EXTRACTED_TOTAL: &str = "sync_rows_extracted_total";
pub const SYNC_UPLOAD_BYTES_TOTAL: &str = "sync_upload_bytes_total";

// Lifecycle event names, used as the `event` label.
pub const EVENT_CREATE_TABLE: &str = "create-table";
pub const EVENT_EXTRACT_TABLE: &str = "extract-table";
pub const EVENT_LOAD_TABLE: &str = "load-table";
pub const EVENT_DISCONNECT_ERROR: &str = "disconnect-error";
pub const EVENT_RUN_TIME: &str = "run-time";
pub const EVENT_FULL_RUN_TIME: &str = "full-run-time";

/// State of a lifecycle event, used as the `state` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Start,
    Error,
    Complete,
}

impl EventState {
    fn as_str(&self) -> &'static str {
        match self {
            EventState::Start => "start",
            EventState::Error => "error",
            EventState::Complete => "complete",
        }
    }
}

/// Registers the metrics emitted by the sync core. Safe to call multiple
/// times; registration happens only once per process.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            SYNC_EVENTS_TOTAL,
            Unit::Count,
            "Lifecycle events per table, labeled by event name and state"
        );

        describe_histogram!(
            SYNC_EVENT_DURATION_SECONDS,
            Unit::Seconds,
            "Time taken by completed or failed lifecycle events"
        );

        describe_counter!(
            SYNC_ROWS_EXTRACTED_TOTAL,
            Unit::Count,
            "Rows serialized and staged per table"
        );

        describe_counter!(
            SYNC_UPLOAD_BYTES_TOTAL,
            Unit::Bytes,
            "Bytes uploaded to the staging area per table"
        );
    });
}

/// Records one lifecycle event.
pub fn record_event(
    event: &'static str,
    state: EventState,
    alias: &str,
    table: Option<&str>,
    elapsed_secs: Option<f64>,
) {
    debug!(event, state = state.as_str(), alias, table, elapsed_secs, "lifecycle event");

    counter!(
        SYNC_EVENTS_TOTAL,
        "event" => event,
        "state" => state.as_str(),
        "alias" => alias.to_owned(),
        "table" => table.unwrap_or("").to_owned()
    )
    .increment(1);

    if let Some(elapsed_secs) = elapsed_secs {
        histogram!(
            SYNC_EVENT_DURATION_SECONDS,
            "event" => event,
            "state" => state.as_str(),
            "alias" => alias.to_owned(),
            "table" => table.unwrap_or("").to_owned()
        )
        .record(elapsed_secs);
    }
}

/// Wraps an operation in start/complete/error events with elapsed time.
pub async fn observe<T, F>(
    event: &'static str,
    alias: &str,
    table: Option<&str>,
    operation: F,
) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    record_event(event, EventState::Start, alias, table, None);
    let started = Instant::now();

    match operation.await {
        Ok(value) => {
            record_event(
                event,
                EventState::Complete,
                alias,
                table,
                Some(started.elapsed().as_secs_f64()),
            );
            Ok(value)
        }
        Err(err) => {
            record_event(
                event,
                EventState::Error,
                alias,
                table,
                Some(started.elapsed().as_secs_f64()),
            );
            Err(err)
        }
    }
}
