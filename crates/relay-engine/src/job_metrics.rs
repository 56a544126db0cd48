//! Metrics for job processing
//!
//! Emitted through the `metrics` facade. Nothing is recorded unless the
//! binary installs a recorder.

use metrics::{counter, histogram};
use relay_common::JobMode;
use std::time::Duration;

/// Record a job acked as completed
pub fn record_job_completed(mode: JobMode) {
    counter!("relay.jobs.completed", "mode" => mode.as_str()).increment(1);
}

/// Record a failed attempt that will be retried
pub fn record_job_failed(mode: JobMode, error_kind: &'static str) {
    counter!(
        "relay.jobs.failed",
        "mode" => mode.as_str(),
        "error" => error_kind
    )
    .increment(1);
}

/// Record a job moved to its terminal failed state
pub fn record_job_exhausted(mode: JobMode, error_kind: &'static str) {
    counter!(
        "relay.jobs.exhausted",
        "mode" => mode.as_str(),
        "error" => error_kind
    )
    .increment(1);
}

/// Record how long one attempt took, whatever its outcome
pub fn record_job_duration(mode: JobMode, duration: Duration) {
    histogram!("relay.jobs.duration_ms", "mode" => mode.as_str())
        .record(duration.as_secs_f64() * 1000.0);
}
