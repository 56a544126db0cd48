//! Durable job queue for dispatch jobs
//!
//! Jobs are leased to one worker at a time. A lease is identified by a token
//! carried on the [`DispatchJob`]; acking, failing or extending with a stale
//! token is rejected with [`QueueError::LeaseLost`]. Workers running long jobs
//! extend their lease periodically so it never lapses mid-run.
//!
//! - [`InMemoryJobQueue`]: process-local, for tests and embedded use
//! - `SqliteJobQueue` (feature `sqlite`): durable, shareable between processes

use async_trait::async_trait;
use relay_common::{
    DispatchJob, FailOutcome, JobCounts, JobFailure, JobHandle, JobOptions, JobPage, JobRecord,
    JobState, NewJob,
};
use serde_json::Value;
use std::time::Duration;

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::QueueError;
pub use memory::InMemoryJobQueue;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name, used in logs
    fn name(&self) -> &str;

    /// How long a lease lasts unless it is extended
    fn lease_timeout(&self) -> Duration;

    /// Store a new job. Enqueuing an id that already exists returns the
    /// existing job's handle with `created == false`.
    async fn enqueue(&self, job: NewJob, options: JobOptions) -> Result<JobHandle>;

    /// Lease the next available job without waiting. Returns `None` when
    /// nothing is due or the queue is paused.
    async fn lease(&self) -> Result<Option<DispatchJob>>;

    /// Push the lease deadline to a full lease timeout from now. Fails with
    /// [`QueueError::LeaseLost`] once another worker holds the job.
    async fn extend_lease(&self, job: &DispatchJob) -> Result<()>;

    /// Complete a leased job
    async fn ack(&self, job: &DispatchJob, return_value: Value) -> Result<()>;

    /// Record a failed attempt. Retryable failures with attempts left are
    /// scheduled again after the job's backoff, anything else is exhausted.
    async fn fail(&self, job: &DispatchJob, failure: JobFailure) -> Result<FailOutcome>;

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Jobs in the given states ordered by creation time, positions `start..=end`.
    /// An empty `states` slice matches every state.
    async fn list_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
        ascending: bool,
    ) -> Result<JobPage>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Stop handing out leases. Jobs already leased are unaffected.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    /// Reject all further calls with [`QueueError::Stopped`]
    async fn close(&self);
}

/// Decide what a failed attempt turns into.
pub(crate) fn fail_outcome(job_failure: &JobFailure, job: &DispatchJob) -> FailOutcome {
    if !job_failure.retryable || job.attempts_made >= job.max_attempts {
        FailOutcome::Exhausted
    } else {
        FailOutcome::Retrying {
            delay: job.backoff.delay_for(job.attempts_made),
        }
    }
}

/// Inclusive `start..=end` window into `len` items.
pub(crate) fn page_bounds(len: usize, start: usize, end: usize) -> Option<(usize, usize)> {
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len - 1)))
}

pub(crate) fn lease_expired_reason(attempts_made: u32) -> String {
    format!("lease expired after {} attempt(s)", attempts_made)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(10, 0, 4), Some((0, 4)));
        assert_eq!(page_bounds(3, 0, 9), Some((0, 2)));
        assert_eq!(page_bounds(3, 3, 9), None);
        assert_eq!(page_bounds(3, 2, 1), None);
        assert_eq!(page_bounds(0, 0, 0), None);
    }
}
