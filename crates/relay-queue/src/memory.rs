use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_common::{
    duration_ms, DispatchJob, FailOutcome, JobCounts, JobData, JobFailure, JobHandle, JobOptions,
    JobPage, JobRecord, JobState, NewJob,
};

use crate::{
    fail_outcome, lease_expired_reason, page_bounds, JobQueue, QueueError, Result,
};

struct StoredJob {
    data: JobData,
    options: JobOptions,
    state: JobState,
    attempts_made: u32,
    lease_token: Option<String>,
    /// Delayed jobs become leasable at this instant
    visible_at: Instant,
    lease_expires_at: Option<Instant>,
    failed_reason: Option<String>,
    return_value: Option<Value>,
    created_at: DateTime<Utc>,
    processed_on: Option<DateTime<Utc>>,
    finished_on: Option<DateTime<Utc>>,
    /// Order in which the job reached a terminal state
    finished_seq: u64,
}

impl StoredJob {
    fn to_record(&self, id: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            mode: self.data.payload.mode(),
            channel_instance: self.data.channel_instance.clone(),
            payload: self.data.payload.clone(),
            state: self.state,
            attempts_made: self.attempts_made,
            max_attempts: self.options.max_attempts,
            failed_reason: self.failed_reason.clone(),
            return_value: self.return_value.clone(),
            created_at: self.created_at,
            processed_on: self.processed_on,
            finished_on: self.finished_on,
        }
    }

    fn is_leasable(&self, now: Instant) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.visible_at <= now,
            JobState::Active => self.lease_expires_at.is_some_and(|at| at <= now),
            JobState::Completed | JobState::Exhausted => false,
        }
    }

    fn holds_lease(&self, job: &DispatchJob) -> bool {
        self.state == JobState::Active && self.lease_token.as_deref() == Some(job.lease_token.as_str())
    }
}

#[derive(Default)]
struct Inner {
    /// Insertion order is creation order
    jobs: IndexMap<String, StoredJob>,
    paused: bool,
    finished_seq: u64,
}

impl Inner {
    fn exhaust(&mut self, id: &str, reason: String) {
        self.finished_seq += 1;
        let seq = self.finished_seq;
        let keep_failed = match self.jobs.get_mut(id) {
            Some(stored) => {
                stored.state = JobState::Exhausted;
                stored.lease_token = None;
                stored.lease_expires_at = None;
                stored.failed_reason = Some(reason);
                stored.finished_on = Some(Utc::now());
                stored.finished_seq = seq;
                stored.options.retention.keep_failed
            }
            None => return,
        };

        if let Some(keep) = keep_failed {
            self.prune_exhausted(keep);
        }
    }

    /// Keep only the `keep` most recently exhausted jobs
    fn prune_exhausted(&mut self, keep: usize) {
        let mut exhausted: Vec<(u64, String)> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.state == JobState::Exhausted)
            .map(|(id, job)| (job.finished_seq, id.clone()))
            .collect();

        if exhausted.len() <= keep {
            return;
        }

        exhausted.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in exhausted.into_iter().skip(keep) {
            self.jobs.shift_remove(&id);
            debug!(job_id = %id, "Pruned exhausted job");
        }
    }
}

/// Process-local job queue.
///
/// Lease expiry and backoff use tokio's clock, so paused-time tests can
/// advance through them.
pub struct InMemoryJobQueue {
    name: String,
    lease_timeout: Duration,
    inner: Mutex<Inner>,
    running: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>, lease_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            lease_timeout,
            inner: Mutex::new(Inner::default()),
            running: AtomicBool::new(true),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Stopped)
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    async fn enqueue(&self, job: NewJob, options: JobOptions) -> Result<JobHandle> {
        self.ensure_running()?;

        let id = job
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut inner = self.inner.lock();

        if inner.jobs.contains_key(&id) {
            debug!(job_id = %id, queue = %self.name, "Duplicate job id, keeping existing job");
            return Ok(JobHandle { id, created: false });
        }

        inner.jobs.insert(
            id.clone(),
            StoredJob {
                data: job.data(),
                options,
                state: JobState::Waiting,
                attempts_made: 0,
                lease_token: None,
                visible_at: Instant::now(),
                lease_expires_at: None,
                failed_reason: None,
                return_value: None,
                created_at: Utc::now(),
                processed_on: None,
                finished_on: None,
                finished_seq: 0,
            },
        );

        debug!(job_id = %id, mode = %job.payload.mode(), queue = %self.name, "Job enqueued");
        Ok(JobHandle { id, created: true })
    }

    async fn lease(&self) -> Result<Option<DispatchJob>> {
        self.ensure_running()?;

        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.paused {
            return Ok(None);
        }

        // Expired leases on a final attempt cannot be retried
        let stalled: Vec<(String, u32)> = inner
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.state == JobState::Active
                    && job.is_leasable(now)
                    && job.attempts_made >= job.options.max_attempts
            })
            .map(|(id, job)| (id.clone(), job.attempts_made))
            .collect();
        for (id, attempts) in stalled {
            warn!(job_id = %id, attempts, queue = %self.name, "Lease expired on final attempt, exhausting job");
            inner.exhaust(&id, lease_expired_reason(attempts));
        }

        let Some((id, stored)) = inner.jobs.iter_mut().find(|(_, job)| job.is_leasable(now)) else {
            return Ok(None);
        };

        if stored.state == JobState::Active {
            warn!(job_id = %id, attempts = stored.attempts_made, queue = %self.name, "Recovering job with expired lease");
        }

        let lease_token = uuid::Uuid::new_v4().to_string();
        stored.state = JobState::Active;
        stored.attempts_made += 1;
        stored.lease_token = Some(lease_token.clone());
        stored.lease_expires_at = Some(now + self.lease_timeout);
        stored.processed_on = Some(Utc::now());

        Ok(Some(DispatchJob {
            id: id.clone(),
            channel_instance: stored.data.channel_instance.clone(),
            payload: stored.data.payload.clone(),
            attempts_made: stored.attempts_made,
            max_attempts: stored.options.max_attempts,
            backoff: stored.options.backoff,
            lease_token,
        }))
    }

    async fn extend_lease(&self, job: &DispatchJob) -> Result<()> {
        self.ensure_running()?;

        let mut inner = self.inner.lock();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;

        if !stored.holds_lease(job) {
            return Err(QueueError::LeaseLost(job.id.clone()));
        }

        stored.lease_expires_at = Some(Instant::now() + self.lease_timeout);
        Ok(())
    }

    async fn ack(&self, job: &DispatchJob, return_value: Value) -> Result<()> {
        self.ensure_running()?;

        let mut inner = self.inner.lock();
        let remove = match inner.jobs.get(&job.id) {
            None => return Err(QueueError::NotFound(job.id.clone())),
            Some(stored) if !stored.holds_lease(job) => {
                warn!(job_id = %job.id, queue = %self.name, "ACK rejected, lease no longer held");
                return Err(QueueError::LeaseLost(job.id.clone()));
            }
            Some(stored) => stored.options.retention.remove_on_complete,
        };

        if remove {
            inner.jobs.shift_remove(&job.id);
            debug!(job_id = %job.id, queue = %self.name, "Job completed and removed");
            return Ok(());
        }

        inner.finished_seq += 1;
        let seq = inner.finished_seq;
        if let Some(stored) = inner.jobs.get_mut(&job.id) {
            stored.state = JobState::Completed;
            stored.lease_token = None;
            stored.lease_expires_at = None;
            stored.return_value = Some(return_value);
            stored.finished_on = Some(Utc::now());
            stored.finished_seq = seq;
        }

        debug!(job_id = %job.id, queue = %self.name, "Job completed");
        Ok(())
    }

    async fn fail(&self, job: &DispatchJob, failure: JobFailure) -> Result<FailOutcome> {
        self.ensure_running()?;

        let mut inner = self.inner.lock();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;

        if !stored.holds_lease(job) {
            warn!(job_id = %job.id, queue = %self.name, "Fail rejected, lease no longer held");
            return Err(QueueError::LeaseLost(job.id.clone()));
        }

        let outcome = fail_outcome(&failure, job);
        match outcome {
            FailOutcome::Retrying { delay } => {
                stored.state = JobState::Delayed;
                stored.lease_token = None;
                stored.lease_expires_at = None;
                stored.visible_at = Instant::now() + delay;
                stored.failed_reason = Some(failure.reason);
                debug!(job_id = %job.id, delay_ms = duration_ms(delay), "Job scheduled for retry");
            }
            FailOutcome::Exhausted => {
                inner.exhaust(&job.id, failure.reason);
                info!(job_id = %job.id, attempts = job.attempts_made, queue = %self.name, "Job exhausted");
            }
        }

        Ok(outcome)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock();
        Ok(inner.jobs.get(id).map(|stored| stored.to_record(id)))
    }

    async fn list_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
        ascending: bool,
    ) -> Result<JobPage> {
        let inner = self.inner.lock();
        let mut matching: Vec<JobRecord> = inner
            .jobs
            .iter()
            .filter(|(_, job)| states.is_empty() || states.contains(&job.state))
            .map(|(id, job)| job.to_record(id))
            .collect();

        if !ascending {
            matching.reverse();
        }

        let total = matching.len() as u64;
        let jobs = match page_bounds(matching.len(), start, end) {
            Some((first, last)) => matching.drain(first..=last).collect(),
            None => Vec::new(),
        };

        Ok(JobPage { jobs, total })
    }

    async fn counts(&self) -> Result<JobCounts> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            // Delayed jobs whose backoff elapsed are due now
            let state = match job.state {
                JobState::Delayed if job.visible_at <= now => JobState::Waiting,
                state => state,
            };
            counts.add(state, 1);
        }
        Ok(counts)
    }

    async fn pause(&self) -> Result<()> {
        self.inner.lock().paused = true;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.inner.lock().paused = false;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.inner.lock().paused)
    }

    async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.name, "In-memory queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::{BackoffPolicy, JobPayload, MessageContent, Retention, SingleDispatch};

    fn create_test_queue() -> InMemoryJobQueue {
        InMemoryJobQueue::new("test-queue", Duration::from_secs(30))
    }

    fn single_job(id: &str) -> NewJob {
        NewJob::new(
            "instance-1",
            JobPayload::Single(SingleDispatch {
                phone: "5511987654321".to_string(),
                content: MessageContent::text("hello").into(),
            }),
        )
        .with_id(id)
    }

    fn fast_options(max_attempts: u32) -> JobOptions {
        JobOptions {
            max_attempts,
            backoff: BackoffPolicy::Fixed { delay_ms: 0 },
            retention: Retention::default(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_lease_ack() {
        let queue = create_test_queue();

        let handle = queue.enqueue(single_job("job-1"), JobOptions::default()).await.unwrap();
        assert!(handle.created);

        let job = queue.lease().await.unwrap().unwrap();
        assert_eq!(job.id, "job-1");
        assert_eq!(job.attempts_made, 1);

        queue.ack(&job, serde_json::json!({"status": true})).await.unwrap();
        assert!(queue.lease().await.unwrap().is_none());

        let record = queue.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.return_value, Some(serde_json::json!({"status": true})));
        assert!(record.finished_on.is_some());
    }

    #[tokio::test]
    async fn test_generated_id() {
        let queue = create_test_queue();
        let mut job = single_job("unused");
        job.id = None;

        let handle = queue.enqueue(job, JobOptions::default()).await.unwrap();
        assert!(uuid::Uuid::parse_str(&handle.id).is_ok());
    }

    #[tokio::test]
    async fn test_idempotent_enqueue() {
        let queue = create_test_queue();

        let first = queue.enqueue(single_job("dup"), JobOptions::default()).await.unwrap();
        let second = queue.enqueue(single_job("dup"), JobOptions::default()).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.id, "dup");
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let queue = create_test_queue();
        queue.enqueue(single_job("flaky"), fast_options(3)).await.unwrap();

        let mut leases = 0;
        while let Some(job) = queue.lease().await.unwrap() {
            leases += 1;
            let outcome = queue.fail(&job, JobFailure::retryable("gateway down")).await.unwrap();
            if leases < 3 {
                assert!(matches!(outcome, FailOutcome::Retrying { .. }));
            } else {
                assert_eq!(outcome, FailOutcome::Exhausted);
            }
        }

        assert_eq!(leases, 3);
        let record = queue.get_job("flaky").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Exhausted);
        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.failed_reason.as_deref(), Some("gateway down"));
    }

    #[tokio::test]
    async fn test_fatal_failure_exhausts_immediately() {
        let queue = create_test_queue();
        queue.enqueue(single_job("bad"), JobOptions::default()).await.unwrap();

        let job = queue.lease().await.unwrap().unwrap();
        let outcome = queue.fail(&job, JobFailure::fatal("invalid phone")).await.unwrap();

        assert_eq!(outcome, FailOutcome::Exhausted);
        assert!(queue.lease().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_next_lease() {
        let queue = create_test_queue();
        queue.enqueue(single_job("retry"), JobOptions::default()).await.unwrap();

        let job = queue.lease().await.unwrap().unwrap();
        let outcome = queue.fail(&job, JobFailure::retryable("timeout")).await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { delay: Duration::from_millis(5000) });

        assert!(queue.lease().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_millis(5000)).await;
        let job = queue.lease().await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_pause_hides_jobs() {
        let queue = create_test_queue();
        queue.enqueue(single_job("paused"), JobOptions::default()).await.unwrap();

        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());
        assert!(queue.lease().await.unwrap().is_none());

        queue.resume().await.unwrap();
        assert!(queue.lease().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_recovered() {
        let queue = create_test_queue();
        queue.enqueue(single_job("stalled"), JobOptions::default()).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        assert!(queue.lease().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.lease().await.unwrap().unwrap();
        assert_eq!(second.id, "stalled");
        assert_eq!(second.attempts_made, 2);

        // The first worker's lease is gone
        let result = queue.ack(&first, Value::Null).await;
        assert!(matches!(result, Err(QueueError::LeaseLost(_))));
        queue.ack(&second, Value::Null).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_lease_is_not_recovered() {
        let queue = create_test_queue();
        queue.enqueue(single_job("long"), JobOptions::default()).await.unwrap();

        let job = queue.lease().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        queue.extend_lease(&job).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        // 40s after the lease was taken, but only 20s after the extension
        assert!(queue.lease().await.unwrap().is_none());
        queue.ack(&job, Value::Null).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_after_recovery_is_rejected() {
        let queue = create_test_queue();
        queue.enqueue(single_job("stalled"), JobOptions::default()).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.lease().await.unwrap().unwrap();

        let result = queue.extend_lease(&first).await;
        assert!(matches!(result, Err(QueueError::LeaseLost(_))));
        queue.extend_lease(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_final_lease_exhausts() {
        let queue = create_test_queue();
        queue.enqueue(single_job("last"), fast_options(1)).await.unwrap();

        queue.lease().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(queue.lease().await.unwrap().is_none());
        let record = queue.get_job("last").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Exhausted);
        assert_eq!(record.failed_reason.as_deref(), Some("lease expired after 1 attempt(s)"));
    }

    #[tokio::test]
    async fn test_remove_on_complete() {
        let queue = create_test_queue();
        let options = JobOptions {
            retention: Retention { remove_on_complete: true, keep_failed: None },
            ..JobOptions::default()
        };
        queue.enqueue(single_job("gone"), options).await.unwrap();

        let job = queue.lease().await.unwrap().unwrap();
        queue.ack(&job, Value::Null).await.unwrap();

        assert!(queue.get_job("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keep_failed_prunes_oldest() {
        let queue = create_test_queue();
        let options = JobOptions {
            retention: Retention { remove_on_complete: false, keep_failed: Some(2) },
            ..JobOptions::default()
        };

        for i in 1..=3 {
            queue.enqueue(single_job(&format!("job-{}", i)), options).await.unwrap();
            let job = queue.lease().await.unwrap().unwrap();
            queue.fail(&job, JobFailure::fatal("rejected")).await.unwrap();
        }

        assert!(queue.get_job("job-1").await.unwrap().is_none());
        assert!(queue.get_job("job-2").await.unwrap().is_some());
        assert!(queue.get_job("job-3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_jobs_paging() {
        let queue = create_test_queue();
        for i in 1..=5 {
            queue.enqueue(single_job(&format!("job-{}", i)), JobOptions::default()).await.unwrap();
        }
        let job = queue.lease().await.unwrap().unwrap();
        queue.ack(&job, Value::Null).await.unwrap();

        let page = queue.list_jobs(&[JobState::Waiting], 0, 1, true).await.unwrap();
        assert_eq!(page.total, 4);
        let ids: Vec<_> = page.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-2", "job-3"]);

        let page = queue.list_jobs(&[], 0, 0, false).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs[0].id, "job-5");

        let page = queue.list_jobs(&[JobState::Completed], 1, 10, true).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_calls() {
        let queue = create_test_queue();
        queue.close().await;

        let result = queue.enqueue(single_job("late"), JobOptions::default()).await;
        assert!(matches!(result, Err(QueueError::Stopped)));
        assert!(matches!(queue.lease().await, Err(QueueError::Stopped)));
    }
}
