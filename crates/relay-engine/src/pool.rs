//! Worker Pool - concurrent lease loops over a job queue
//!
//! Each worker leases one job, runs it through the engine, acks or fails it
//! and immediately leases the next. Idle workers poll with jitter so that
//! a fleet of workers does not hit the queue in lockstep.
//!
//! While a job runs its lease is extended every third of the lease timeout,
//! so paced Bulk and MultiBlock jobs are never handed to a second worker.

use rand::Rng;
use relay_common::{duration_ms, DispatchJob, FailOutcome, JobFailure, JobOutput};
use relay_queue::{JobQueue, QueueError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::engine::DispatchEngine;
use crate::error::EngineError;
use crate::job_metrics;

/// Floor for the lease heartbeat period
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Pause after finding the queue empty
    pub poll_interval: Duration,
    /// Upper bound of the random extra pause added to each poll
    pub poll_jitter: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            poll_jitter: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    engine: Arc<DispatchEngine>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, engine: Arc<DispatchEngine>, config: PoolConfig) -> Self {
        Self { queue, engine, config }
    }

    /// Spawn the workers. They run until [`PoolHandle::shutdown`] is called
    /// or the queue is closed.
    pub fn start(&self) -> PoolHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let concurrency = self.config.concurrency.max(1);

        info!(
            queue = %self.queue.name(),
            concurrency,
            poll_interval_ms = duration_ms(self.config.poll_interval),
            "Starting worker pool"
        );

        let workers = (0..concurrency)
            .map(|worker_id| {
                let queue = self.queue.clone();
                let engine = self.engine.clone();
                let config = self.config.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(run_worker(worker_id, queue, engine, config, shutdown_rx))
            })
            .collect();

        PoolHandle {
            shutdown_tx,
            workers,
            shutdown_grace: self.config.shutdown_grace,
        }
    }
}

/// Running pool. Dropping the handle stops the workers after their current job.
pub struct PoolHandle {
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl PoolHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop leasing, wait up to the grace period for in-flight jobs, then
    /// abort whatever is still running. Aborted jobs keep their lease until
    /// it expires and are picked up again later.
    pub async fn shutdown(self) {
        info!(workers = self.workers.len(), "Shutting down worker pool");
        // No receivers left means every worker already stopped
        let _ = self.shutdown_tx.send(());

        let abort_handles: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        let all_stopped = futures::future::join_all(self.workers);

        match tokio::time::timeout(self.shutdown_grace, all_stopped).await {
            Ok(_) => info!("Worker pool stopped"),
            Err(_) => {
                let unfinished = abort_handles.iter().filter(|h| !h.is_finished()).count();
                warn!(
                    unfinished,
                    grace_secs = self.shutdown_grace.as_secs(),
                    "Shutdown grace period elapsed, aborting in-flight jobs"
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    engine: Arc<DispatchEngine>,
    config: PoolConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(worker_id, "Worker started");

    loop {
        if shutdown_requested(&mut shutdown_rx) {
            break;
        }

        let job = match queue.lease().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                if idle(&mut shutdown_rx, poll_delay(&config)).await {
                    break;
                }
                continue;
            }
            Err(QueueError::Stopped) => {
                info!(worker_id, "Queue closed, worker stopping");
                break;
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to lease job");
                if idle(&mut shutdown_rx, poll_delay(&config)).await {
                    break;
                }
                continue;
            }
        };

        let span = info_span!(
            "dispatch_job",
            worker_id,
            job_id = %job.id,
            mode = %job.mode(),
            attempt = job.attempts_made,
        );
        process_job(queue.as_ref(), &engine, job).instrument(span).await;
    }

    debug!(worker_id, "Worker stopped");
}

async fn process_job(queue: &dyn JobQueue, engine: &DispatchEngine, job: DispatchJob) {
    let mode = job.mode();
    let started = Instant::now();

    let result = run_with_heartbeat(queue, engine, &job)
        .await
        .and_then(|output| serde_json::to_value(&output).map_err(EngineError::from));
    job_metrics::record_job_duration(mode, started.elapsed());

    match result {
        Ok(return_value) => match queue.ack(&job, return_value).await {
            Ok(()) => {
                job_metrics::record_job_completed(mode);
                info!("Job completed");
            }
            Err(e) => warn!(error = %e, "Failed to ack job"),
        },
        Err(e) => {
            let failure = JobFailure {
                reason: e.to_string(),
                retryable: e.is_retryable(),
            };
            match queue.fail(&job, failure).await {
                Ok(FailOutcome::Retrying { delay }) => {
                    job_metrics::record_job_failed(mode, e.kind());
                    warn!(
                        error = %e,
                        retry_in_ms = duration_ms(delay),
                        max_attempts = job.max_attempts,
                        "Job failed, retry scheduled"
                    );
                }
                Ok(FailOutcome::Exhausted) => {
                    job_metrics::record_job_exhausted(mode, e.kind());
                    error!(
                        error = %e,
                        retryable = e.is_retryable(),
                        max_attempts = job.max_attempts,
                        "Job failed permanently"
                    );
                }
                Err(qe) => error!(error = %e, queue_error = %qe, "Failed to record job failure"),
            }
        }
    }
}

/// Execute the job, extending its lease until the engine returns
async fn run_with_heartbeat(
    queue: &dyn JobQueue,
    engine: &DispatchEngine,
    job: &DispatchJob,
) -> Result<JobOutput, EngineError> {
    let period = heartbeat_period(queue.lease_timeout());
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let execution = engine.execute(job);
    tokio::pin!(execution);

    loop {
        tokio::select! {
            result = &mut execution => return result,
            _ = heartbeat.tick() => match queue.extend_lease(job).await {
                Ok(()) => debug!("Lease extended"),
                // The job keeps running; its ack will report the lost lease
                Err(e) => warn!(error = %e, "Failed to extend lease"),
            },
        }
    }
}

fn heartbeat_period(lease_timeout: Duration) -> Duration {
    (lease_timeout / 3).max(MIN_HEARTBEAT)
}

fn shutdown_requested(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

/// Wait for `delay`. Returns true when shutdown was signalled meanwhile.
async fn idle(shutdown_rx: &mut broadcast::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown_rx.recv() => true,
    }
}

fn poll_delay(config: &PoolConfig) -> Duration {
    let jitter_ms = duration_ms(config.poll_jitter);
    if jitter_ms == 0 {
        return config.poll_interval;
    }
    config.poll_interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_delay_within_jitter() {
        let config = PoolConfig {
            poll_interval: Duration::from_millis(100),
            poll_jitter: Duration::from_millis(50),
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = poll_delay(&config);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_poll_delay_without_jitter() {
        let config = PoolConfig {
            poll_interval: Duration::from_millis(100),
            poll_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(poll_delay(&config), Duration::from_millis(100));
    }

    #[test]
    fn test_heartbeat_period() {
        assert_eq!(heartbeat_period(Duration::from_secs(300)), Duration::from_secs(100));
        assert_eq!(heartbeat_period(Duration::from_secs(3)), Duration::from_secs(1));
        assert_eq!(heartbeat_period(Duration::ZERO), MIN_HEARTBEAT);
    }

    #[tokio::test]
    async fn test_shutdown_requested() {
        let (tx, mut rx) = broadcast::channel(1);
        assert!(!shutdown_requested(&mut rx));
        tx.send(()).unwrap();
        assert!(shutdown_requested(&mut rx));
    }
}
