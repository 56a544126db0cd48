use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use relay_common::{
    BackoffPolicy, DispatchJob, FailOutcome, JobCounts, JobData, JobFailure, JobHandle,
    JobOptions, JobPage, JobRecord, JobState, NewJob,
};

use crate::{fail_outcome, lease_expired_reason, page_bounds, JobQueue, QueueError, Result};

/// Candidates examined per lease attempt before giving up for this poll
const LEASE_CANDIDATES: i64 = 16;

const RECORD_COLUMNS: &str = "id, mode, payload, state, attempts_made, max_attempts, \
    failed_reason, return_value, created_at, processed_on, finished_on";

/// SQLite-backed job queue. Several workers (or processes) may share one
/// database; leases are taken with a conditional UPDATE so a job is handed
/// to at most one of them.
pub struct SqliteJobQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    lease_timeout: Duration,
    running: AtomicBool,
}

impl SqliteJobQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: impl Into<String>, lease_timeout: Duration) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            lease_timeout,
            running: AtomicBool::new(true),
        }
    }

    /// Create the queue tables
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                id TEXT NOT NULL,
                mode TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff TEXT NOT NULL,
                remove_on_complete INTEGER NOT NULL DEFAULT 0,
                keep_failed INTEGER,
                lease_token TEXT,
                visible_at INTEGER NOT NULL,
                lease_expires_at INTEGER,
                failed_reason TEXT,
                return_value TEXT,
                created_at INTEGER NOT NULL,
                processed_on INTEGER,
                finished_on INTEGER,
                finished_seq INTEGER,
                UNIQUE(queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_state
            ON dispatch_jobs (queue_name, state, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_queue_meta (
                queue_name TEXT PRIMARY KEY,
                paused INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite job queue schema initialized");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Stopped)
        }
    }

    fn lease_timeout_ms(&self) -> i64 {
        i64::try_from(self.lease_timeout.as_millis()).unwrap_or(i64::MAX)
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_queue_meta (queue_name, paused) VALUES (?, ?)
            ON CONFLICT(queue_name) DO UPDATE SET paused = excluded.paused
            "#,
        )
        .bind(&self.queue_name)
        .bind(paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a job to `exhausted` and prune older exhausted jobs if it asks for it.
    /// `finished_seq` records exhaustion order, which millisecond timestamps can't.
    /// Returns false when the job no longer holds the lease.
    async fn exhaust(&self, id: &str, lease_token: &str, reason: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET state = 'exhausted', lease_token = NULL, lease_expires_at = NULL,
                failed_reason = ?, finished_on = ?, finished_seq = (
                    SELECT COALESCE(MAX(finished_seq), 0) + 1 FROM dispatch_jobs
                    WHERE queue_name = ?
                )
            WHERE queue_name = ? AND id = ? AND lease_token = ? AND state = 'active'
            RETURNING keep_failed
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(&self.queue_name)
        .bind(&self.queue_name)
        .bind(id)
        .bind(lease_token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let keep_failed: Option<i64> = row.get("keep_failed");
        if let Some(keep) = keep_failed {
            let pruned = sqlx::query(
                r#"
                DELETE FROM dispatch_jobs
                WHERE queue_name = ? AND state = 'exhausted' AND seq NOT IN (
                    SELECT seq FROM dispatch_jobs
                    WHERE queue_name = ? AND state = 'exhausted'
                    ORDER BY finished_seq DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(&self.queue_name)
            .bind(&self.queue_name)
            .bind(keep)
            .execute(&self.pool)
            .await?;

            if pruned.rows_affected() > 0 {
                debug!(
                    queue = %self.queue_name,
                    pruned = pruned.rows_affected(),
                    "Pruned exhausted jobs"
                );
            }
        }

        Ok(true)
    }

    /// Exhaust active jobs whose lease expired on their final attempt
    async fn exhaust_stalled(&self, now: i64) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT id, lease_token, attempts_made FROM dispatch_jobs
            WHERE queue_name = ? AND state = 'active'
              AND lease_expires_at <= ? AND attempts_made >= max_attempts
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: String = row.get("id");
            let lease_token: Option<String> = row.get("lease_token");
            let attempts: i64 = row.get("attempts_made");
            let Some(lease_token) = lease_token else {
                continue;
            };

            let reason = lease_expired_reason(attempts as u32);
            if self.exhaust(&id, &lease_token, &reason).await? {
                warn!(
                    job_id = %id,
                    attempts,
                    queue = %self.queue_name,
                    "Lease expired on final attempt, exhausting job"
                );
            }
        }

        Ok(())
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn row_to_record(row: &SqliteRow) -> Result<JobRecord> {
    let payload: String = row.get("payload");
    let data: JobData = serde_json::from_str(&payload)?;
    let state: String = row.get("state");
    let state: JobState = state.parse().map_err(QueueError::Database)?;
    let return_value: Option<String> = row.get("return_value");
    let return_value = return_value
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()?;
    let attempts_made: i64 = row.get("attempts_made");
    let max_attempts: i64 = row.get("max_attempts");
    let created_at: i64 = row.get("created_at");
    let processed_on: Option<i64> = row.get("processed_on");
    let finished_on: Option<i64> = row.get("finished_on");

    Ok(JobRecord {
        id: row.get("id"),
        mode: data.payload.mode(),
        channel_instance: data.channel_instance,
        payload: data.payload,
        state,
        attempts_made: attempts_made as u32,
        max_attempts: max_attempts as u32,
        failed_reason: row.get("failed_reason"),
        return_value,
        created_at: millis_to_datetime(created_at),
        processed_on: processed_on.map(millis_to_datetime),
        finished_on: finished_on.map(millis_to_datetime),
    })
}

fn state_filter(states: &[JobState]) -> String {
    if states.is_empty() {
        return String::new();
    }
    let placeholders = vec!["?"; states.len()].join(", ");
    format!(" AND state IN ({})", placeholders)
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn name(&self) -> &str {
        &self.queue_name
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
        let payload = serde_json::to_string(&job.data())?;
        let backoff = serde_json::to_string(&options.backoff)?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO dispatch_jobs (
                queue_name, id, mode, payload, state, max_attempts, backoff,
                remove_on_complete, keep_failed, visible_at, created_at
            )
            VALUES (?, ?, ?, ?, 'waiting', ?, ?, ?, ?, ?, ?)
            ON CONFLICT(queue_name, id) DO NOTHING
            "#,
        )
        .bind(&self.queue_name)
        .bind(&id)
        .bind(job.payload.mode().as_str())
        .bind(&payload)
        .bind(options.max_attempts as i64)
        .bind(&backoff)
        .bind(options.retention.remove_on_complete)
        .bind(options.retention.keep_failed.map(|keep| keep as i64))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(job_id = %id, queue = %self.queue_name, "Duplicate job id, keeping existing job");
            return Ok(JobHandle { id, created: false });
        }

        debug!(
            job_id = %id,
            mode = %job.payload.mode(),
            queue = %self.queue_name,
            "Job enqueued"
        );
        Ok(JobHandle { id, created: true })
    }

    async fn lease(&self) -> Result<Option<DispatchJob>> {
        self.ensure_running()?;

        if self.is_paused().await? {
            return Ok(None);
        }

        let now = Utc::now().timestamp_millis();
        self.exhaust_stalled(now).await?;

        let candidates = sqlx::query(
            r#"
            SELECT seq, state, attempts_made FROM dispatch_jobs
            WHERE queue_name = ? AND (
                state = 'waiting'
                OR (state = 'delayed' AND visible_at <= ?)
                OR (state = 'active' AND lease_expires_at <= ?)
            )
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(now)
        .bind(LEASE_CANDIDATES)
        .fetch_all(&self.pool)
        .await?;

        for candidate in candidates {
            let seq: i64 = candidate.get("seq");
            let state: String = candidate.get("state");
            let attempts_made: i64 = candidate.get("attempts_made");
            let lease_token = uuid::Uuid::new_v4().to_string();

            let row = sqlx::query(
                r#"
                UPDATE dispatch_jobs
                SET state = 'active', attempts_made = attempts_made + 1, lease_token = ?,
                    lease_expires_at = ?, processed_on = ?
                WHERE seq = ? AND state = ? AND attempts_made = ?
                RETURNING id, payload, attempts_made, max_attempts, backoff
                "#,
            )
            .bind(&lease_token)
            .bind(now.saturating_add(self.lease_timeout_ms()))
            .bind(now)
            .bind(seq)
            .bind(&state)
            .bind(attempts_made)
            .fetch_optional(&self.pool)
            .await?;

            // Another worker leased it first
            let Some(row) = row else {
                continue;
            };

            let id: String = row.get("id");
            if state == JobState::Active.as_str() {
                warn!(job_id = %id, queue = %self.queue_name, "Recovering job with expired lease");
            }

            let payload: String = row.get("payload");
            let data: JobData = serde_json::from_str(&payload)?;
            let backoff: String = row.get("backoff");
            let backoff: BackoffPolicy = serde_json::from_str(&backoff)?;
            let attempts_made: i64 = row.get("attempts_made");
            let max_attempts: i64 = row.get("max_attempts");

            return Ok(Some(DispatchJob {
                id,
                channel_instance: data.channel_instance,
                payload: data.payload,
                attempts_made: attempts_made as u32,
                max_attempts: max_attempts as u32,
                backoff,
                lease_token,
            }));
        }

        Ok(None)
    }

    async fn extend_lease(&self, job: &DispatchJob) -> Result<()> {
        self.ensure_running()?;

        let expires_at = Utc::now()
            .timestamp_millis()
            .saturating_add(self.lease_timeout_ms());
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs SET lease_expires_at = ?
            WHERE queue_name = ? AND id = ? AND lease_token = ? AND state = 'active'
            "#,
        )
        .bind(expires_at)
        .bind(&self.queue_name)
        .bind(&job.id)
        .bind(&job.lease_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job.id.clone()));
        }
        Ok(())
    }

    async fn ack(&self, job: &DispatchJob, return_value: Value) -> Result<()> {
        self.ensure_running()?;

        let row = sqlx::query(
            r#"
            SELECT remove_on_complete FROM dispatch_jobs
            WHERE queue_name = ? AND id = ? AND lease_token = ? AND state = 'active'
            "#,
        )
        .bind(&self.queue_name)
        .bind(&job.id)
        .bind(&job.lease_token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            warn!(job_id = %job.id, queue = %self.queue_name, "ACK rejected, lease no longer held");
            return Err(QueueError::LeaseLost(job.id.clone()));
        };

        let remove_on_complete: bool = row.get("remove_on_complete");
        let result = if remove_on_complete {
            sqlx::query(
                "DELETE FROM dispatch_jobs WHERE queue_name = ? AND id = ? AND lease_token = ?",
            )
            .bind(&self.queue_name)
            .bind(&job.id)
            .bind(&job.lease_token)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE dispatch_jobs
                SET state = 'completed', lease_token = NULL, lease_expires_at = NULL,
                    return_value = ?, finished_on = ?
                WHERE queue_name = ? AND id = ? AND lease_token = ?
                "#,
            )
            .bind(serde_json::to_string(&return_value)?)
            .bind(Utc::now().timestamp_millis())
            .bind(&self.queue_name)
            .bind(&job.id)
            .bind(&job.lease_token)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job.id.clone()));
        }

        debug!(job_id = %job.id, queue = %self.queue_name, removed = remove_on_complete, "Job completed");
        Ok(())
    }

    async fn fail(&self, job: &DispatchJob, failure: JobFailure) -> Result<FailOutcome> {
        self.ensure_running()?;

        let outcome = fail_outcome(&failure, job);
        let held = match outcome {
            FailOutcome::Retrying { delay } => {
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let visible_at = Utc::now().timestamp_millis().saturating_add(delay_ms);
                let result = sqlx::query(
                    r#"
                    UPDATE dispatch_jobs
                    SET state = 'delayed', lease_token = NULL, lease_expires_at = NULL,
                        visible_at = ?, failed_reason = ?
                    WHERE queue_name = ? AND id = ? AND lease_token = ? AND state = 'active'
                    "#,
                )
                .bind(visible_at)
                .bind(&failure.reason)
                .bind(&self.queue_name)
                .bind(&job.id)
                .bind(&job.lease_token)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() > 0 {
                    debug!(job_id = %job.id, delay_ms, "Job scheduled for retry");
                }
                result.rows_affected() > 0
            }
            FailOutcome::Exhausted => {
                let exhausted = self.exhaust(&job.id, &job.lease_token, &failure.reason).await?;
                if exhausted {
                    info!(
                        job_id = %job.id,
                        attempts = job.attempts_made,
                        queue = %self.queue_name,
                        "Job exhausted"
                    );
                }
                exhausted
            }
        };

        if !held {
            warn!(job_id = %job.id, queue = %self.queue_name, "Fail rejected, lease no longer held");
            return Err(QueueError::LeaseLost(job.id.clone()));
        }

        Ok(outcome)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM dispatch_jobs WHERE queue_name = ? AND id = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&self.queue_name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
        ascending: bool,
    ) -> Result<JobPage> {
        let filter = state_filter(states);

        let count_sql = format!(
            "SELECT COUNT(*) AS count FROM dispatch_jobs WHERE queue_name = ?{}",
            filter
        );
        let mut count_query = sqlx::query(&count_sql).bind(&self.queue_name);
        for state in states {
            count_query = count_query.bind(state.as_str());
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");
        let total = total as u64;

        let Some((first, last)) = page_bounds(total as usize, start, end) else {
            return Ok(JobPage { jobs: Vec::new(), total });
        };

        let sql = format!(
            "SELECT {} FROM dispatch_jobs WHERE queue_name = ?{} ORDER BY seq {} LIMIT ? OFFSET ?",
            RECORD_COLUMNS,
            filter,
            if ascending { "ASC" } else { "DESC" }
        );
        let mut query = sqlx::query(&sql).bind(&self.queue_name);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query
            .bind((last - first + 1) as i64)
            .bind(first as i64)
            .fetch_all(&self.pool)
            .await?;

        let jobs = rows.iter().map(row_to_record).collect::<Result<Vec<_>>>()?;
        Ok(JobPage { jobs, total })
    }

    async fn counts(&self) -> Result<JobCounts> {
        let now = Utc::now().timestamp_millis();
        let rows = sqlx::query(
            r#"
            SELECT
                CASE WHEN state = 'delayed' AND visible_at <= ? THEN 'waiting' ELSE state END AS effective_state,
                COUNT(*) AS count
            FROM dispatch_jobs
            WHERE queue_name = ?
            GROUP BY effective_state
            "#,
        )
        .bind(now)
        .bind(&self.queue_name)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.get("effective_state");
            let count: i64 = row.get("count");
            let Ok(state) = state.parse::<JobState>() else {
                continue;
            };
            counts.add(state, count as u64);
        }

        Ok(counts)
    }

    async fn pause(&self) -> Result<()> {
        self.set_paused(true).await?;
        info!(queue = %self.queue_name, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.set_paused(false).await?;
        info!(queue = %self.queue_name, "Queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let row = sqlx::query("SELECT paused FROM dispatch_queue_meta WHERE queue_name = ?")
            .bind(&self.queue_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<bool, _>("paused")).unwrap_or(false))
    }

    async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite job queue closed");
    }
}
