// Batch job repository: all BatchJob mutations go through here so the
// status-transition guard cannot be bypassed.

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::gpu::GpuSnapshot;
use crate::models::{BatchJob, BatchStatus, StoredFile};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

pub struct BatchJobRepository {
    pool: DbPool,
}

impl BatchJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new job row in `validating` state
    #[instrument(skip(self, job), fields(batch_id = %job.batch_id))]
    pub async fn create(&self, job: &BatchJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                batch_id, endpoint, input_file_id, completion_window, status,
                created_at, expires_at,
                total_requests, completed_requests, failed_requests,
                metadata_json, model, priority,
                webhook_url, webhook_secret, webhook_events,
                webhook_max_retries, webhook_timeout
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(&job.batch_id)
        .bind(&job.endpoint)
        .bind(&job.input_file_id)
        .bind(&job.completion_window)
        .bind(job.status.to_string())
        .bind(job.created_at)
        .bind(job.expires_at)
        .bind(job.total_requests)
        .bind(job.completed_requests)
        .bind(job.failed_requests)
        .bind(&job.metadata_json)
        .bind(&job.model)
        .bind(job.priority)
        .bind(&job.webhook_url)
        .bind(&job.webhook_secret)
        .bind(&job.webhook_events)
        .bind(job.webhook_max_retries)
        .bind(job.webhook_timeout)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(batch_id = %job.batch_id, model = %job.model, "Batch job created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, batch_id: &str) -> Result<Option<BatchJob>, StoreError> {
        let job = sqlx::query_as::<_, BatchJob>("SELECT * FROM batch_jobs WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(job)
    }

    /// Fetch only the current status; used at chunk boundaries
    #[instrument(skip(self))]
    pub async fn status_of(&self, batch_id: &str) -> Result<BatchStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM batch_jobs WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_optional(self.pool.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))?;

        let status: String = row.try_get("status")?;
        status
            .parse()
            .map_err(|e: String| StoreError::QueryFailed(e))
    }

    #[instrument(skip(self))]
    pub async fn list(
        &self,
        status: Option<BatchStatus>,
        limit: i64,
    ) -> Result<Vec<BatchJob>, StoreError> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, BatchJob>(
                    "SELECT * FROM batch_jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(status.to_string())
                .bind(limit)
                .fetch_all(self.pool.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, BatchJob>(
                    "SELECT * FROM batch_jobs ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(self.pool.pool())
                .await?
            }
        };
        Ok(jobs)
    }

    /// Highest priority first, oldest `created_at` wins on tie
    #[instrument(skip(self))]
    pub async fn select_next_pending(&self) -> Result<Option<BatchJob>, StoreError> {
        let job = sqlx::query_as::<_, BatchJob>(
            r#"
            SELECT * FROM batch_jobs
            WHERE status = 'validating'
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(job)
    }

    /// A job left `in_progress` by a crashed worker; resumed before anything
    /// else is scheduled so its output file is not orphaned
    #[instrument(skip(self))]
    pub async fn select_interrupted(&self) -> Result<Option<BatchJob>, StoreError> {
        let job = sqlx::query_as::<_, BatchJob>(
            r#"
            SELECT * FROM batch_jobs
            WHERE status = 'in_progress'
            ORDER BY in_progress_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(job)
    }

    /// Transition pending jobs past their deadline to `expired`
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'expired', expired_at = $1
            WHERE status = 'validating' AND expires_at < $1
            "#,
        )
        .bind(now)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Finish cancellations left behind by a crashed worker. Safe to run only
    /// while no job is active; the scheduler calls it before selection.
    #[instrument(skip(self))]
    pub async fn sweep_orphaned_cancelling(&self, now: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'cancelled', cancelled_at = $1
            WHERE status = 'cancelling'
            "#,
        )
        .bind(now)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Jobs counted against queue-depth admission
    #[instrument(skip(self))]
    pub async fn count_active(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM batch_jobs WHERE status IN ('validating', 'in_progress', 'finalizing')",
        )
        .fetch_one(self.pool.pool())
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Sum of requests not yet completed across active jobs
    #[instrument(skip(self))]
    pub async fn sum_queued_requests(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(total_requests - completed_requests), 0) AS n
            FROM batch_jobs
            WHERE status IN ('validating', 'in_progress', 'finalizing')
            "#,
        )
        .fetch_one(self.pool.pool())
        .await?;
        Ok(row.try_get("n")?)
    }

    /// validating -> in_progress, on scheduler pickup
    #[instrument(skip(self))]
    pub async fn mark_in_progress(&self, batch_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'in_progress', in_progress_at = $2
            WHERE batch_id = $1 AND status = 'validating'
            "#,
        )
        .bind(batch_id)
        .bind(Utc::now().timestamp())
        .execute(self.pool.pool())
        .await?;

        self.guard(batch_id, "validating -> in_progress", result.rows_affected())
            .await
    }

    /// Align the progress counter with the lines already on disk after a
    /// crash; the output file is the source of truth
    #[instrument(skip(self))]
    pub async fn set_completed_requests(&self, batch_id: &str, n: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET completed_requests = $2
            WHERE batch_id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(batch_id)
        .bind(n)
        .execute(self.pool.pool())
        .await?;

        self.guard(batch_id, "resume progress sync", result.rows_affected())
            .await
    }

    /// Commit one chunk: advance counters and refresh the heartbeat in a
    /// single transaction
    #[instrument(skip(self, gpu))]
    #[allow(clippy::too_many_arguments)]
    pub async fn record_chunk_progress(
        &self,
        batch_id: &str,
        saved: i32,
        chunk_tokens: i64,
        throughput: f64,
        estimated_completion: Option<DateTime<Utc>>,
        gpu: Option<&GpuSnapshot>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        // A chunk that started before a cancellation request still commits;
        // 'cancelling' is therefore a legal state for progress writes
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET completed_requests = completed_requests + $2,
                tokens_processed = tokens_processed + $3,
                throughput_tokens_per_sec = $4,
                last_progress_update = $5,
                estimated_completion_time = $6
            WHERE batch_id = $1 AND status IN ('in_progress', 'cancelling')
            "#,
        )
        .bind(batch_id)
        .bind(saved)
        .bind(chunk_tokens)
        .bind(throughput)
        .bind(now)
        .bind(estimated_completion)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
            return self.guard(batch_id, "chunk progress", 0).await;
        }

        sqlx::query(
            r#"
            UPDATE worker_heartbeat
            SET last_seen = $1, gpu_memory_percent = $2, gpu_temperature = $3
            WHERE id = 1
            "#,
        )
        .bind(now)
        .bind(gpu.map(|g| g.memory_percent))
        .bind(gpu.map(|g| g.temperature_c))
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
        Ok(())
    }

    /// in_progress -> finalizing, once all chunks are on disk
    #[instrument(skip(self))]
    pub async fn mark_finalizing(&self, batch_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'finalizing', finalizing_at = $2
            WHERE batch_id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(batch_id)
        .bind(Utc::now().timestamp())
        .execute(self.pool.pool())
        .await?;

        self.guard(batch_id, "in_progress -> finalizing", result.rows_affected())
            .await
    }

    /// finalizing -> completed: register the output file and the job
    /// completion in a single transaction
    #[instrument(skip(self, output_file))]
    pub async fn mark_completed(
        &self,
        batch_id: &str,
        output_file: &StoredFile,
        total_tokens: i64,
        throughput_tokens_per_sec: f64,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO files (file_id, filename, bytes, purpose, created_at, path, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE)
            "#,
        )
        .bind(&output_file.file_id)
        .bind(&output_file.filename)
        .bind(output_file.bytes)
        .bind(output_file.purpose.to_string())
        .bind(output_file.created_at)
        .bind(&output_file.path)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'completed',
                completed_at = $2,
                output_file_id = $3,
                failed_requests = total_requests - completed_requests,
                total_tokens = $4,
                throughput_tokens_per_sec = $5
            WHERE batch_id = $1 AND status = 'finalizing'
            "#,
        )
        .bind(batch_id)
        .bind(Utc::now().timestamp())
        .bind(&output_file.file_id)
        .bind(total_tokens)
        .bind(throughput_tokens_per_sec)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
            return self.guard(batch_id, "finalizing -> completed", 0).await;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        tracing::info!(batch_id = %batch_id, output_file_id = %output_file.file_id, "Batch job completed");
        Ok(())
    }

    /// Any non-terminal running state -> failed
    #[instrument(skip(self, message))]
    pub async fn mark_failed(&self, batch_id: &str, message: &str) -> Result<(), StoreError> {
        let errors_json = serde_json::json!({ "message": message }).to_string();

        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'failed', failed_at = $2, errors_json = $3
            WHERE batch_id = $1 AND status IN ('validating', 'in_progress', 'finalizing')
            "#,
        )
        .bind(batch_id)
        .bind(Utc::now().timestamp())
        .bind(errors_json)
        .execute(self.pool.pool())
        .await?;

        self.guard(batch_id, "-> failed", result.rows_affected())
            .await
    }

    /// User cancellation: pending jobs cancel immediately, running jobs move
    /// to `cancelling` for the runner to observe at the next chunk boundary.
    /// Terminal jobs are rejected.
    #[instrument(skip(self))]
    pub async fn cancel(&self, batch_id: &str) -> Result<BatchJob, StoreError> {
        let now = Utc::now().timestamp();

        let direct = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'cancelled', cancelled_at = $2
            WHERE batch_id = $1 AND status = 'validating'
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .execute(self.pool.pool())
        .await?;

        if direct.rows_affected() == 0 {
            let deferred = sqlx::query(
                r#"
                UPDATE batch_jobs
                SET status = 'cancelling', cancelling_at = $2
                WHERE batch_id = $1 AND status = 'in_progress'
                "#,
            )
            .bind(batch_id)
            .bind(now)
            .execute(self.pool.pool())
            .await?;

            if deferred.rows_affected() == 0 {
                self.guard(batch_id, "cancel", 0).await?;
            }
        }

        self.get(batch_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))
    }

    /// cancelling -> cancelled, after the runner observes the flag
    #[instrument(skip(self))]
    pub async fn mark_cancelled(&self, batch_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = 'cancelled', cancelled_at = $2
            WHERE batch_id = $1 AND status = 'cancelling'
            "#,
        )
        .bind(batch_id)
        .bind(Utc::now().timestamp())
        .execute(self.pool.pool())
        .await?;

        self.guard(batch_id, "cancelling -> cancelled", result.rows_affected())
            .await
    }

    /// Record one webhook delivery attempt
    #[instrument(skip(self, error))]
    pub async fn record_webhook_attempt(
        &self,
        batch_id: &str,
        attempts: i32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET webhook_attempts = $2, webhook_last_attempt = $3, webhook_error = $4
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(attempts)
        .bind(Utc::now())
        .bind(error)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_webhook_sent(&self, batch_id: &str, attempts: i32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET webhook_status = 'sent', webhook_attempts = $2,
                webhook_last_attempt = $3, webhook_error = NULL
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(attempts)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    pub async fn mark_webhook_failed(
        &self,
        batch_id: &str,
        attempts: i32,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET webhook_status = 'failed', webhook_attempts = $2,
                webhook_last_attempt = $3, webhook_error = $4
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(attempts)
        .bind(Utc::now())
        .bind(error)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Turn a zero-row guarded update into a precise error: either the job is
    /// missing or its current status does not allow the transition
    async fn guard(
        &self,
        batch_id: &str,
        transition: &str,
        rows_affected: u64,
    ) -> Result<(), StoreError> {
        if rows_affected == 1 {
            return Ok(());
        }

        let current = sqlx::query("SELECT status FROM batch_jobs WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_optional(self.pool.pool())
            .await?;

        match current {
            None => Err(StoreError::NotFound(batch_id.to_string())),
            Some(row) => {
                let status: String = row.try_get("status")?;
                Err(StoreError::InvalidTransition {
                    batch_id: batch_id.to_string(),
                    detail: format!("{} rejected in status '{}'", transition, status),
                })
            }
        }
    }
}
