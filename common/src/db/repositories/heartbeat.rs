// Worker heartbeat repository (singleton row, id = 1)

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::gpu::GpuSnapshot;
use crate::models::{WorkerHeartbeat, WorkerStatus};
use chrono::Utc;
use tracing::instrument;

pub struct HeartbeatRepository {
    pool: DbPool,
}

impl HeartbeatRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Claim the heartbeat row at worker startup
    #[instrument(skip(self))]
    pub async fn register(&self, pid: i32) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeat (id, status, worker_pid, worker_started_at, last_seen)
            VALUES (1, 'idle', $1, $2, $2)
            ON CONFLICT (id) DO UPDATE
            SET status = 'idle', current_job_id = NULL,
                worker_pid = $1, worker_started_at = $2, last_seen = $2
            "#,
        )
        .bind(pid)
        .bind(now)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(pid = pid, "Worker heartbeat registered");
        Ok(())
    }

    /// Refresh liveness; the scheduler calls this every loop iteration
    #[instrument(skip(self, gpu))]
    pub async fn beat(
        &self,
        status: WorkerStatus,
        current_job_id: Option<&str>,
        gpu: Option<&GpuSnapshot>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeat (id, status, current_job_id, gpu_memory_percent, gpu_temperature, last_seen)
            VALUES (1, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET status = $1, current_job_id = $2,
                gpu_memory_percent = $3, gpu_temperature = $4, last_seen = $5
            "#,
        )
        .bind(status.to_string())
        .bind(current_job_id)
        .bind(gpu.map(|g| g.memory_percent))
        .bind(gpu.map(|g| g.temperature_c))
        .bind(now)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Record which model currently occupies the GPU
    #[instrument(skip(self))]
    pub async fn set_loaded_model(&self, model: Option<&str>) -> Result<(), StoreError> {
        let loaded_at = model.map(|_| Utc::now());
        sqlx::query(
            r#"
            UPDATE worker_heartbeat
            SET loaded_model = $1, model_loaded_at = $2, last_seen = $3
            WHERE id = 1
            "#,
        )
        .bind(model)
        .bind(loaded_at)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self) -> Result<Option<WorkerHeartbeat>, StoreError> {
        let heartbeat =
            sqlx::query_as::<_, WorkerHeartbeat>("SELECT * FROM worker_heartbeat WHERE id = 1")
                .fetch_optional(self.pool.pool())
                .await?;
        Ok(heartbeat)
    }
}
