// Scheduler engine: the single-threaded loop that owns the GPU worker.
//
// Every poll it refreshes the heartbeat, sweeps expired and orphaned jobs,
// then runs at most one job to a terminal state before looking again.
// Higher-priority jobs never preempt a running job; selection happens only
// at job boundaries.

use crate::db::repositories::{BatchJobRepository, HeartbeatRepository};
use crate::db::DbPool;
use crate::errors::{RunnerError, StoreError};
use crate::gpu::HealthProbe;
use crate::models::{BatchJob, WorkerStatus};
use crate::runner::BatchRunner;
use crate::telemetry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to poll for pending jobs (in seconds)
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
        }
    }
}

/// The worker's scheduling loop
pub struct WorkerScheduler {
    config: SchedulerConfig,
    jobs: BatchJobRepository,
    heartbeat: HeartbeatRepository,
    runner: BatchRunner,
    probe: Arc<dyn HealthProbe>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl WorkerScheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: DbPool,
        runner: BatchRunner,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

        Self {
            config,
            jobs: BatchJobRepository::new(pool.clone()),
            heartbeat: HeartbeatRepository::new(pool),
            runner,
            probe,
            shutdown_tx,
        }
    }

    /// Signal the loop to stop after the current job finishes
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the polling loop until a shutdown signal arrives.
    ///
    /// Store integrity errors propagate out so the process crashes and the
    /// watchdog restarts it; everything else is logged and retried after one
    /// poll interval so a bad job never blocks the queue.
    pub async fn run(&self) -> Result<(), RunnerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);

        info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler loop");
                    return Ok(());
                }
                outcome = self.tick() => {
                    match outcome {
                        Ok(ran_job) => {
                            if !ran_job {
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                        Err(RunnerError::Store(StoreError::InvalidTransition { batch_id, detail })) => {
                            // Guard rejection means state corruption; crash
                            // and let the watchdog restart the worker
                            error!(batch_id = %batch_id, detail = %detail, "Store transition guard rejected an update");
                            return Err(RunnerError::Store(StoreError::InvalidTransition {
                                batch_id,
                                detail,
                            }));
                        }
                        Err(e) => {
                            warn!(error = %e, "Scheduler tick failed, retrying after poll interval");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    /// One iteration: heartbeat, sweeps, then at most one job.
    /// Returns whether a job was run.
    #[instrument(skip(self))]
    async fn tick(&self) -> Result<bool, RunnerError> {
        let snapshot = self.probe.read().await;
        self.heartbeat
            .beat(WorkerStatus::Idle, None, snapshot.as_ref())
            .await?;

        let now = Utc::now().timestamp();
        let expired = self.jobs.sweep_expired(now).await?;
        if expired > 0 {
            warn!(count = expired, "Expired pending jobs past their completion window");
        }
        let orphaned = self.jobs.sweep_orphaned_cancelling(now).await?;
        if orphaned > 0 {
            warn!(count = orphaned, "Cancelled jobs orphaned in cancelling state");
        }

        telemetry::update_queue_depth(self.jobs.count_active().await?);

        let Some(job) = self.select_job().await? else {
            return Ok(false);
        };

        info!(
            batch_id = %job.batch_id,
            status = %job.status,
            priority = job.priority,
            "Picked job"
        );

        let snapshot = self.probe.read().await;
        self.heartbeat
            .beat(WorkerStatus::Processing, Some(&job.batch_id), snapshot.as_ref())
            .await?;

        // Blocks until the job reaches a terminal state; that is the
        // single-GPU contract, not an oversight
        self.runner.run(job).await?;

        Ok(true)
    }

    /// Interrupted jobs first (crash recovery), then the pending queue by
    /// priority and age
    async fn select_job(&self) -> Result<Option<BatchJob>, RunnerError> {
        if let Some(job) = self.jobs.select_interrupted().await? {
            return Ok(Some(job));
        }
        Ok(self.jobs.select_next_pending().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_poll_interval() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_seconds, 10);
    }
}
