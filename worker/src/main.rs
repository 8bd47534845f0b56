// Worker binary entry point: the single GPU worker hosting the scheduler
// loop and the batch runner.

use anyhow::Result;
use common::config::Settings;
use common::runner::BatchRunner;
use common::scheduler::{SchedulerConfig, WorkerScheduler};
use common::webhook::WebhookDispatcher;
use common::{bootstrap, gpu, telemetry};
use std::sync::Arc;
use tracing::{error, info};

mod model;

use model::HttpModelRunner;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    bootstrap::init_json_tracing();

    info!("Starting batch worker");

    // Load configuration
    let settings = Settings::load()?;
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;
    info!(
        poll_interval_seconds = settings.runner.poll_interval_seconds,
        chunk_size = settings.runner.chunk_size,
        inference_url = %settings.inference.base_url,
        "Configuration loaded"
    );

    // Initialize database pool and data directories
    let db_pool = bootstrap::init_database_pool(&settings).await?;
    bootstrap::init_data_dirs(&settings).await?;

    // Initialize Prometheus metrics exporter
    if let Err(e) = telemetry::init_metrics(settings.observability.metrics_port) {
        // Metrics are not worth refusing to process jobs over
        error!(error = %e, "Failed to initialize metrics exporter");
    }

    // Claim the heartbeat row so observers can tell this worker is alive
    let heartbeat = common::db::repositories::HeartbeatRepository::new(db_pool.clone());
    heartbeat.register(std::process::id() as i32).await?;

    // External capabilities: the model runner service and the GPU probe
    let model_runner = Arc::new(HttpModelRunner::new(&settings.inference.base_url));
    let probe = gpu::probe_from_config(&settings.gpu);

    // Webhook dispatcher shared with the runner
    let dispatcher = WebhookDispatcher::new(db_pool.clone(), settings.webhook.clone());

    // Batch runner and the scheduler loop that drives it
    let runner = BatchRunner::new(
        db_pool.clone(),
        model_runner,
        probe.clone(),
        dispatcher,
        &settings.runner,
        &settings.storage,
    );
    let scheduler = Arc::new(WorkerScheduler::new(
        SchedulerConfig {
            poll_interval_seconds: settings.runner.poll_interval_seconds,
        },
        db_pool,
        runner,
        probe,
    ));

    // Graceful shutdown: finish the current job, then stop polling
    let scheduler_for_shutdown = scheduler.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received Ctrl+C signal, initiating graceful shutdown");
            scheduler_for_shutdown.stop();
        }
    });

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");
    if let Err(e) = scheduler.run().await {
        // A store integrity error lands here; crash so the watchdog restarts
        // us and the interrupted job resumes from its output file
        error!(error = %e, "Scheduler loop aborted");
        return Err(anyhow::anyhow!("scheduler loop aborted: {}", e));
    }

    info!("Worker shutdown complete");
    Ok(())
}
