use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::handlers::ErrorResponse;
use crate::state::AppState;
use common::db::repositories::{BatchJobRepository, HeartbeatRepository};
use common::gpu::admission_rejection;

/// Health check endpoint with GPU status, worker liveness, queue info, and
/// database pool state
#[tracing::instrument(skip(state))]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ErrorResponse> {
    let snapshot = state.probe.read().await;
    let gpu_reason = admission_rejection(snapshot.as_ref(), &state.config.gpu);
    let gpu_healthy = gpu_reason.is_none();

    let db_latency = state.db_pool.ping().await;
    let db_healthy = db_latency.is_ok();
    let database = serde_json::json!({
        "healthy": db_healthy,
        "ping_ms": db_latency.as_ref().ok().map(|d| d.as_millis() as u64),
        "connections": state.db_pool.stats(),
    });

    // Without the database there is no queue or worker state to report
    if !db_healthy {
        return Ok(Json(serde_json::json!({
            "status": "degraded",
            "gpu": {
                "healthy": gpu_healthy,
                "memory_percent": snapshot.map(|s| s.memory_percent),
                "temperature_c": snapshot.map(|s| s.temperature_c),
                "reason": gpu_reason,
            },
            "database": database,
            "worker": { "status": "unknown", "alive": false },
        })));
    }

    let jobs = BatchJobRepository::new(state.db_pool.clone());
    let active_jobs = jobs.count_active().await?;
    let queued_requests = jobs.sum_queued_requests().await?;

    let heartbeat = HeartbeatRepository::new(state.db_pool.clone())
        .get()
        .await?;
    let now = Utc::now();
    let worker_alive = heartbeat
        .as_ref()
        .map(|hb| !hb.is_stale(now))
        .unwrap_or(false);

    let worker = match &heartbeat {
        Some(hb) => serde_json::json!({
            "status": hb.status,
            "alive": worker_alive,
            "current_job_id": hb.current_job_id,
            "loaded_model": hb.loaded_model,
            "worker_pid": hb.worker_pid,
            "last_seen": hb.last_seen.timestamp(),
        }),
        None => serde_json::json!({ "status": "unknown", "alive": false }),
    };

    let limits = &state.config.limits;
    Ok(Json(serde_json::json!({
        "status": if gpu_healthy && worker_alive && db_healthy { "healthy" } else { "degraded" },
        "gpu": {
            "healthy": gpu_healthy,
            "memory_percent": snapshot.map(|s| s.memory_percent),
            "temperature_c": snapshot.map(|s| s.temperature_c),
            "reason": gpu_reason,
        },
        "database": database,
        "worker": worker,
        "queue": {
            "active_jobs": active_jobs,
            "max_queue_depth": limits.max_queue_depth,
            "queue_available": (limits.max_queue_depth - active_jobs).max(0),
            "total_queued_requests": queued_requests,
            "max_queued_requests": limits.max_total_queued_requests,
            "requests_available": (limits.max_total_queued_requests - queued_requests).max(0),
        },
        "limits": {
            "max_requests_per_job": limits.max_requests_per_job,
            "max_queue_depth": limits.max_queue_depth,
            "max_total_queued_requests": limits.max_total_queued_requests,
        },
    })))
}
