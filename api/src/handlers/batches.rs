use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio_util::io::ReaderStream;

use crate::handlers::ErrorResponse;
use crate::state::AppState;
use common::db::repositories::{BatchJobRepository, FileRepository};
use common::intake::CreateBatchParams;
use common::models::{BatchStatus, BatchView};

/// Request to create a new batch job
#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
    pub model: String,
    pub endpoint: Option<String>,
    pub completion_window: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_events: Option<String>,
    pub webhook_max_retries: Option<i32>,
    pub webhook_timeout: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListBatchesQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BatchListResponse {
    pub batches: Vec<BatchView>,
    pub count: usize,
}

/// Submit a new batch job against an uploaded input file
#[tracing::instrument(skip(state, req), fields(input_file_id = %req.input_file_id, model = %req.model))]
pub async fn create_batch(
    State(state): State<AppState>,
    Json(req): Json<CreateBatchRequest>,
) -> Result<Json<BatchView>, ErrorResponse> {
    let job = state
        .intake
        .create_batch(CreateBatchParams {
            input_file_id: req.input_file_id,
            model: req.model,
            endpoint: req.endpoint,
            completion_window: req.completion_window,
            metadata: req.metadata,
            priority: req.priority,
            webhook_url: req.webhook_url,
            webhook_secret: req.webhook_secret,
            webhook_events: req.webhook_events,
            webhook_max_retries: req.webhook_max_retries,
            webhook_timeout: req.webhook_timeout,
        })
        .await?;

    Ok(Json(job.to_view()))
}

/// Get batch job status and progress
#[tracing::instrument(skip(state))]
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchView>, ErrorResponse> {
    let repo = BatchJobRepository::new(state.db_pool.clone());
    let job = repo
        .get(&batch_id)
        .await?
        .ok_or_else(|| not_found(&batch_id))?;

    Ok(Json(job.to_view()))
}

/// List batch jobs, optionally filtered by status
#[tracing::instrument(skip(state))]
pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<ListBatchesQuery>,
) -> Result<Json<BatchListResponse>, ErrorResponse> {
    let status = query
        .status
        .as_deref()
        .map(BatchStatus::from_str)
        .transpose()
        .map_err(|e| ErrorResponse::new("validation_error", e))?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);

    let repo = BatchJobRepository::new(state.db_pool.clone());
    let batches: Vec<BatchView> = repo
        .list(status, limit)
        .await?
        .iter()
        .map(|job| job.to_view())
        .collect();

    let count = batches.len();
    Ok(Json(BatchListResponse { batches, count }))
}

/// Cancel a batch job. Pending jobs cancel immediately; a running job moves
/// to `cancelling` and the worker finishes the cancellation at the next
/// chunk boundary. Terminal jobs return 400.
#[tracing::instrument(skip(state))]
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchView>, ErrorResponse> {
    let repo = BatchJobRepository::new(state.db_pool.clone());
    let job = repo.cancel(&batch_id).await?;

    tracing::info!(batch_id = %batch_id, status = %job.status, "Cancellation requested");
    Ok(Json(job.to_view()))
}

/// Stream the results file of a completed job as NDJSON
#[tracing::instrument(skip(state))]
pub async fn get_results(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Response, ErrorResponse> {
    let jobs = BatchJobRepository::new(state.db_pool.clone());
    let job = jobs
        .get(&batch_id)
        .await?
        .ok_or_else(|| not_found(&batch_id))?;

    if job.status != BatchStatus::Completed {
        return Err(ErrorResponse::new(
            "invalid_state",
            format!(
                "Batch job is not completed yet. Current status: {}",
                job.status
            ),
        ));
    }

    let output_file_id = job.output_file_id.ok_or_else(|| {
        ErrorResponse::new("not_found", "Results file not registered")
    })?;
    let files = FileRepository::new(state.db_pool.clone());
    let output_file = files
        .get(&output_file_id)
        .await?
        .ok_or_else(|| ErrorResponse::new("not_found", "Results file not found"))?;

    let file = tokio::fs::File::open(&output_file.path).await.map_err(|e| {
        tracing::error!(batch_id = %batch_id, path = %output_file.path, error = %e, "Results file missing on disk");
        ErrorResponse::new("not_found", "Results file not found")
    })?;

    let body = Body::from_stream(ReaderStream::new(file));
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}_results.jsonl\"", batch_id),
        )
        .body(body)
        .map_err(|e| ErrorResponse::new("internal_error", e.to_string()))?;

    Ok(response)
}

fn not_found(batch_id: &str) -> ErrorResponse {
    ErrorResponse::new("not_found", format!("Batch job '{}' not found", batch_id))
}
