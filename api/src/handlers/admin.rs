use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::handlers::ErrorResponse;
use crate::state::AppState;
use common::db::repositories::DeadLetterRepository;
use common::models::WebhookDeadLetter;

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersQuery {
    pub batch_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub dead_letters: Vec<WebhookDeadLetter>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct RetryDeadLetterResponse {
    pub id: i64,
    pub success: bool,
}

/// List permanently failed webhook deliveries
#[tracing::instrument(skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListDeadLettersQuery>,
) -> Result<Json<DeadLetterListResponse>, ErrorResponse> {
    let repo = DeadLetterRepository::new(state.db_pool.clone());
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let dead_letters = repo.list(query.batch_id.as_deref(), limit).await?;

    let count = dead_letters.len();
    Ok(Json(DeadLetterListResponse { dead_letters, count }))
}

/// Re-send a dead-lettered payload once and record the outcome
#[tracing::instrument(skip(state))]
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RetryDeadLetterResponse>, ErrorResponse> {
    let success = state.dispatcher.retry_dead_letter(id).await.map_err(|e| {
        match e {
            common::errors::WebhookError::Store(store) => ErrorResponse::from(store),
            other => ErrorResponse::new("internal_error", other.to_string()),
        }
    })?;

    Ok(Json(RetryDeadLetterResponse { id, success }))
}
