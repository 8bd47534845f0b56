use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::Serialize;
use std::str::FromStr;

use crate::handlers::ErrorResponse;
use crate::state::AppState;
use common::db::repositories::FileRepository;
use common::models::{FilePurpose, FileView};

/// Upload a JSONL request file (multipart: `file`, `purpose`)
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<FileView>, ErrorResponse> {
    let mut filename: Option<String> = None;
    let mut purpose: Option<String> = None;
    let mut content: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ErrorResponse::new("validation_error", format!("Malformed multipart body: {}", e))
    })? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(|e| {
                    ErrorResponse::new("validation_error", format!("Failed to read file: {}", e))
                })?;
                content = Some(bytes.to_vec());
            }
            Some("purpose") => {
                let text = field.text().await.map_err(|e| {
                    ErrorResponse::new("validation_error", format!("Failed to read purpose: {}", e))
                })?;
                purpose = Some(text);
            }
            _ => {}
        }
    }

    let content = content.ok_or_else(|| {
        ErrorResponse::new("validation_error", "Missing required field: file")
    })?;
    let purpose = match purpose.as_deref() {
        None => FilePurpose::Batch,
        Some(raw) => FilePurpose::from_str(raw)
            .map_err(|e| ErrorResponse::new("validation_error", e))?,
    };
    let filename = filename.unwrap_or_else(|| "upload.jsonl".to_string());

    let stored = state.intake.upload_file(&filename, purpose, &content).await?;
    Ok(Json(stored.to_view()))
}

#[derive(Debug, Serialize)]
pub struct DeleteFileResponse {
    pub id: String,
    pub object: String,
    pub deleted: bool,
}

/// Soft-delete a file row; the bytes stay on disk for running jobs
#[tracing::instrument(skip(state))]
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<DeleteFileResponse>, ErrorResponse> {
    let repo = FileRepository::new(state.db_pool.clone());
    repo.mark_deleted(&file_id).await?;

    Ok(Json(DeleteFileResponse {
        id: file_id,
        object: "file".to_string(),
        deleted: true,
    }))
}
