// Intake: JSONL validation, admission gates, and job creation

use crate::config::{GpuConfig, LimitsConfig, StorageConfig};
use crate::db::repositories::{BatchJobRepository, FileRepository};
use crate::db::DbPool;
use crate::errors::{AdmissionError, ValidationError};
use crate::gpu::{admission_rejection, HealthProbe};
use crate::models::{
    self, BatchJob, BatchRequestLine, BatchStatus, FilePurpose, StoredFile,
};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;

/// The only endpoint this control plane executes
pub const SUPPORTED_ENDPOINT: &str = "/v1/chat/completions";

/// Parse a completion window such as "24h" into seconds
pub fn parse_completion_window(window: &str) -> Result<i64, ValidationError> {
    let digits = window.strip_suffix('h').ok_or_else(|| {
        ValidationError::InvalidFieldValue {
            field: "completion_window".to_string(),
            reason: format!("'{}' is not of the form '<hours>h'", window),
        }
    })?;

    let hours: i64 = digits
        .parse()
        .map_err(|_| ValidationError::InvalidFieldValue {
            field: "completion_window".to_string(),
            reason: format!("'{}' is not of the form '<hours>h'", window),
        })?;

    if hours <= 0 {
        return Err(ValidationError::InvalidFieldValue {
            field: "completion_window".to_string(),
            reason: "window must be at least one hour".to_string(),
        });
    }

    Ok(hours * 3600)
}

/// Validate an uploaded JSONL body and return its requests in file order.
///
/// Every non-blank line must parse, carry a unique `custom_id`, use
/// `POST /v1/chat/completions`, and have a non-empty `body.messages`.
/// Errors cite 1-based line numbers.
pub fn validate_jsonl(
    content: &str,
    max_requests: usize,
) -> Result<Vec<BatchRequestLine>, AdmissionError> {
    let mut requests = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let request: BatchRequestLine =
            serde_json::from_str(raw).map_err(|e| AdmissionError::InvalidLine {
                line,
                reason: e.to_string(),
            })?;

        if request.custom_id.is_empty() {
            return Err(AdmissionError::InvalidLine {
                line,
                reason: "custom_id must be a non-empty string".to_string(),
            });
        }
        if request.method != "POST" {
            return Err(AdmissionError::InvalidLine {
                line,
                reason: format!("method must be \"POST\", got \"{}\"", request.method),
            });
        }
        if request.url != SUPPORTED_ENDPOINT {
            return Err(AdmissionError::InvalidLine {
                line,
                reason: format!("url must be \"{}\", got \"{}\"", SUPPORTED_ENDPOINT, request.url),
            });
        }
        if request.body.messages.is_empty() {
            return Err(AdmissionError::InvalidLine {
                line,
                reason: "body.messages must be a non-empty array".to_string(),
            });
        }
        if !seen_ids.insert(request.custom_id.clone()) {
            return Err(AdmissionError::DuplicateCustomId {
                custom_id: request.custom_id,
                line,
            });
        }

        requests.push(request);
    }

    if requests.is_empty() {
        return Err(AdmissionError::EmptyFile);
    }
    if requests.len() > max_requests {
        return Err(AdmissionError::TooManyRequests {
            count: requests.len(),
            max: max_requests,
        });
    }

    Ok(requests)
}

/// Parameters for creating a batch job
#[derive(Debug, Clone)]
pub struct CreateBatchParams {
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

/// Intake service: validates uploads and admits new jobs
pub struct IntakeService {
    files: FileRepository,
    jobs: BatchJobRepository,
    probe: Arc<dyn HealthProbe>,
    limits: LimitsConfig,
    gpu: GpuConfig,
    input_dir: PathBuf,
}

impl IntakeService {
    pub fn new(
        pool: DbPool,
        probe: Arc<dyn HealthProbe>,
        limits: LimitsConfig,
        gpu: GpuConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            files: FileRepository::new(pool.clone()),
            jobs: BatchJobRepository::new(pool),
            probe,
            limits,
            gpu,
            input_dir: storage.input_dir(),
        }
    }

    /// Accept an uploaded request file: validate the JSONL, persist the bytes
    /// to a content-addressed path with fsync, then register the File row.
    /// Nothing is visible on failure; a rejected upload leaves no file behind.
    #[instrument(skip(self, content), fields(filename = %filename, bytes = content.len()))]
    pub async fn upload_file(
        &self,
        filename: &str,
        purpose: FilePurpose,
        content: &[u8],
    ) -> Result<StoredFile, AdmissionError> {
        if purpose != FilePurpose::Batch {
            return Err(AdmissionError::InvalidField {
                field: "purpose".to_string(),
                reason: "only 'batch' uploads are accepted".to_string(),
            });
        }

        let text = std::str::from_utf8(content).map_err(|_| AdmissionError::InvalidLine {
            line: 1,
            reason: "file is not valid UTF-8".to_string(),
        })?;
        let requests = validate_jsonl(text, self.limits.max_requests_per_job)?;

        let digest = hex::encode(Sha256::digest(content));
        let path = self.input_dir.join(format!("{}.jsonl", digest));

        tokio::fs::create_dir_all(&self.input_dir).await?;
        let already_stored = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !already_stored {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
        }

        let stored = StoredFile {
            file_id: models::new_file_id(),
            filename: filename.to_string(),
            bytes: content.len() as i64,
            purpose,
            created_at: models::unix_now(),
            path: path.to_string_lossy().into_owned(),
            deleted: false,
        };

        if let Err(e) = self.files.create(&stored).await {
            // Roll the bytes back unless another upload shares them
            if !already_stored {
                let _ = tokio::fs::remove_file(&path).await;
            }
            return Err(e.into());
        }

        tracing::info!(
            file_id = %stored.file_id,
            requests = requests.len(),
            "Request file accepted"
        );
        Ok(stored)
    }

    /// Admit a new batch job. Gate order: queue depth, queued-request budget,
    /// GPU health, then input revalidation.
    #[instrument(skip(self, params), fields(input_file_id = %params.input_file_id, model = %params.model))]
    pub async fn create_batch(&self, params: CreateBatchParams) -> Result<BatchJob, AdmissionError> {
        let active = self.jobs.count_active().await?;
        if active >= self.limits.max_queue_depth {
            return Err(AdmissionError::QueueFull {
                active,
                max: self.limits.max_queue_depth,
            });
        }

        let queued = self.jobs.sum_queued_requests().await?;
        if queued >= self.limits.max_total_queued_requests {
            return Err(AdmissionError::TooManyQueuedRequests {
                queued,
                max: self.limits.max_total_queued_requests,
            });
        }

        let snapshot = self.probe.read().await;
        if let Some(reason) = admission_rejection(snapshot.as_ref(), &self.gpu) {
            return Err(AdmissionError::GpuUnhealthy(reason));
        }

        if let Some(endpoint) = params.endpoint.as_deref() {
            if endpoint != SUPPORTED_ENDPOINT {
                return Err(AdmissionError::InvalidField {
                    field: "endpoint".to_string(),
                    reason: format!("only {} is supported", SUPPORTED_ENDPOINT),
                });
            }
        }
        if params.model.is_empty() {
            return Err(AdmissionError::InvalidField {
                field: "model".to_string(),
                reason: "model must be a non-empty string".to_string(),
            });
        }

        let priority = params.priority.unwrap_or(0);
        if !(-1..=1).contains(&priority) {
            return Err(AdmissionError::InvalidField {
                field: "priority".to_string(),
                reason: "priority must be -1, 0, or 1".to_string(),
            });
        }

        if let Some(events) = params.webhook_events.as_deref() {
            for event in events.split(',') {
                if !matches!(event.trim(), "completed" | "failed") {
                    return Err(AdmissionError::InvalidField {
                        field: "webhook_events".to_string(),
                        reason: format!("unknown event '{}'", event.trim()),
                    });
                }
            }
        }

        let window = params
            .completion_window
            .clone()
            .unwrap_or_else(|| self.limits.completion_window_default.clone());
        let window_seconds =
            parse_completion_window(&window).map_err(|e| AdmissionError::InvalidField {
                field: "completion_window".to_string(),
                reason: e.to_string(),
            })?;

        let input_file = self
            .files
            .get(&params.input_file_id)
            .await?
            .ok_or_else(|| AdmissionError::InputFileNotFound(params.input_file_id.clone()))?;

        let content = tokio::fs::read_to_string(&input_file.path).await?;
        let requests = validate_jsonl(&content, self.limits.max_requests_per_job)?;

        let metadata_json = params
            .metadata
            .as_ref()
            .map(|value| value.to_string());

        let created_at = models::unix_now();
        let job = BatchJob {
            batch_id: models::new_batch_id(),
            endpoint: SUPPORTED_ENDPOINT.to_string(),
            input_file_id: input_file.file_id.clone(),
            output_file_id: None,
            completion_window: window,
            status: BatchStatus::Validating,
            created_at,
            in_progress_at: None,
            expires_at: created_at + window_seconds,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            total_requests: requests.len() as i32,
            completed_requests: 0,
            failed_requests: 0,
            errors_json: None,
            metadata_json,
            model: params.model,
            priority,
            tokens_processed: 0,
            total_tokens: None,
            throughput_tokens_per_sec: None,
            last_progress_update: None,
            estimated_completion_time: None,
            webhook_url: params.webhook_url,
            webhook_secret: params.webhook_secret,
            webhook_events: params.webhook_events,
            webhook_max_retries: params.webhook_max_retries,
            webhook_timeout: params.webhook_timeout,
            webhook_status: None,
            webhook_attempts: 0,
            webhook_last_attempt: None,
            webhook_error: None,
        };

        self.jobs.create(&job).await?;

        tracing::info!(
            batch_id = %job.batch_id,
            total_requests = job.total_requests,
            priority = job.priority,
            "Batch job admitted"
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(custom_id: &str) -> String {
        format!(
            r#"{{"custom_id":"{}","method":"POST","url":"/v1/chat/completions","body":{{"messages":[{{"role":"user","content":"hi"}}]}}}}"#,
            custom_id
        )
    }

    #[test]
    fn test_valid_file_preserves_order() {
        let content = format!("{}\n{}\n{}\n", line("r1"), line("r2"), line("r3"));
        let requests = validate_jsonl(&content, 50_000).unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let content = format!("{}\n\n   \n{}\n", line("r1"), line("r2"));
        assert_eq!(validate_jsonl(&content, 50_000).unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_line_cites_line_number() {
        let content = format!("{}\nnot json\n", line("r1"));
        match validate_jsonl(&content, 50_000) {
            Err(AdmissionError::InvalidLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected InvalidLine, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_duplicate_custom_id_rejected() {
        let content = format!("{}\n{}\n", line("r1"), line("r1"));
        match validate_jsonl(&content, 50_000) {
            Err(AdmissionError::DuplicateCustomId { custom_id, line }) => {
                assert_eq!(custom_id, "r1");
                assert_eq!(line, 2);
            }
            other => panic!("expected DuplicateCustomId, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_wrong_method_rejected() {
        let content = r#"{"custom_id":"r1","method":"GET","url":"/v1/chat/completions","body":{"messages":[{"role":"user","content":"hi"}]}}"#;
        assert!(matches!(
            validate_jsonl(content, 50_000),
            Err(AdmissionError::InvalidLine { line: 1, .. })
        ));
    }

    #[test]
    fn test_wrong_url_rejected() {
        let content = r#"{"custom_id":"r1","method":"POST","url":"/v1/embeddings","body":{"messages":[{"role":"user","content":"hi"}]}}"#;
        assert!(matches!(
            validate_jsonl(content, 50_000),
            Err(AdmissionError::InvalidLine { line: 1, .. })
        ));
    }

    #[test]
    fn test_empty_messages_rejected() {
        let content = r#"{"custom_id":"r1","method":"POST","url":"/v1/chat/completions","body":{"messages":[]}}"#;
        assert!(matches!(
            validate_jsonl(content, 50_000),
            Err(AdmissionError::InvalidLine { line: 1, .. })
        ));
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(
            validate_jsonl("\n\n", 50_000),
            Err(AdmissionError::EmptyFile)
        ));
    }

    #[test]
    fn test_request_count_boundary() {
        let at_limit = format!("{}\n{}\n", line("r1"), line("r2"));
        assert!(validate_jsonl(&at_limit, 2).is_ok());

        let over_limit = format!("{}\n{}\n{}\n", line("r1"), line("r2"), line("r3"));
        assert!(matches!(
            validate_jsonl(&over_limit, 2),
            Err(AdmissionError::TooManyRequests { count: 3, max: 2 })
        ));
    }

    #[test]
    fn test_completion_window_parsing() {
        assert_eq!(parse_completion_window("24h").unwrap(), 86_400);
        assert_eq!(parse_completion_window("1h").unwrap(), 3_600);
        assert!(parse_completion_window("24").is_err());
        assert!(parse_completion_window("0h").is_err());
        assert!(parse_completion_window("-2h").is_err());
        assert!(parse_completion_window("soon").is_err());
    }
}
