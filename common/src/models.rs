use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Batch Job Models
// ============================================================================

/// BatchJob is the central entity, OpenAI Batch API compatible
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BatchJob {
    pub batch_id: String,
    pub endpoint: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub completion_window: String,
    #[sqlx(try_from = "String")]
    pub status: BatchStatus,

    // OpenAI timestamps (unix seconds)
    pub created_at: i64,
    pub in_progress_at: Option<i64>,
    pub expires_at: i64,
    pub finalizing_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub expired_at: Option<i64>,
    pub cancelling_at: Option<i64>,
    pub cancelled_at: Option<i64>,

    pub total_requests: i32,
    pub completed_requests: i32,
    pub failed_requests: i32,

    pub errors_json: Option<String>,
    pub metadata_json: Option<String>,

    pub model: String,
    /// -1 = low, 0 = normal, 1 = high
    pub priority: i32,

    // Progress tracking
    pub tokens_processed: i64,
    pub total_tokens: Option<i64>,
    pub throughput_tokens_per_sec: Option<f64>,
    pub last_progress_update: Option<DateTime<Utc>>,
    pub estimated_completion_time: Option<DateTime<Utc>>,

    // Webhook configuration and delivery state
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_events: Option<String>,
    pub webhook_max_retries: Option<i32>,
    pub webhook_timeout: Option<i32>,
    pub webhook_status: Option<String>,
    pub webhook_attempts: i32,
    pub webhook_last_attempt: Option<DateTime<Utc>>,
    pub webhook_error: Option<String>,
}

impl BatchJob {
    /// Convert to the OpenAI Batch API response shape
    pub fn to_view(&self) -> BatchView {
        let metadata = self
            .metadata_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let errors = self
            .errors_json
            .as_deref()
            .map(|raw| {
                serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::json!({ "message": raw }))
            });

        BatchView {
            id: self.batch_id.clone(),
            object: "batch".to_string(),
            endpoint: self.endpoint.clone(),
            errors,
            input_file_id: self.input_file_id.clone(),
            completion_window: self.completion_window.clone(),
            status: self.status,
            output_file_id: self.output_file_id.clone(),
            created_at: self.created_at,
            in_progress_at: self.in_progress_at,
            expires_at: self.expires_at,
            finalizing_at: self.finalizing_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            expired_at: self.expired_at,
            cancelling_at: self.cancelling_at,
            cancelled_at: self.cancelled_at,
            request_counts: RequestCounts {
                total: self.total_requests,
                completed: self.completed_requests,
                failed: self.failed_requests,
            },
            model: self.model.clone(),
            metadata,
        }
    }
}

/// BatchStatus follows the OpenAI Batch lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl BatchStatus {
    /// Whether the job can move from `self` to `to`
    pub fn can_transition_to(self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Validating, InProgress)
                | (Validating, Cancelled)
                | (Validating, Expired)
                | (Validating, Failed)
                | (InProgress, Finalizing)
                | (InProgress, Failed)
                | (InProgress, Cancelling)
                | (Finalizing, Completed)
                | (Finalizing, Failed)
                | (Cancelling, Cancelled)
        )
    }

    /// Terminal states are never mutated again, except webhook delivery state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Expired
                | BatchStatus::Cancelled
        )
    }

    /// States counted against queue-depth admission
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BatchStatus::Validating | BatchStatus::InProgress | BatchStatus::Finalizing
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Validating => write!(f, "validating"),
            BatchStatus::InProgress => write!(f, "in_progress"),
            BatchStatus::Finalizing => write!(f, "finalizing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Expired => write!(f, "expired"),
            BatchStatus::Cancelling => write!(f, "cancelling"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validating" => Ok(BatchStatus::Validating),
            "in_progress" => Ok(BatchStatus::InProgress),
            "finalizing" => Ok(BatchStatus::Finalizing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "expired" => Ok(BatchStatus::Expired),
            "cancelling" => Ok(BatchStatus::Cancelling),
            "cancelled" => Ok(BatchStatus::Cancelled),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

impl TryFrom<String> for BatchStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Request counts in the OpenAI response shape
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
}

/// OpenAI Batch API response shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchView {
    pub id: String,
    pub object: String,
    pub endpoint: String,
    pub errors: Option<serde_json::Value>,
    pub input_file_id: String,
    pub completion_window: String,
    pub status: BatchStatus,
    pub output_file_id: Option<String>,
    pub created_at: i64,
    pub in_progress_at: Option<i64>,
    pub expires_at: i64,
    pub finalizing_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub expired_at: Option<i64>,
    pub cancelling_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub request_counts: RequestCounts,
    pub model: String,
    pub metadata: serde_json::Value,
}

// ============================================================================
// File Models
// ============================================================================

/// Uploaded or produced JSONL artifact, OpenAI Files API compatible
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredFile {
    pub file_id: String,
    pub filename: String,
    pub bytes: i64,
    #[sqlx(try_from = "String")]
    pub purpose: FilePurpose,
    pub created_at: i64,
    pub path: String,
    pub deleted: bool,
}

impl StoredFile {
    pub fn to_view(&self) -> FileView {
        FileView {
            id: self.file_id.clone(),
            object: "file".to_string(),
            bytes: self.bytes,
            created_at: self.created_at,
            filename: self.filename.clone(),
            purpose: self.purpose,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilePurpose {
    Batch,
    BatchOutput,
}

impl std::fmt::Display for FilePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilePurpose::Batch => write!(f, "batch"),
            FilePurpose::BatchOutput => write!(f, "batch_output"),
        }
    }
}

impl FromStr for FilePurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(FilePurpose::Batch),
            "batch_output" => Ok(FilePurpose::BatchOutput),
            _ => Err(format!("Invalid file purpose: {}", s)),
        }
    }
}

impl TryFrom<String> for FilePurpose {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// OpenAI Files API response shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileView {
    pub id: String,
    pub object: String,
    pub bytes: i64,
    pub created_at: i64,
    pub filename: String,
    pub purpose: FilePurpose,
}

// ============================================================================
// Worker Heartbeat
// ============================================================================

/// Readers must treat the row as stale past this age
pub const HEARTBEAT_STALE_AFTER_SECS: i64 = 60;

/// Singleton row (id = 1) updated by the worker each loop iteration
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerHeartbeat {
    pub id: i32,
    #[sqlx(try_from = "String")]
    pub status: WorkerStatus,
    pub current_job_id: Option<String>,
    pub loaded_model: Option<String>,
    pub model_loaded_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<i32>,
    pub worker_started_at: Option<DateTime<Utc>>,
    pub gpu_memory_percent: Option<f64>,
    pub gpu_temperature: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

impl WorkerHeartbeat {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen).num_seconds() > HEARTBEAT_STALE_AFTER_SECS
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Processing,
    Testing,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Processing => write!(f, "processing"),
            WorkerStatus::Testing => write!(f, "testing"),
            WorkerStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "processing" => Ok(WorkerStatus::Processing),
            "testing" => Ok(WorkerStatus::Testing),
            "error" => Ok(WorkerStatus::Error),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

impl TryFrom<String> for WorkerStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::from_str(&s)
    }
}

// ============================================================================
// Webhook Dead Letter
// ============================================================================

/// Permanently failed webhook delivery, retryable via the admin API
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookDeadLetter {
    pub id: i64,
    pub batch_id: String,
    pub webhook_url: String,
    /// Full payload JSON as delivered, preserved for manual retry
    pub payload: String,
    pub error_message: String,
    pub attempts: i32,
    pub last_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_success: Option<bool>,
}

/// Per-request failure record. The chunk path fails whole jobs, so this is
/// only written by future per-item granularity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedRequest {
    pub id: i64,
    pub batch_id: String,
    pub custom_id: String,
    pub request_index: i32,
    pub error_message: String,
    pub error_type: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// JSONL wire formats
// ============================================================================

/// One chat message in a request body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body of a single batch request; extra sampling fields pass through opaque
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One line of an uploaded request file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: RequestBody,
}

/// One line of a result file, in input order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultLine {
    pub id: String,
    pub custom_id: String,
    pub response: ResultResponse,
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub status_code: u16,
    pub request_id: String,
    pub body: ChatCompletionBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionBody {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ============================================================================
// Identifier generation
// ============================================================================

fn uuid_hex(len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..len].to_string()
}

pub fn new_batch_id() -> String {
    format!("batch_{}", uuid_hex(16))
}

pub fn new_file_id() -> String {
    format!("file-{}", uuid_hex(20))
}

pub fn new_output_file_id() -> String {
    format!("file-out-{}", uuid_hex(20))
}

pub fn new_result_id() -> String {
    format!("batch_req_{}", uuid_hex(24))
}

pub fn new_request_id() -> String {
    format!("req-{}", uuid_hex(12))
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid_hex(12))
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
