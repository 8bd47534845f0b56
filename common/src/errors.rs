// Error handling framework

use thiserror::Error;

/// Admission errors raised at intake, before any job row exists
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Queue full ({active}/{max} jobs). Try again later.")]
    QueueFull { active: i64, max: i64 },

    #[error("Too many queued requests ({queued}/{max}). Try again later.")]
    TooManyQueuedRequests { queued: i64, max: i64 },

    #[error("GPU unhealthy: {0}. Try again later.")]
    GpuUnhealthy(String),

    #[error("Invalid JSON on line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("Duplicate custom_id '{custom_id}' on line {line}")]
    DuplicateCustomId { custom_id: String, line: usize },

    #[error("No valid requests found in file")]
    EmptyFile,

    #[error("Too many requests ({count}). Maximum is {max} per job.")]
    TooManyRequests { count: usize, max: usize },

    #[error("Input file not found: {0}")]
    InputFileNotFound(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runner errors raised while executing a batch job
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Model load failed for '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input file not found: {0}")]
    InputFileNotFound(String),

    #[error("Malformed request on line {line}: {reason}")]
    MalformedRequest { line: usize, reason: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Invalid status transition for {batch_id}: {detail}")]
    InvalidTransition { batch_id: String, detail: String },
}

/// Webhook delivery errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Timeout after {0}s")]
    Timeout(u64),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Validation errors for wire-level inputs
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => StoreError::DuplicateKey(db_err.message().to_string()),
                        _ => StoreError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    StoreError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_error_cites_line_number() {
        let err = AdmissionError::InvalidLine {
            line: 42,
            reason: "expected value".to_string(),
        };
        assert!(err.to_string().contains("line 42"));
    }

    #[test]
    fn test_queue_full_display() {
        let err = AdmissionError::QueueFull { active: 20, max: 20 };
        assert!(err.to_string().contains("Queue full"));
        assert!(err.to_string().contains("20/20"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = StoreError::InvalidTransition {
            batch_id: "batch_abc".to_string(),
            detail: "completed -> in_progress".to_string(),
        };
        assert!(err.to_string().contains("batch_abc"));
    }

    #[test]
    fn test_model_load_error_names_model() {
        let err = RunnerError::ModelLoad {
            model: "llama-3".to_string(),
            reason: "out of memory".to_string(),
        };
        assert!(err.to_string().contains("llama-3"));
        assert!(err.to_string().contains("out of memory"));
    }
}
