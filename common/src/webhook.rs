// Webhook delivery pipeline: HMAC-signed notifications with bounded
// exponential-backoff retry and a dead-letter queue on exhaustion.

use crate::config::WebhookConfig;
use crate::db::repositories::dead_letter::NewDeadLetter;
use crate::db::repositories::{BatchJobRepository, DeadLetterRepository};
use crate::db::DbPool;
use crate::errors::WebhookError;
use crate::models::{BatchJob, BatchStatus};
use crate::telemetry;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// HTTP statuses that count as a delivered webhook
const SUCCESS_STATUSES: [u16; 4] = [200, 201, 202, 204];

/// Replay window for receivers verifying the timestamp header
pub const MAX_TIMESTAMP_AGE_SECS: i64 = 300;
/// Tolerated clock skew in either direction
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Generate a secret suitable for HMAC-SHA256 signing (32 random bytes, hex)
pub fn generate_webhook_secret() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; 32] = rng.gen();
    hex::encode(random_bytes)
}

/// Serialize with recursively sorted object keys so signer and verifier
/// agree on the exact bytes
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted: Vec<_> = map.iter().collect();
                sorted.sort_by_key(|(k, _)| k.as_str());
                serde_json::Value::Object(
                    sorted
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sort(v)))
                        .collect(),
                )
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Hex-encoded HMAC-SHA256 over the payload bytes
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Header value carrying the signature
pub fn signature_header_value(signature: &str) -> String {
    format!("sha256={}", signature)
}

/// Verify a received webhook: constant-time signature check over the body
/// bytes, plus the replay window when a timestamp header is present.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: &str,
    timestamp_header: Option<&str>,
    secret: &str,
    now: i64,
) -> bool {
    let Some(received_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(received) = hex::decode(received_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    if mac.verify_slice(&received).is_err() {
        return false;
    }

    if let Some(raw) = timestamp_header {
        let Ok(timestamp) = raw.parse::<i64>() else {
            return false;
        };
        let age = now - timestamp;
        if age > MAX_TIMESTAMP_AGE_SECS || age < -MAX_CLOCK_SKEW_SECS {
            return false;
        }
    }

    true
}

/// Backoff before the next attempt: 1s, 2s, 4s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1).min(16))
}

/// Whether the job's event filter allows a notification for this status.
/// An unset filter delivers both `completed` and `failed`.
pub fn event_enabled(events: Option<&str>, status: BatchStatus) -> bool {
    let event = match status {
        BatchStatus::Completed => "completed",
        BatchStatus::Failed => "failed",
        _ => return false,
    };
    match events {
        None => true,
        Some(list) => list.split(',').any(|e| e.trim() == event),
    }
}

/// Build the notification payload from the job's current state
pub fn build_payload(job: &BatchJob) -> serde_json::Value {
    let metadata = job
        .metadata_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| serde_json::json!({}));

    serde_json::json!({
        "id": job.batch_id,
        "object": "batch",
        "endpoint": job.endpoint,
        "status": job.status.to_string(),
        "created_at": job.created_at,
        "completed_at": job.completed_at,
        "request_counts": {
            "total": job.total_requests,
            "completed": job.completed_requests,
            "failed": job.failed_requests,
        },
        "metadata": metadata,
        "output_file_url": if job.status == BatchStatus::Completed {
            Some(format!("/v1/batches/{}/results", job.batch_id))
        } else {
            None
        },
        "error_file_url": if job.failed_requests > 0 {
            Some(format!("/v1/batches/{}/errors", job.batch_id))
        } else {
            None
        },
    })
}

/// A single delivery attempt; Ok on any 2xx success status
pub async fn deliver_once(
    client: &reqwest::Client,
    url: &str,
    body: &str,
    signature: Option<&str>,
    timestamp: Option<i64>,
    timeout: Duration,
) -> Result<(), WebhookError> {
    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .timeout(timeout)
        .body(body.to_string());

    if let Some(signature) = signature {
        request = request.header(SIGNATURE_HEADER, signature_header_value(signature));
    }
    if let Some(timestamp) = timestamp {
        request = request.header(TIMESTAMP_HEADER, timestamp.to_string());
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            WebhookError::Timeout(timeout.as_secs())
        } else {
            WebhookError::Request(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    if SUCCESS_STATUSES.contains(&status) {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(WebhookError::HttpStatus {
        status,
        body: body.chars().take(200).collect(),
    })
}

/// Dispatches completion/failure notifications for terminal jobs.
///
/// Attempts for a single job are serialized; dispatchers for different jobs
/// run as independent tasks and only touch their own job's webhook fields
/// plus the dead-letter table.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    pool: DbPool,
    defaults: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(pool: DbPool, defaults: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            pool,
            defaults,
        }
    }

    /// Fire-and-forget delivery for a terminal job
    pub fn spawn(&self, batch_id: String) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(&batch_id).await {
                warn!(batch_id = %batch_id, error = %e, "Webhook dispatch error");
            }
        });
    }

    /// Deliver the notification for a job, retrying with exponential
    /// backoff. On exhaustion the payload moves to the dead-letter table;
    /// delivery failures are never raised to callers.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, batch_id: &str) -> Result<(), WebhookError> {
        let jobs = BatchJobRepository::new(self.pool.clone());

        let Some(job) = jobs.get(batch_id).await? else {
            warn!(batch_id = %batch_id, "Webhook dispatch for unknown job");
            return Ok(());
        };
        let Some(url) = job.webhook_url.clone() else {
            return Ok(());
        };
        if !event_enabled(job.webhook_events.as_deref(), job.status) {
            info!(batch_id = %batch_id, status = %job.status, "Webhook event filtered out");
            return Ok(());
        }

        let max_retries = job
            .webhook_max_retries
            .map(|n| n as u32)
            .unwrap_or(self.defaults.max_retries)
            .max(1);
        let timeout = Duration::from_secs(
            job.webhook_timeout
                .map(|n| n as u64)
                .unwrap_or(self.defaults.timeout_seconds),
        );
        let secret = job
            .webhook_secret
            .clone()
            .or_else(|| self.defaults.secret.clone());

        let payload = build_payload(&job);
        let body = canonical_json(&payload);
        let signature = secret.as_deref().map(|s| sign_payload(body.as_bytes(), s));
        let timestamp = signature.as_ref().map(|_| Utc::now().timestamp());

        let mut last_error = String::from("Unknown error");
        for attempt in 1..=max_retries {
            match deliver_once(
                &self.client,
                &url,
                &body,
                signature.as_deref(),
                timestamp,
                timeout,
            )
            .await
            {
                Ok(()) => {
                    jobs.mark_webhook_sent(batch_id, attempt as i32).await?;
                    telemetry::record_webhook_delivered(batch_id);
                    info!(batch_id = %batch_id, attempt = attempt, "Webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    jobs.record_webhook_attempt(batch_id, attempt as i32, Some(&last_error))
                        .await?;
                    warn!(
                        batch_id = %batch_id,
                        attempt = attempt,
                        max_retries = max_retries,
                        error = %last_error,
                        "Webhook attempt failed"
                    );
                    if attempt < max_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        jobs.mark_webhook_failed(batch_id, max_retries as i32, &last_error)
            .await?;

        let dead_letters = DeadLetterRepository::new(self.pool.clone());
        dead_letters
            .enqueue(&NewDeadLetter {
                batch_id: batch_id.to_string(),
                webhook_url: url,
                payload: body,
                error_message: last_error,
                attempts: max_retries as i32,
                last_attempt_at: Utc::now(),
            })
            .await?;
        telemetry::record_webhook_dead_lettered(batch_id);

        Ok(())
    }

    /// Administrative retry of a dead-lettered delivery: one attempt with
    /// the stored payload, outcome recorded on the entry.
    #[instrument(skip(self))]
    pub async fn retry_dead_letter(&self, id: i64) -> Result<bool, WebhookError> {
        let dead_letters = DeadLetterRepository::new(self.pool.clone());
        let entry = dead_letters
            .get(id)
            .await?
            .ok_or_else(|| WebhookError::Store(crate::errors::StoreError::NotFound(format!(
                "dead letter {}",
                id
            ))))?;

        let jobs = BatchJobRepository::new(self.pool.clone());
        let secret = match jobs.get(&entry.batch_id).await? {
            Some(job) => job.webhook_secret.or_else(|| self.defaults.secret.clone()),
            None => self.defaults.secret.clone(),
        };

        let signature = secret
            .as_deref()
            .map(|s| sign_payload(entry.payload.as_bytes(), s));
        let timestamp = signature.as_ref().map(|_| Utc::now().timestamp());

        let outcome = deliver_once(
            &self.client,
            &entry.webhook_url,
            &entry.payload,
            signature.as_deref(),
            timestamp,
            Duration::from_secs(self.defaults.timeout_seconds),
        )
        .await;

        let success = outcome.is_ok();
        dead_letters.mark_retry(id, success).await?;

        info!(dead_letter_id = id, success = success, "Dead letter retry finished");
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_generation() {
        let a = generate_webhook_secret();
        let b = generate_webhook_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(hex::decode(&a).is_ok());
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = serde_json::json!({
            "zebra": 1,
            "alpha": { "y": true, "x": [ { "b": 2, "a": 1 } ] },
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"x":[{"a":1,"b":2}],"y":true},"zebra":1}"#
        );
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let body = canonical_json(&serde_json::json!({ "id": "batch_x", "status": "completed" }));
        let signature = sign_payload(body.as_bytes(), "secret-1");
        let header = signature_header_value(&signature);
        let now = 1_700_000_000;

        assert!(verify_webhook_signature(
            body.as_bytes(),
            &header,
            Some(&now.to_string()),
            "secret-1",
            now
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let body = b"payload";
        let header = signature_header_value(&sign_payload(body, "secret-1"));
        assert!(!verify_webhook_signature(body, &header, None, "secret-2", 0));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let header = signature_header_value(&sign_payload(b"payload", "secret-1"));
        assert!(!verify_webhook_signature(b"payload!", &header, None, "secret-1", 0));
    }

    #[test]
    fn test_verify_rejects_missing_prefix() {
        let signature = sign_payload(b"payload", "secret-1");
        assert!(!verify_webhook_signature(b"payload", &signature, None, "secret-1", 0));
    }

    #[test]
    fn test_verify_timestamp_window() {
        let body = b"payload";
        let header = signature_header_value(&sign_payload(body, "s"));
        let now = 1_700_000_000;

        let fresh = (now - 10).to_string();
        assert!(verify_webhook_signature(body, &header, Some(&fresh), "s", now));

        let replayed = (now - 301).to_string();
        assert!(!verify_webhook_signature(body, &header, Some(&replayed), "s", now));

        let slightly_ahead = (now + 30).to_string();
        assert!(verify_webhook_signature(body, &header, Some(&slightly_ahead), "s", now));

        let far_ahead = (now + 120).to_string();
        assert!(!verify_webhook_signature(body, &header, Some(&far_ahead), "s", now));

        assert!(!verify_webhook_signature(body, &header, Some("not-a-number"), "s", now));
    }

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_event_filter() {
        assert!(event_enabled(None, BatchStatus::Completed));
        assert!(event_enabled(None, BatchStatus::Failed));
        assert!(event_enabled(Some("completed,failed"), BatchStatus::Failed));
        assert!(event_enabled(Some("completed"), BatchStatus::Completed));
        assert!(!event_enabled(Some("completed"), BatchStatus::Failed));
        assert!(!event_enabled(Some("failed"), BatchStatus::Completed));
        assert!(!event_enabled(None, BatchStatus::Cancelled));
        assert!(!event_enabled(None, BatchStatus::InProgress));
    }
}
