// Webhook dead-letter repository

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::WebhookDeadLetter;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

/// A delivery that exhausted its retry budget, ready to be enqueued
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub batch_id: String,
    pub webhook_url: String,
    pub payload: String,
    pub error_message: String,
    pub attempts: i32,
    pub last_attempt_at: DateTime<Utc>,
}

pub struct DeadLetterRepository {
    pool: DbPool,
}

impl DeadLetterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, entry), fields(batch_id = %entry.batch_id))]
    pub async fn enqueue(&self, entry: &NewDeadLetter) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO webhook_dead_letter
                (batch_id, webhook_url, payload, error_message, attempts, last_attempt_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&entry.batch_id)
        .bind(&entry.webhook_url)
        .bind(&entry.payload)
        .bind(&entry.error_message)
        .bind(entry.attempts)
        .bind(entry.last_attempt_at)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await?;

        let id: i64 = row.try_get("id")?;
        tracing::warn!(
            dead_letter_id = id,
            batch_id = %entry.batch_id,
            attempts = entry.attempts,
            "Webhook delivery moved to dead letter queue"
        );
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<WebhookDeadLetter>, StoreError> {
        let entry = sqlx::query_as::<_, WebhookDeadLetter>(
            "SELECT * FROM webhook_dead_letter WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(entry)
    }

    #[instrument(skip(self))]
    pub async fn list(
        &self,
        batch_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<WebhookDeadLetter>, StoreError> {
        let entries = match batch_id {
            Some(batch_id) => {
                sqlx::query_as::<_, WebhookDeadLetter>(
                    r#"
                    SELECT * FROM webhook_dead_letter
                    WHERE batch_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(batch_id)
                .bind(limit)
                .fetch_all(self.pool.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, WebhookDeadLetter>(
                    "SELECT * FROM webhook_dead_letter ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(self.pool.pool())
                .await?
            }
        };
        Ok(entries)
    }

    /// Record the outcome of an administrative retry
    #[instrument(skip(self))]
    pub async fn mark_retry(&self, id: i64, success: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_dead_letter
            SET retried_at = $2, retry_success = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(success)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("dead letter {}", id)));
        }
        Ok(())
    }
}
