// File repository

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::StoredFile;
use tracing::instrument;

pub struct FileRepository {
    pool: DbPool,
}

impl FileRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, file), fields(file_id = %file.file_id))]
    pub async fn create(&self, file: &StoredFile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO files (file_id, filename, bytes, purpose, created_at, path, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.filename)
        .bind(file.bytes)
        .bind(file.purpose.to_string())
        .bind(file.created_at)
        .bind(&file.path)
        .bind(file.deleted)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(file_id = %file.file_id, bytes = file.bytes, "File registered");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, file_id: &str) -> Result<Option<StoredFile>, StoreError> {
        let file = sqlx::query_as::<_, StoredFile>(
            "SELECT * FROM files WHERE file_id = $1 AND deleted = FALSE",
        )
        .bind(file_id)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(file)
    }

    /// Soft delete; the bytes on disk are left in place
    #[instrument(skip(self))]
    pub async fn mark_deleted(&self, file_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE files SET deleted = TRUE WHERE file_id = $1")
            .bind(file_id)
            .execute(self.pool.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        Ok(())
    }
}
