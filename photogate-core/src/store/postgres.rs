//! Postgres-backed record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AdmissionError, Result};
use crate::record::{
    HashCandidate, ImageMeta, ImageRecord, ImageStatus, NewImageRecord, RecordFilter, RecordPatch,
};
use crate::store::RecordStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id UUID PRIMARY KEY,
    original_name TEXT NOT NULL,
    original_size BIGINT NOT NULL,
    original_path TEXT NOT NULL,
    processed_path TEXT,
    processed_size BIGINT,
    file_type TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    status TEXT NOT NULL,
    meta_data JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_images_status ON images (status);
CREATE INDEX IF NOT EXISTS idx_images_created_at ON images (created_at DESC);
CREATE INDEX IF NOT EXISTS idx_images_hash_candidates
    ON images (status) WHERE meta_data ? 'pHash';
"#;

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL record store");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(connection_string)
            .await
            .map_err(|e| AdmissionError::Unavailable(format!("postgres connect: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        debug!("Ensuring images table and indexes exist");
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Read-modify-write under a row lock, shared by `update` and
    /// `transition`. Row locking is what makes the patch atomic per record.
    async fn patch_locked(
        &self,
        id: Uuid,
        precondition: Option<ImageStatus>,
        patch: RecordPatch,
    ) -> Result<Option<ImageRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM images WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = record_from_row(&row)?;

        if let Some(expected) = precondition {
            if record.status != expected {
                return Ok(None);
            }
        }

        patch.apply(&mut record);
        write_record(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(record))
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn create(&self, new: NewImageRecord) -> Result<ImageRecord> {
        let now = Utc::now();
        let record = ImageRecord {
            id: Uuid::new_v4(),
            original_name: new.original_name,
            original_size: new.original_size,
            original_path: new.original_path,
            processed_path: None,
            processed_size: None,
            file_type: new.file_type,
            width: None,
            height: None,
            status: ImageStatus::Pending,
            meta_data: ImageMeta::default(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO images \
             (id, original_name, original_size, original_path, processed_path, processed_size, \
              file_type, width, height, status, meta_data, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(record.id)
        .bind(&record.original_name)
        .bind(record.original_size as i64)
        .bind(&record.original_path)
        .bind(&record.processed_path)
        .bind(record.processed_size.map(|s| s as i64))
        .bind(&record.file_type)
        .bind(record.width.map(|w| w as i32))
        .bind(record.height.map(|h| h as i32))
        .bind(record.status.as_str())
        .bind(serde_json::to_value(&record.meta_data)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>> {
        let row = sqlx::query("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<Option<ImageRecord>> {
        self.patch_locked(id, None, patch).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ImageStatus,
        to: ImageStatus,
        mut patch: RecordPatch,
    ) -> Result<Option<ImageRecord>> {
        patch.status = Some(to);
        self.patch_locked(id, Some(from), patch).await
    }

    async fn list(
        &self,
        filter: RecordFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ImageRecord>, u64)> {
        let (rows, total_row) = match filter.status {
            Some(status) => {
                let rows = sqlx::query(
                    "SELECT * FROM images WHERE status = $1 \
                     ORDER BY created_at DESC OFFSET $2 LIMIT $3",
                )
                .bind(status.as_str())
                .bind(offset as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
                let total = sqlx::query("SELECT COUNT(*) AS total FROM images WHERE status = $1")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
            None => {
                let rows =
                    sqlx::query("SELECT * FROM images ORDER BY created_at DESC OFFSET $1 LIMIT $2")
                        .bind(offset as i64)
                        .bind(limit as i64)
                        .fetch_all(&self.pool)
                        .await?;
                let total = sqlx::query("SELECT COUNT(*) AS total FROM images")
                    .fetch_one(&self.pool)
                    .await?;
                (rows, total)
            }
        };

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        let total: i64 = total_row.get("total");
        Ok((records, total as u64))
    }

    async fn find_processed_with_hash(&self) -> Result<Vec<HashCandidate>> {
        let rows = sqlx::query(
            "SELECT id, original_name, meta_data FROM images \
             WHERE status = $1 AND meta_data ? 'pHash'",
        )
        .bind(ImageStatus::Processed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let meta: serde_json::Value = row.get("meta_data");
                Ok(HashCandidate {
                    id: row.get("id"),
                    original_name: row.get("original_name"),
                    meta_data: serde_json::from_value(meta)?,
                })
            })
            .collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: &PgRow) -> Result<ImageRecord> {
    let status: String = row.get("status");
    let status = status
        .parse::<ImageStatus>()
        .map_err(AdmissionError::Internal)?;
    let meta: serde_json::Value = row.get("meta_data");
    let original_size: i64 = row.get("original_size");
    let processed_size: Option<i64> = row.get("processed_size");
    let width: Option<i32> = row.get("width");
    let height: Option<i32> = row.get("height");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(ImageRecord {
        id: row.get("id"),
        original_name: row.get("original_name"),
        original_size: original_size as u64,
        original_path: row.get("original_path"),
        processed_path: row.get("processed_path"),
        processed_size: processed_size.map(|s| s as u64),
        file_type: row.get("file_type"),
        width: width.map(|w| w as u32),
        height: height.map(|h| h as u32),
        status,
        meta_data: serde_json::from_value(meta)?,
        created_at,
        updated_at,
    })
}

async fn write_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &ImageRecord,
) -> Result<()> {
    sqlx::query(
        "UPDATE images SET \
         processed_path = $2, processed_size = $3, width = $4, height = $5, \
         status = $6, meta_data = $7, updated_at = $8 \
         WHERE id = $1",
    )
    .bind(record.id)
    .bind(&record.processed_path)
    .bind(record.processed_size.map(|s| s as i64))
    .bind(record.width.map(|w| w as i32))
    .bind(record.height.map(|h| h as i32))
    .bind(record.status.as_str())
    .bind(serde_json::to_value(&record.meta_data)?)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
