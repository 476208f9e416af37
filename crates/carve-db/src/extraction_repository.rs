use carve_core::error::AppError;
use carve_core::models::ExtractionRecord;
use carve_core::traits::ExtractionStore;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Repository for extraction persistence in PostgreSQL.
#[derive(Clone)]
pub struct ExtractionRepository {
    pool: Pool<Postgres>,
}

impl ExtractionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent extractions under a prefix.
    pub async fn list_for_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<ExtractionRecord>, AppError> {
        let rows = sqlx::query_as::<_, ExtractionRow>(
            r#"
            SELECT url, prefix, config_id, parsed_content, content_hash, extracted_at
            FROM extractions
            WHERE prefix = $1
            ORDER BY extracted_at DESC
            LIMIT $2
            "#,
        )
        .bind(prefix)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ExtractionRow {
    url: String,
    prefix: String,
    config_id: Uuid,
    parsed_content: String,
    content_hash: String,
    extracted_at: DateTime<Utc>,
}

impl From<ExtractionRow> for ExtractionRecord {
    fn from(row: ExtractionRow) -> Self {
        ExtractionRecord {
            url: row.url,
            prefix: row.prefix,
            config_id: row.config_id,
            parsed_content: row.parsed_content,
            content_hash: row.content_hash,
            extracted_at: row.extracted_at,
        }
    }
}

impl ExtractionStore for ExtractionRepository {
    async fn save(&self, record: &ExtractionRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO extractions (url, prefix, config_id, parsed_content, content_hash, extracted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (url) DO UPDATE
            SET prefix = EXCLUDED.prefix,
                config_id = EXCLUDED.config_id,
                parsed_content = EXCLUDED.parsed_content,
                content_hash = EXCLUDED.content_hash,
                extracted_at = EXCLUDED.extracted_at
            "#,
        )
        .bind(&record.url)
        .bind(&record.prefix)
        .bind(record.config_id)
        .bind(&record.parsed_content)
        .bind(&record.content_hash)
        .bind(record.extracted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Option<ExtractionRecord>, AppError> {
        let row = sqlx::query_as::<_, ExtractionRow>(
            r#"
            SELECT url, prefix, config_id, parsed_content, content_hash, extracted_at
            FROM extractions
            WHERE url = $1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn exists(&self, url: &str) -> Result<bool, AppError> {
        let row: (bool,) =
            sqlx::query_as(r#"SELECT EXISTS (SELECT 1 FROM extractions WHERE url = $1)"#)
                .bind(url)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0)
    }

    async fn count_for_prefix(&self, prefix: &str) -> Result<u64, AppError> {
        let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM extractions WHERE prefix = $1"#)
            .bind(prefix)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0 as u64)
    }
}
