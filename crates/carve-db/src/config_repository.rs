use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use carve_core::error::AppError;
use carve_core::models::{ParserConfig, SelectorSet};
use carve_core::traits::ConfigStore;
use carve_core::urls::candidate_prefixes;

/// Parser configs and the production pointer per prefix.
#[derive(Clone)]
pub struct ConfigRepository {
    pool: Pool<Postgres>,
}

impl ConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All production prefixes with their config, longest prefix first.
    pub async fn list_production(&self) -> Result<Vec<ParserConfig>, AppError> {
        let rows = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT c.id, c.prefix, c.selectors, c.created_at
            FROM production_configs p
            JOIN parser_configs c ON c.id = p.config_id
            ORDER BY length(p.prefix) DESC, p.prefix
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: Uuid,
    prefix: String,
    selectors: Json<SelectorSet>,
    created_at: DateTime<Utc>,
}

impl From<ConfigRow> for ParserConfig {
    fn from(row: ConfigRow) -> Self {
        ParserConfig {
            id: row.id,
            prefix: row.prefix,
            selectors: row.selectors.0,
            created_at: row.created_at,
        }
    }
}

impl ConfigStore for ConfigRepository {
    async fn put(&self, config: &ParserConfig) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO parser_configs (id, prefix, selectors, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(config.id)
        .bind(&config.prefix)
        .bind(Json(&config.selectors))
        .bind(config.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::AlreadyExists(format!("parser config {}", config.id)));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ParserConfig>, AppError> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"SELECT id, prefix, selectors, created_at FROM parser_configs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn get(&self, prefix: &str) -> Result<Option<ParserConfig>, AppError> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT id, prefix, selectors, created_at
            FROM parser_configs
            WHERE prefix = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<ParserConfig>, AppError> {
        let rows = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT id, prefix, selectors, created_at
            FROM parser_configs
            WHERE $1::text IS NULL OR prefix = $1
            ORDER BY created_at DESC
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

    async fn promote(&self, id: Uuid) -> Result<ParserConfig, AppError> {
        // Single upsert: concurrent promotions for one prefix serialize on
        // the primary key and the last one wins.
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            WITH promoted AS (
                INSERT INTO production_configs (prefix, config_id, promoted_at)
                SELECT prefix, id, NOW() FROM parser_configs WHERE id = $1
                ON CONFLICT (prefix) DO UPDATE
                SET config_id = EXCLUDED.config_id, promoted_at = EXCLUDED.promoted_at
                RETURNING config_id
            )
            SELECT c.id, c.prefix, c.selectors, c.created_at
            FROM parser_configs c
            JOIN promoted p ON p.config_id = c.id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let config: ParserConfig = row
            .map(Into::into)
            .ok_or_else(|| AppError::NotFound(format!("parser config {id}")))?;
        tracing::info!(config_id = %config.id, prefix = %config.prefix, "Config promoted to production");
        Ok(config)
    }

    async fn current_production(&self, prefix: &str) -> Result<Option<ParserConfig>, AppError> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT c.id, c.prefix, c.selectors, c.created_at
            FROM production_configs p
            JOIN parser_configs c ON c.id = p.config_id
            WHERE p.prefix = $1
            "#,
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn production_for_url(&self, url: &str) -> Result<Option<ParserConfig>, AppError> {
        let Ok(candidates) = candidate_prefixes(url) else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT c.id, c.prefix, c.selectors, c.created_at
            FROM production_configs p
            JOIN parser_configs c ON c.id = p.config_id
            WHERE p.prefix = ANY($1)
            ORDER BY length(p.prefix) DESC
            LIMIT 1
            "#,
        )
        .bind(&candidates)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }
}
