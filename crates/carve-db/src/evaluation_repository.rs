use carve_core::error::AppError;
use carve_core::models::{EvaluationResult, EvaluationRun, RunHeader};
use carve_core::traits::EvaluationRunStore;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Evaluation runs and their per-sample results.
#[derive(Clone)]
pub struct EvaluationRepository {
    pool: Pool<Postgres>,
}

impl EvaluationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    url: String,
    domain: String,
    config_name: String,
    expected_content: String,
    parsed_content: String,
    abs_levenshtein_distance_norm: f64,
    exact_match: bool,
    missing_content: bool,
    extra_content: bool,
}

impl From<ResultRow> for EvaluationResult {
    fn from(row: ResultRow) -> Self {
        EvaluationResult {
            url: row.url,
            domain: row.domain,
            config_name: row.config_name,
            expected_content: row.expected_content,
            parsed_content: row.parsed_content,
            abs_levenshtein_distance_norm: row.abs_levenshtein_distance_norm,
            exact_match: row.exact_match,
            missing_content: row.missing_content,
            extra_content: row.extra_content,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HeaderRow {
    id: Uuid,
    datetime: DateTime<Utc>,
    result_count: i64,
}

impl EvaluationRunStore for EvaluationRepository {
    async fn save_run(&self, run: &EvaluationRun) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO evaluation_runs (id, datetime)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id)
        .bind(run.datetime)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if inserted.rows_affected() == 0 {
            return Err(AppError::AlreadyExists(format!("evaluation run {}", run.id)));
        }

        for (position, result) in run.results.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO evaluation_results (
                    run_id, position, url, domain, config_name, expected_content, parsed_content,
                    abs_levenshtein_distance_norm, exact_match, missing_content, extra_content
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(run.id)
            .bind(position as i32)
            .bind(&result.url)
            .bind(&result.domain)
            .bind(&result.config_name)
            .bind(&result.expected_content)
            .bind(&result.parsed_content)
            .bind(result.abs_levenshtein_distance_norm)
            .bind(result.exact_match)
            .bind(result.missing_content)
            .bind(result.extra_content)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        // Dropping `tx` on an early return rolls the whole run back.
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(run_id = %run.id, results = run.results.len(), "Evaluation run stored");
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EvaluationRun>, AppError> {
        let header: Option<(Uuid, DateTime<Utc>)> =
            sqlx::query_as(r#"SELECT id, datetime FROM evaluation_runs WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let Some((id, datetime)) = header else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT url, domain, config_name, expected_content, parsed_content,
                   abs_levenshtein_distance_norm, exact_match, missing_content, extra_content
            FROM evaluation_results
            WHERE run_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(Some(EvaluationRun {
            id,
            datetime,
            results: rows.into_iter().map(Into::into).collect(),
        }))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunHeader>, AppError> {
        let rows = sqlx::query_as::<_, HeaderRow>(
            r#"
            SELECT r.id, r.datetime, COUNT(e.run_id) AS result_count
            FROM evaluation_runs r
            LEFT JOIN evaluation_results e ON e.run_id = r.id
            GROUP BY r.id, r.datetime
            ORDER BY r.datetime DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| RunHeader {
                id: row.id,
                datetime: row.datetime,
                result_count: row.result_count as usize,
            })
            .collect())
    }

    async fn delete_run(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(r#"DELETE FROM evaluation_runs WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_runs(&self) -> Result<u64, AppError> {
        let result = sqlx::query(r#"DELETE FROM evaluation_runs"#)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
