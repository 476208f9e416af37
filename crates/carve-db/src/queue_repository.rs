use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use carve_core::error::AppError;
use carve_core::queue::{DeadLetter, QueueItem, WorkQueue};

/// PostgreSQL-backed work queue using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// Items move `pending -> claimed -> (deleted | pending | dead)`. Dead items
/// stay in the table until requeued.
#[derive(Clone)]
pub struct QueueRepository {
    pool: Pool<Postgres>,
}

impl QueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of items currently held by workers.
    pub async fn claimed_count(&self) -> Result<u64, AppError> {
        let row: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM work_queue WHERE status = 'claimed'"#)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0 as u64)
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    url: String,
    enqueued_at: DateTime<Utc>,
    attempt_count: i32,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl From<QueueRow> for QueueItem {
    fn from(row: QueueRow) -> Self {
        QueueItem {
            id: row.id,
            url: row.url,
            enqueued_at: row.enqueued_at,
            attempt_count: row.attempt_count as u32,
            available_at: row.available_at,
            last_error: row.last_error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadRow {
    id: Uuid,
    url: String,
    enqueued_at: DateTime<Utc>,
    attempt_count: i32,
    dead_reason: Option<String>,
    dead_at: Option<DateTime<Utc>>,
}

impl From<DeadRow> for DeadLetter {
    fn from(row: DeadRow) -> Self {
        DeadLetter {
            id: row.id,
            url: row.url,
            enqueued_at: row.enqueued_at,
            attempt_count: row.attempt_count as u32,
            reason: row.dead_reason.unwrap_or_default(),
            dead_at: row.dead_at.unwrap_or(row.enqueued_at),
        }
    }
}

fn claimed_item_missing(id: Uuid) -> AppError {
    AppError::NotFound(format!("claimed queue item {id}"))
}

impl WorkQueue for QueueRepository {
    async fn enqueue(&self, url: &str) -> Result<QueueItem, AppError> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            INSERT INTO work_queue (id, url)
            VALUES ($1, $2)
            RETURNING id, url, enqueued_at, attempt_count, available_at, last_error
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.into())
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueItem>, AppError> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE work_queue
            SET status = 'claimed', worker_id = $1, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM work_queue
                WHERE status = 'pending' AND available_at <= NOW()
                ORDER BY available_at, enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, url, enqueued_at, attempt_count, available_at, last_error
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn ack(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(r#"DELETE FROM work_queue WHERE id = $1 AND status = 'claimed'"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(claimed_item_missing(id));
        }
        Ok(())
    }

    async fn retry(&self, id: Uuid, error: &str, available_at: DateTime<Utc>) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'pending',
                attempt_count = attempt_count + 1,
                last_error = $2,
                available_at = $3,
                worker_id = NULL,
                claimed_at = NULL
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(claimed_item_missing(id));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: Uuid, reason: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'dead',
                attempt_count = attempt_count + 1,
                last_error = $2,
                dead_reason = $2,
                dead_at = NOW(),
                worker_id = NULL,
                claimed_at = NULL
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(claimed_item_missing(id));
        }
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, AppError> {
        let rows = sqlx::query_as::<_, DeadRow>(
            r#"
            SELECT id, url, enqueued_at, attempt_count, dead_reason, dead_at
            FROM work_queue
            WHERE status = 'dead'
            ORDER BY dead_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<QueueItem, AppError> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE work_queue
            SET status = 'pending',
                attempt_count = 0,
                last_error = NULL,
                enqueued_at = NOW(),
                available_at = NOW(),
                dead_reason = NULL,
                dead_at = NULL
            WHERE id = $1 AND status = 'dead'
            RETURNING id, url, enqueued_at, attempt_count, available_at, last_error
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(Into::into)
            .ok_or_else(|| AppError::NotFound(format!("dead letter {id}")))
    }

    async fn pending_count(&self) -> Result<u64, AppError> {
        let row: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM work_queue WHERE status = 'pending'"#)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0 as u64)
    }

    async fn release(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'pending', worker_id = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(claimed_item_missing(id));
        }
        Ok(())
    }

    async fn reclaim_expired(&self, lease: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'pending', worker_id = NULL, claimed_at = NULL
            WHERE status = 'claimed'
              AND claimed_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() > 0 {
            tracing::warn!(reclaimed = result.rows_affected(), "Expired queue claims returned");
        }
        Ok(result.rows_affected())
    }

    async fn release_worker(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'pending', worker_id = NULL, claimed_at = NULL
            WHERE worker_id = $1 AND status = 'claimed'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
