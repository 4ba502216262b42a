//! Postgres-backed feed repository.
//!
//! Expects a `feeds` table owned by the CMS:
//!
//! | column | type |
//! |---|---|
//! | `id` | `BIGINT` primary key |
//! | `url` | `TEXT` |
//! | `name` | `TEXT` |
//! | `enabled` | `BOOLEAN` |
//! | `fetch_interval_minutes` | `INTEGER` |
//! | `last_fetched_at` | `TIMESTAMPTZ NULL` |
//! | `last_error` | `TEXT NULL` |
//!
//! A feed is due when it is enabled and either never fetched or fetched at
//! least `fetch_interval_minutes` ago.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use feedsync_core::{FeedId, FeedRepository, FeedResource, RepositoryError, RepositoryResult};

/// Feed repository over a SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresFeedRepository {
    pool: Arc<PgPool>,
}

impl PostgresFeedRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Open a small pool against `database_url`.
    pub async fn connect(database_url: &str) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl FeedRepository for PostgresFeedRepository {
    async fn find_enabled_due(&self) -> RepositoryResult<Vec<FeedResource>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, name
            FROM feeds
            WHERE enabled
              AND (
                last_fetched_at IS NULL
                OR last_fetched_at + make_interval(mins => fetch_interval_minutes) <= NOW()
              )
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_enabled_due", e))?;

        rows.iter().map(feed_from_row).collect()
    }

    async fn find_by_id(&self, id: FeedId) -> RepositoryResult<Option<FeedResource>> {
        let row = sqlx::query("SELECT id, url, name FROM feeds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.as_ref().map(feed_from_row).transpose()
    }

    async fn update_last_fetched(&self, id: FeedId, error: Option<&str>) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched_at = NOW(),
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_last_fetched", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }
}

fn feed_from_row(row: &PgRow) -> RepositoryResult<FeedResource> {
    let read = |e: sqlx::Error| RepositoryError::query(format!("failed to read feed row: {e}"));
    Ok(FeedResource {
        id: FeedId::new(row.try_get("id").map_err(read)?),
        url: row.try_get("url").map_err(read)?,
        name: row.try_get("name").map_err(read)?,
    })
}

/// Map SQLx errors to RepositoryError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Io(e) => RepositoryError::unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => RepositoryError::unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            RepositoryError::unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Database(db_err) => {
            RepositoryError::query(format!("database error in {operation}: {}", db_err.message()))
        }
        other => RepositoryError::query(format!("sqlx error in {operation}: {other}")),
    }
}
