use crate::{db::models::stream_models::StreamRecord, error::Error};
use chrono::Utc;
use log::info;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Streams repository for handling stream catalogue operations
#[derive(Clone)]
pub struct StreamsRepository {
    pool: Arc<SqlitePool>,
}

/// Attach a context message to a database failure while keeping its category
fn with_context(context: &str) -> impl Fn(sqlx::Error) -> Error + '_ {
    move |e| match Error::from(e) {
        Error::Conflict(msg) => Error::Conflict(format!("{}: {}", context, msg)),
        Error::Database(msg) => Error::Database(format!("{}: {}", context, msg)),
        other => other,
    }
}

impl StreamsRepository {
    /// Create a new streams repository
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Insert a new stream. Uniqueness of both the key and the hash is
    /// enforced by the table constraints inside this single statement.
    pub async fn create(&self, stream_key: &str, routing_hash: &str) -> Result<StreamRecord, Error> {
        let record = sqlx::query_as::<_, StreamRecord>(
            r#"
            INSERT INTO streams (stream_key, hash_key, created_at)
            VALUES (?, ?, ?)
            RETURNING id, stream_key, hash_key, created_at
            "#,
        )
        .bind(stream_key)
        .bind(routing_hash)
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
        .map_err(with_context("Failed to create stream"))?;

        info!("Created stream {} ({})", record.id, record.routing_hash);

        Ok(record)
    }

    /// Get all streams ordered by id
    pub async fn get_all(&self) -> Result<Vec<StreamRecord>, Error> {
        sqlx::query_as::<_, StreamRecord>(
            r#"
            SELECT id, stream_key, hash_key, created_at
            FROM streams
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(with_context("Failed to list streams"))
    }

    /// Get stream by its publisher key
    pub async fn get_by_key(&self, stream_key: &str) -> Result<Option<StreamRecord>, Error> {
        sqlx::query_as::<_, StreamRecord>(
            r#"
            SELECT id, stream_key, hash_key, created_at
            FROM streams
            WHERE stream_key = ?
            "#,
        )
        .bind(stream_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(with_context("Failed to get stream by key"))
    }

    /// Get stream by its routing hash
    pub async fn get_by_hash(&self, routing_hash: &str) -> Result<Option<StreamRecord>, Error> {
        sqlx::query_as::<_, StreamRecord>(
            r#"
            SELECT id, stream_key, hash_key, created_at
            FROM streams
            WHERE hash_key = ?
            "#,
        )
        .bind(routing_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(with_context("Failed to get stream by hash"))
    }

    /// Delete a stream, returning whether a row was removed
    pub async fn delete(&self, id: i64) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(with_context("Failed to delete stream"))?;

        Ok(result.rows_affected() > 0)
    }
}
