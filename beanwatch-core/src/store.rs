//! Durable per-stream state.
//!
//! Each stream persists exactly one `(cursor, seen set)` pair under its
//! name. Streams own disjoint keys and a stream has a single writer (its
//! runner), so there is no cross-stream contention. Commits must be
//! crash-consistent: a partial write never corrupts previously committed
//! state.

use crate::stream::{OrderingKey, SeenSet, StreamState};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from loading or committing stream state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value persistence for stream cursors and seen sets.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, stream: &str) -> Result<Option<StreamState>, StateStoreError>;

    /// Atomically replace the committed state for `stream`.
    async fn commit(&self, stream: &str, state: &StreamState) -> Result<(), StateStoreError>;
}

/// Postgres-backed store.
///
/// The whole state pair is written by a single upsert statement, so a
/// crash mid-commit leaves the previously committed row intact.
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StateStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS beanwatch_stream_state (
                stream_name      TEXT PRIMARY KEY,
                cursor_primary   BIGINT NOT NULL,
                cursor_secondary BIGINT NOT NULL,
                seen             JSONB NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, stream: &str) -> Result<Option<StreamState>, StateStoreError> {
        let row = sqlx::query(
            "SELECT cursor_primary, cursor_secondary, seen \
             FROM beanwatch_stream_state WHERE stream_name = $1",
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let primary: i64 = row.try_get("cursor_primary")?;
        let secondary: i64 = row.try_get("cursor_secondary")?;
        let seen_json: serde_json::Value = row.try_get("seen")?;
        let seen: SeenSet = serde_json::from_value(seen_json)?;

        Ok(Some(StreamState {
            cursor: OrderingKey {
                primary: primary as u64,
                secondary: secondary as u64,
            },
            seen,
        }))
    }

    async fn commit(&self, stream: &str, state: &StreamState) -> Result<(), StateStoreError> {
        let seen_json = serde_json::to_value(&state.seen)?;
        sqlx::query(
            "INSERT INTO beanwatch_stream_state \
                 (stream_name, cursor_primary, cursor_secondary, seen, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (stream_name) DO UPDATE SET \
                 cursor_primary = EXCLUDED.cursor_primary, \
                 cursor_secondary = EXCLUDED.cursor_secondary, \
                 seen = EXCLUDED.seen, \
                 updated_at = now()",
        )
        .bind(stream)
        .bind(state.cursor.primary as i64)
        .bind(state.cursor.secondary as i64)
        .bind(seen_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory store for tests and `--dry-run` mode. Not crash-consistent,
/// by definition.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<HashMap<String, StreamState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, stream: &str) -> Result<Option<StreamState>, StateStoreError> {
        Ok(self.inner.read().await.get(stream).cloned())
    }

    async fn commit(&self, stream: &str, state: &StreamState) -> Result<(), StateStoreError> {
        self.inner
            .write()
            .await
            .insert(stream.to_string(), state.clone());
        Ok(())
    }
}
