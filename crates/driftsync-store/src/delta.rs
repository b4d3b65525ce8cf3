//! SQLite implementation of the `DeltaStateStore` port
//!
//! Timestamps are stored as RFC 3339 text. Upserts use
//! `ON CONFLICT(remote_key) DO UPDATE` so a full-sync record works whether
//! or not the key has been seen before.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use driftsync_core::domain::change::{DeltaState, RemoteKey};
use driftsync_core::ports::DeltaStateStore;
use driftsync_core::CoreError;

use crate::StoreError;

/// SQLite-backed delta state repository.
pub struct SqliteDeltaStore {
    pool: SqlitePool,
}

impl SqliteDeltaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref()
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl DeltaStateStore for SqliteDeltaStore {
    async fn get_state(&self, key: &RemoteKey) -> Result<Option<DeltaState>, CoreError> {
        let row = sqlx::query(
            "SELECT remote_key, provider, is_watching, last_full_sync, delta_count \
             FROM delta_state WHERE remote_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let is_watching: i64 = row.get("is_watching");
        let last_full_sync: Option<String> = row.get("last_full_sync");
        let delta_count: i64 = row.get("delta_count");

        Ok(Some(DeltaState {
            remote_key: key.clone(),
            provider: row.get("provider"),
            is_watching: is_watching != 0,
            last_full_sync: parse_optional_datetime(last_full_sync),
            delta_count: delta_count.max(0) as u32,
        }))
    }

    async fn record_full_sync(
        &self,
        key: &RemoteKey,
        provider: &str,
        is_watching: bool,
    ) -> Result<(), CoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO delta_state (remote_key, provider, is_watching, last_full_sync, delta_count, updated_at) \
             VALUES (?, ?, ?, ?, 0, ?) \
             ON CONFLICT(remote_key) DO UPDATE SET \
                 provider = excluded.provider, \
                 is_watching = excluded.is_watching, \
                 last_full_sync = excluded.last_full_sync, \
                 delta_count = 0, \
                 updated_at = excluded.updated_at",
        )
        .bind(key.as_str())
        .bind(provider)
        .bind(is_watching as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn increment_delta_count(&self, key: &RemoteKey) -> Result<(), CoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE delta_state SET delta_count = delta_count + 1, updated_at = ? \
             WHERE remote_key = ?",
        )
        .bind(&now)
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }

    async fn set_watching(&self, key: &RemoteKey, watching: bool) -> Result<(), CoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE delta_state SET is_watching = ?, updated_at = ? WHERE remote_key = ?",
        )
        .bind(watching as i64)
        .bind(&now)
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }
}
