//! Task history recording

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use driftsync_core::ports::{HistoryEntry, HistorySink};
use driftsync_core::CoreError;

use crate::StoreError;

/// SQLite-backed implementation of the `HistorySink` port.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistorySink for SqliteHistoryStore {
    async fn record(&self, entry: HistoryEntry) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO history \
             (id, task_id, action, source, destination, state, error, \
              bytes_transferred, files_transferred, started_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.task_id as i64)
        .bind(entry.action.as_str())
        .bind(&entry.source)
        .bind(&entry.destination)
        .bind(entry.state.as_str())
        .bind(&entry.error)
        .bind(entry.bytes_transferred as i64)
        .bind(entry.files_transferred as i64)
        .bind(entry.started_at.to_rfc3339())
        .bind(entry.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabasePool;
    use chrono::Utc;
    use driftsync_core::domain::task::{ActionKind, TaskState};
    use sqlx::Row;

    #[tokio::test]
    async fn test_record_inserts_row() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = SqliteHistoryStore::new(pool.pool().clone());

        store
            .record(HistoryEntry {
                task_id: 7,
                action: ActionKind::Push,
                source: "/data".into(),
                destination: "gdrive:/backup".into(),
                state: TaskState::Completed,
                error: None,
                bytes_transferred: 1024,
                files_transferred: 3,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            })
            .await
            .unwrap();

        let row = sqlx::query("SELECT task_id, action, state FROM history")
            .fetch_one(pool.pool())
            .await
            .unwrap();
        let task_id: i64 = row.get("task_id");
        let action: String = row.get("action");
        let state: String = row.get("state");
        assert_eq!(task_id, 7);
        assert_eq!(action, "push");
        assert_eq!(state, "completed");
    }
}
