//! State repository and collaborator ports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::change::{DeltaState, RemoteKey};
use crate::domain::errors::CoreError;
use crate::domain::task::{ActionKind, TaskState};

/// Persistence for per-remote delta records (`delta_state` table).
#[async_trait]
pub trait DeltaStateStore: Send + Sync {
    /// Returns the record for a key, or `None` when absent.
    async fn get_state(&self, key: &RemoteKey) -> Result<Option<DeltaState>, CoreError>;

    /// Records a full sync: resets the delta counter, stamps a new baseline,
    /// updates provider and watching state. Upserts on the remote key.
    async fn record_full_sync(
        &self,
        key: &RemoteKey,
        provider: &str,
        is_watching: bool,
    ) -> Result<(), CoreError>;

    /// Increments the consecutive delta-sync counter.
    async fn increment_delta_count(&self, key: &RemoteKey) -> Result<(), CoreError>;

    /// Updates the is-watching flag.
    async fn set_watching(&self, key: &RemoteKey, watching: bool) -> Result<(), CoreError>;
}

/// A terminal task outcome destined for the history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: u64,
    pub action: ActionKind,
    pub source: String,
    pub destination: String,
    pub state: TaskState,
    pub error: Option<String>,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Recorder for terminal task outcomes.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> Result<(), CoreError>;
}

/// Open/close hooks for the configuration database, used by the vault when
/// it transitions the database file between plaintext and encrypted states.
#[async_trait]
pub trait DatabaseGate: Send + Sync {
    /// Opens the database from its plaintext file.
    async fn open(&self) -> Result<(), CoreError>;

    /// Closes the database, checkpointing the WAL so the main file is
    /// self-contained before encryption.
    async fn close(&self) -> Result<(), CoreError>;
}

/// A gate over nothing. Useful in tests and before a database exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDatabaseGate;

#[async_trait]
impl DatabaseGate for NullDatabaseGate {
    async fn open(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
