//! driftsync store - SQLite state persistence
//!
//! SQLite-backed storage for:
//! - Per-remote delta records (`delta_state`)
//! - Boards with their nodes and edges
//! - Task history
//! - Profiles, flows and schedules (CRUD tables consumed by outer layers)
//!
//! This crate implements the `DeltaStateStore` and `HistorySink` ports from
//! `driftsync-core` using SQLite. It is a driven (secondary) adapter.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteDeltaStore`] - `DeltaStateStore` implementation
//! - [`SqliteBoardStore`] - Board loading for the executor
//! - [`SqliteHistoryStore`] - `HistorySink` implementation

pub mod boards;
pub mod delta;
pub mod history;
pub mod pool;

pub use boards::SqliteBoardStore;
pub use delta::SqliteDeltaStore;
pub use history::SqliteHistoryStore;
pub use pool::DatabasePool;

use driftsync_core::CoreError;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::QueryFailed(e.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Internal(e.to_string())
    }
}
