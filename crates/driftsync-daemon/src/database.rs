//! Vault-gated database access
//!
//! The configuration database opens and closes under vault control: while
//! locked there is no pool at all, so every consumer goes through
//! [`GatedDatabase`] and receives an auth error instead of touching a
//! half-decrypted file. The delta store and history sink below are thin
//! capability objects over the gate.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::info;

use driftsync_core::domain::change::{DeltaState, RemoteKey};
use driftsync_core::ports::{DatabaseGate, DeltaStateStore, HistoryEntry, HistorySink};
use driftsync_core::CoreError;
use driftsync_store::{DatabasePool, SqliteDeltaStore, SqliteHistoryStore};

/// Holds the database pool while the vault is unlocked.
pub struct GatedDatabase {
    db_path: PathBuf,
    pool: RwLock<Option<DatabasePool>>,
}

impl GatedDatabase {
    pub fn new(db_path: PathBuf) -> Self {
        GatedDatabase {
            db_path,
            pool: RwLock::new(None),
        }
    }

    /// The current pool, or an auth error while the vault is locked.
    pub async fn pool(&self) -> Result<SqlitePool, CoreError> {
        let guard = self.pool.read().await;
        guard
            .as_ref()
            .map(|p| p.pool().clone())
            .ok_or_else(|| CoreError::Auth("vault is locked".into()))
    }
}

#[async_trait]
impl DatabaseGate for GatedDatabase {
    async fn open(&self) -> Result<(), CoreError> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let pool = DatabasePool::new(&self.db_path)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        *guard = Some(pool);
        info!(path = %self.db_path.display(), "Configuration database opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
            info!("Configuration database closed");
        }
        Ok(())
    }
}

/// Delta state store that resolves the pool per call.
pub struct GatedDeltaStore {
    database: std::sync::Arc<GatedDatabase>,
}

impl GatedDeltaStore {
    pub fn new(database: std::sync::Arc<GatedDatabase>) -> Self {
        GatedDeltaStore { database }
    }
}

#[async_trait]
impl DeltaStateStore for GatedDeltaStore {
    async fn get_state(&self, key: &RemoteKey) -> Result<Option<DeltaState>, CoreError> {
        let pool = self.database.pool().await?;
        SqliteDeltaStore::new(pool).get_state(key).await
    }

    async fn record_full_sync(
        &self,
        key: &RemoteKey,
        provider: &str,
        is_watching: bool,
    ) -> Result<(), CoreError> {
        let pool = self.database.pool().await?;
        SqliteDeltaStore::new(pool)
            .record_full_sync(key, provider, is_watching)
            .await
    }

    async fn increment_delta_count(&self, key: &RemoteKey) -> Result<(), CoreError> {
        let pool = self.database.pool().await?;
        SqliteDeltaStore::new(pool).increment_delta_count(key).await
    }

    async fn set_watching(&self, key: &RemoteKey, watching: bool) -> Result<(), CoreError> {
        let pool = self.database.pool().await?;
        SqliteDeltaStore::new(pool).set_watching(key, watching).await
    }
}

/// History sink that resolves the pool per call.
pub struct GatedHistoryStore {
    database: std::sync::Arc<GatedDatabase>,
}

impl GatedHistoryStore {
    pub fn new(database: std::sync::Arc<GatedDatabase>) -> Self {
        GatedHistoryStore { database }
    }
}

#[async_trait]
impl HistorySink for GatedHistoryStore {
    async fn record(&self, entry: HistoryEntry) -> Result<(), CoreError> {
        let pool = self.database.pool().await?;
        SqliteHistoryStore::new(pool).record(entry).await
    }
}
