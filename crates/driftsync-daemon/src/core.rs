//! Core assembly
//!
//! Builds the whole service graph in topological order and hands each
//! subsystem the narrow capability objects it needs: event sink, database
//! gate, delta store, credentials store. There are no post-construction
//! setters and no process-wide singletons; everything hangs off the one
//! [`Core`] value created at startup.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use driftsync_board::BoardExecutor;
use driftsync_core::config::Config;
use driftsync_core::domain::board::Board;
use driftsync_core::domain::profile::Profile;
use driftsync_core::domain::progress::SampleStatus;
use driftsync_core::domain::task::{ActionKind, TaskId};
use driftsync_core::events::{EventBus, EventEnvelope, EventSink};
use driftsync_core::ports::TransferBackend;
use driftsync_core::CoreError;
use driftsync_delta::DeltaService;
use driftsync_engine::{LocalBackend, TaskEngine};
use driftsync_vault::Vault;

use crate::credentials::FileCredentialsStore;
use crate::database::{GatedDatabase, GatedDeltaStore, GatedHistoryStore};

/// The long-lived service graph.
pub struct Core {
    pub config: Config,
    pub events: Arc<EventBus>,
    pub database: Arc<GatedDatabase>,
    pub vault: Arc<Vault>,
    pub delta: Arc<DeltaService>,
    pub engine: Arc<TaskEngine>,
    pub boards: Arc<BoardExecutor>,
}

impl Core {
    /// Assembles all services. Returns the core and the receiving half of
    /// the to-frontend event stream.
    pub fn build(config: Config) -> (Arc<Self>, mpsc::Receiver<EventEnvelope>) {
        // Leaves first: event bus, then the gated database, then the vault
        // that controls it, then the engines that consume both.
        let (events, event_rx) = EventBus::new(256);

        let database = Arc::new(GatedDatabase::new(config.db_path()));

        let gate: Arc<dyn driftsync_core::ports::DatabaseGate> = database.clone();
        let sink: Arc<dyn EventSink> = events.clone();
        let vault = Arc::new(Vault::new(
            config.auth_path(),
            vec![config.db_path(), config.credentials_path()],
            gate,
            sink,
        ));

        let delta = Arc::new(DeltaService::with_poll_interval(
            Arc::new(GatedDeltaStore::new(Arc::clone(&database))),
            std::time::Duration::from_secs(config.delta.poll_interval_secs),
        ));

        let backend: Arc<dyn TransferBackend> = Arc::new(LocalBackend::new());
        let credentials = Arc::new(FileCredentialsStore::new(config.credentials_path()));

        let engine_sink: Arc<dyn EventSink> = events.clone();
        let engine = TaskEngine::new(
            Arc::clone(&backend),
            credentials,
            Some(Arc::clone(&delta)),
            Some(Arc::new(GatedHistoryStore::new(Arc::clone(&database)))),
            engine_sink,
        )
        .with_tuning(
            std::time::Duration::from_millis(config.engine.progress_interval_ms),
            config.engine.progress_channel_capacity,
        );

        let board_sink: Arc<dyn EventSink> = events.clone();
        let boards = BoardExecutor::new(Arc::clone(&engine), Arc::clone(&backend), board_sink);

        let core = Arc::new(Core {
            config,
            events,
            database,
            vault,
            delta,
            engine,
            boards,
        });
        (core, event_rx)
    }

    /// Startup: vault recovery and either immediate availability or waiting
    /// for unlock. The orphaned-crypt-remote sweep runs once the
    /// credentials file is readable.
    pub async fn startup(&self) -> Result<(), CoreError> {
        self.vault.startup().await?;
        if self.vault.is_unlocked().await {
            let swept = self.engine.sweep_orphaned_crypt_remotes().await;
            if swept > 0 {
                info!(swept, "Removed orphaned crypt remotes");
            }
        }
        Ok(())
    }

    /// Completes deferred initialisation after a successful unlock.
    pub async fn after_unlock(&self) {
        let swept = self.engine.sweep_orphaned_crypt_remotes().await;
        if swept > 0 {
            info!(swept, "Removed orphaned crypt remotes");
        }
    }

    /// Graceful shutdown: stop watchers, then seal the vault.
    pub async fn shutdown(&self) {
        self.delta.stop_all().await;
        self.vault.shutdown().await;
        info!("Core shut down");
    }

    /// Starts a task, refusing while the vault is locked, and pumps its
    /// progress samples onto the event stream as `sync:progress`.
    pub async fn start_task(
        &self,
        action: ActionKind,
        profile: Profile,
        tab_id: Option<String>,
    ) -> Result<TaskId, CoreError> {
        if self.vault.is_enabled().await && !self.vault.is_unlocked().await {
            return Err(CoreError::Auth(
                "vault is locked, unlock before starting tasks".into(),
            ));
        }

        let (id, mut progress_rx) =
            self.engine.start_task(action, profile, tab_id.clone())?;

        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            while let Some(sample) = progress_rx.recv().await {
                let terminal = !matches!(sample.status, SampleStatus::Running);
                if !sample.log_messages.is_empty() {
                    events.emit(
                        "log:sync_event",
                        serde_json::json!({
                            "task_id": id.0,
                            "tab_id": tab_id.clone(),
                            "lines": sample.log_messages.clone(),
                        }),
                    );
                }
                events.emit(
                    "sync:progress",
                    serde_json::json!({
                        "task_id": id.0,
                        "tab_id": tab_id.clone(),
                        "sample": sample,
                    }),
                );
                if terminal {
                    break;
                }
            }
        });

        Ok(id)
    }

    /// Executes a board, refusing while the vault is locked.
    pub async fn execute_board(&self, board: Board) -> Result<(), CoreError> {
        if self.vault.is_enabled().await && !self.vault.is_unlocked().await {
            return Err(CoreError::Auth(
                "vault is locked, unlock before executing boards".into(),
            ));
        }
        self.boards.execute(board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::domain::task::TaskState;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.config_dir = dir.path().to_path_buf();
        config.engine.progress_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_startup_without_auth_unlocks_immediately() {
        let dir = TempDir::new().unwrap();
        let (core, mut event_rx) = Core::build(config_in(&dir));

        core.startup().await.unwrap();
        assert!(core.vault.is_unlocked().await);
        assert!(!core.vault.is_enabled().await);

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.event, "auth:unlocked");

        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_locked_vault_refuses_tasks() {
        let dir = TempDir::new().unwrap();
        let (core, _event_rx) = Core::build(config_in(&dir));
        core.startup().await.unwrap();

        core.vault.setup("hunter2").await.unwrap();
        core.vault.lock().await.unwrap();

        let result = core
            .start_task(
                ActionKind::Push,
                Profile::new(
                    dir.path().join("a").display().to_string(),
                    dir.path().join("b").display().to_string(),
                ),
                None,
            )
            .await;
        assert!(matches!(result, Err(CoreError::Auth(_))));
    }

    #[tokio::test]
    async fn test_end_to_end_local_push() {
        let dir = TempDir::new().unwrap();
        let (core, _event_rx) = Core::build(config_in(&dir));
        core.startup().await.unwrap();

        let src = dir.path().join("workdir/src");
        let dst = dir.path().join("workdir/dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("hello.txt"), b"hello world").unwrap();

        let id = core
            .start_task(
                ActionKind::Push,
                Profile::new(
                    src.display().to_string(),
                    dst.display().to_string(),
                ),
                Some("tab-1".into()),
            )
            .await
            .unwrap();

        let state = core.engine.wait_task(id).await.unwrap();
        assert_eq!(state, TaskState::Completed);
        assert_eq!(
            std::fs::read(dst.join("hello.txt")).unwrap(),
            b"hello world"
        );

        core.shutdown().await;
    }
}
