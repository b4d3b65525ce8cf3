//! Delta sync policy engine
//!
//! Manages the watcher per remote key and decides, at each sync request,
//! between three outcomes:
//!
//! 1. **Skip** — both sides report zero changes and neither violates the
//!    consecutive-delta or full-sync-age caps.
//! 2. **Scoped delta** — the source has changes below the fallback cap; the
//!    sync runs with a filter narrowed to exactly those paths.
//! 3. **Full sync** — everything else; on success the baseline is reset and
//!    watchers are (re)started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use driftsync_core::domain::change::{ChangeSet, FileChange, RemoteKey};
use driftsync_core::ports::{DeltaStateStore, RemoteFs};
use driftsync_core::CoreError;

use crate::watcher::ChangeWatcher;

/// Forces a full sync after this many consecutive delta syncs.
pub const MAX_DELTA_SYNCS_BEFORE_FULL_SYNC: u32 = 50;

/// Forces a full sync after this long since the last one.
pub const MAX_TIME_BETWEEN_FULL_SYNCS: Duration = Duration::from_secs(24 * 60 * 60);

/// Default change-notification poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Above this many buffered changes a scoped delta falls back to full sync.
pub const MAX_CHANGES_BEFORE_FALLBACK: usize = 5000;

/// Manages delta watchers for all configured remotes.
pub struct DeltaService {
    store: Arc<dyn DeltaStateStore>,
    watchers: RwLock<HashMap<RemoteKey, Arc<ChangeWatcher>>>,
    poll_interval: Duration,
}

/// Provider tag for a filesystem, or `"none"` when it cannot notify.
fn provider_tag(fs: &Arc<dyn RemoteFs>) -> String {
    let features = fs.features();
    if features.change_notify {
        features.provider
    } else {
        "none".to_string()
    }
}

impl DeltaService {
    pub fn new(store: Arc<dyn DeltaStateStore>) -> Self {
        Self::with_poll_interval(store, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(store: Arc<dyn DeltaStateStore>, poll_interval: Duration) -> Self {
        DeltaService {
            store,
            watchers: RwLock::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Starts a watcher for the remote if the backend supports change
    /// notification and none is already running. Called after each
    /// successful full sync.
    pub async fn ensure_watcher(
        &self,
        fs: Arc<dyn RemoteFs>,
        key: &RemoteKey,
    ) -> Result<(), CoreError> {
        if provider_tag(&fs) == "none" {
            return Ok(());
        }

        let mut watchers = self.watchers.write().await;

        if let Some(existing) = watchers.get(key) {
            if existing.is_running() {
                return Ok(());
            }
        }

        let watcher = ChangeWatcher::new(key.clone(), fs);
        watcher.start(self.poll_interval);
        watchers.insert(key.clone(), watcher);
        drop(watchers);

        if let Err(e) = self.store.set_watching(key, true).await {
            warn!(remote = %key, error = %e, "Failed to persist watching state");
        }

        Ok(())
    }

    /// True when the watcher for this key reports zero changes and the
    /// periodic full-sync requirements are satisfied. False means the caller
    /// must run a sync (scoped or full).
    pub async fn should_skip_sync(&self, key: &RemoteKey) -> bool {
        let watcher = {
            let watchers = self.watchers.read().await;
            watchers.get(key).cloned()
        };

        // No watcher → cannot determine, do a full sync
        let Some(watcher) = watcher else {
            return false;
        };
        if !watcher.is_running() {
            return false;
        }

        let state = match self.store.get_state(key).await {
            Ok(Some(state)) => state,
            _ => return false,
        };

        if state.delta_count >= MAX_DELTA_SYNCS_BEFORE_FULL_SYNC {
            info!(
                remote = %key,
                delta_count = state.delta_count,
                "Forcing full sync after too many consecutive delta syncs"
            );
            return false;
        }

        if let Some(last_full) = state.last_full_sync {
            let age = Utc::now().signed_duration_since(last_full);
            if age.to_std().unwrap_or(Duration::ZERO) > MAX_TIME_BETWEEN_FULL_SYNCS {
                info!(
                    remote = %key,
                    age_hours = age.num_hours(),
                    "Forcing full sync, too long since last full sync"
                );
                return false;
            }
        }

        !watcher.has_changes()
    }

    /// Drains changes from the watcher for filter scoping.
    ///
    /// Returns `None` when no watcher is running for the key.
    pub async fn get_changes(&self, key: &RemoteKey) -> Option<ChangeSet> {
        let watchers = self.watchers.read().await;
        let watcher = watchers.get(key)?;
        if !watcher.is_running() {
            return None;
        }

        Some(ChangeSet {
            remote_key: Some(key.clone()),
            changes: watcher.drain_changes(),
        })
    }

    /// Puts previously drained changes back into the watcher buffer so a
    /// failed scoped sync does not lose them.
    pub async fn restore_changes(&self, key: &RemoteKey, changes: Vec<FileChange>) {
        let watchers = self.watchers.read().await;
        if let Some(watcher) = watchers.get(key) {
            if watcher.is_running() {
                watcher.restore_changes(changes);
            }
        }
    }

    /// Records a successful delta sync (increments the counter).
    pub async fn commit_delta(&self, key: &RemoteKey) -> Result<(), CoreError> {
        self.store.increment_delta_count(key).await
    }

    /// Records a full sync completion and ensures a watcher is running.
    pub async fn commit_full_sync(
        &self,
        fs: Arc<dyn RemoteFs>,
        key: &RemoteKey,
    ) -> Result<(), CoreError> {
        let provider = provider_tag(&fs);
        let mut is_watching = false;

        if provider != "none" {
            match self.ensure_watcher(Arc::clone(&fs), key).await {
                Ok(()) => is_watching = true,
                Err(e) => {
                    warn!(remote = %key, error = %e, "Failed to start watcher");
                }
            }
        }

        self.store.record_full_sync(key, &provider, is_watching).await
    }

    /// Stops every watcher and persists `is_watching = false`. Safe to call
    /// during shutdown while tasks are still terminating; idempotent.
    pub async fn stop_all(&self) {
        let mut watchers = self.watchers.write().await;
        for (key, watcher) in watchers.drain() {
            watcher.stop();
            if let Err(e) = self.store.set_watching(&key, false).await {
                warn!(remote = %key, error = %e, "Failed to persist watching state on stop");
            }
        }
        info!("All change watchers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    use driftsync_core::domain::change::{DeltaState, EntryKind};
    use driftsync_core::ports::{ChangeCallback, FsFeatures};
    use tokio::sync::mpsc;

    struct FakeFs {
        notify: bool,
        callback: StdMutex<Option<ChangeCallback>>,
    }

    impl FakeFs {
        fn new(notify: bool) -> Arc<Self> {
            Arc::new(FakeFs {
                notify,
                callback: StdMutex::new(None),
            })
        }

        fn fire(&self, path: &str) {
            if let Some(cb) = self.callback.lock().unwrap().as_ref() {
                cb(path, EntryKind::Object);
            }
        }
    }

    impl RemoteFs for FakeFs {
        fn location(&self) -> &str {
            "fake:/"
        }

        fn features(&self) -> FsFeatures {
            FsFeatures {
                change_notify: self.notify,
                provider: if self.notify { "fake".into() } else { "none".into() },
            }
        }

        fn change_notify(
            &self,
            _cancel: CancellationToken,
            callback: ChangeCallback,
            _poll_rx: mpsc::Receiver<Duration>,
        ) {
            *self.callback.lock().unwrap() = Some(callback);
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// In-memory DeltaStateStore for policy tests.
    #[derive(Default)]
    struct MemoryStore {
        states: StdMutex<HashMap<String, DeltaState>>,
    }

    #[async_trait]
    impl DeltaStateStore for MemoryStore {
        async fn get_state(&self, key: &RemoteKey) -> Result<Option<DeltaState>, CoreError> {
            Ok(self.states.lock().unwrap().get(key.as_str()).cloned())
        }

        async fn record_full_sync(
            &self,
            key: &RemoteKey,
            provider: &str,
            is_watching: bool,
        ) -> Result<(), CoreError> {
            self.states.lock().unwrap().insert(
                key.as_str().to_string(),
                DeltaState {
                    remote_key: key.clone(),
                    provider: provider.to_string(),
                    is_watching,
                    last_full_sync: Some(Utc::now()),
                    delta_count: 0,
                },
            );
            Ok(())
        }

        async fn increment_delta_count(&self, key: &RemoteKey) -> Result<(), CoreError> {
            if let Some(state) = self.states.lock().unwrap().get_mut(key.as_str()) {
                state.delta_count += 1;
            }
            Ok(())
        }

        async fn set_watching(&self, key: &RemoteKey, watching: bool) -> Result<(), CoreError> {
            if let Some(state) = self.states.lock().unwrap().get_mut(key.as_str()) {
                state.is_watching = watching;
            }
            Ok(())
        }
    }

    impl MemoryStore {
        fn seed(&self, key: &RemoteKey, delta_count: u32, last_full_age: ChronoDuration) {
            self.states.lock().unwrap().insert(
                key.as_str().to_string(),
                DeltaState {
                    remote_key: key.clone(),
                    provider: "fake".into(),
                    is_watching: true,
                    last_full_sync: Some(Utc::now() - last_full_age),
                    delta_count,
                },
            );
        }
    }

    fn key() -> RemoteKey {
        RemoteKey::from_location("fake:/")
    }

    #[tokio::test]
    async fn test_skip_without_watcher_is_false() {
        let service = DeltaService::new(Arc::new(MemoryStore::default()));
        assert!(!service.should_skip_sync(&key()).await);
    }

    #[tokio::test]
    async fn test_skip_when_quiet_and_within_caps() {
        let store = Arc::new(MemoryStore::default());
        store.seed(&key(), 10, ChronoDuration::hours(1));
        let service = DeltaService::new(store);

        let fs = FakeFs::new(true);
        service
            .ensure_watcher(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        assert!(service.should_skip_sync(&key()).await);

        // A buffered change flips the decision
        fs.fire("notes.md");
        assert!(!service.should_skip_sync(&key()).await);
    }

    #[tokio::test]
    async fn test_delta_count_cap_forces_full_sync() {
        let store = Arc::new(MemoryStore::default());
        store.seed(&key(), MAX_DELTA_SYNCS_BEFORE_FULL_SYNC - 1, ChronoDuration::hours(1));
        let service = DeltaService::new(Arc::clone(&store) as Arc<dyn DeltaStateStore>);

        let fs = FakeFs::new(true);
        service
            .ensure_watcher(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        // 49 consecutive deltas: still skippable
        assert!(service.should_skip_sync(&key()).await);

        // The 50th forces a full sync
        store.seed(&key(), MAX_DELTA_SYNCS_BEFORE_FULL_SYNC, ChronoDuration::hours(1));
        assert!(!service.should_skip_sync(&key()).await);
    }

    #[tokio::test]
    async fn test_stale_baseline_forces_full_sync() {
        let store = Arc::new(MemoryStore::default());
        store.seed(&key(), 0, ChronoDuration::hours(25));
        let service = DeltaService::new(store);

        let fs = FakeFs::new(true);
        service
            .ensure_watcher(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        assert!(!service.should_skip_sync(&key()).await);
    }

    #[tokio::test]
    async fn test_commit_full_sync_resets_counter_and_starts_watcher() {
        let store = Arc::new(MemoryStore::default());
        store.seed(&key(), 12, ChronoDuration::hours(1));
        let service = DeltaService::new(Arc::clone(&store) as Arc<dyn DeltaStateStore>);

        let fs = FakeFs::new(true);
        service
            .commit_full_sync(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert_eq!(state.delta_count, 0);
        assert!(state.is_watching);
        assert!(service.get_changes(&key()).await.is_some());
    }

    #[tokio::test]
    async fn test_commit_full_sync_without_feature_records_none() {
        let store = Arc::new(MemoryStore::default());
        let service = DeltaService::new(Arc::clone(&store) as Arc<dyn DeltaStateStore>);

        let fs = FakeFs::new(false);
        service
            .commit_full_sync(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert_eq!(state.provider, "none");
        assert!(!state.is_watching);
        assert!(service.get_changes(&key()).await.is_none());
    }

    #[tokio::test]
    async fn test_restore_after_failed_scoped_sync() {
        let store = Arc::new(MemoryStore::default());
        store.seed(&key(), 0, ChronoDuration::hours(1));
        let service = DeltaService::new(store);

        let fs = FakeFs::new(true);
        service
            .ensure_watcher(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        fs.fire("notes.md");
        let set = service.get_changes(&key()).await.unwrap();
        assert_eq!(set.changes.len(), 1);

        // Scoped sync fails; the drained changes go back
        service.restore_changes(&key(), set.changes).await;
        let set = service.get_changes(&key()).await.unwrap();
        assert_eq!(set.changes.len(), 1);
        assert_eq!(set.changes[0].path, "notes.md");
    }

    #[tokio::test]
    async fn test_stop_all_then_ensure_restarts_cleanly() {
        let store = Arc::new(MemoryStore::default());
        store.seed(&key(), 0, ChronoDuration::hours(1));
        let service = DeltaService::new(Arc::clone(&store) as Arc<dyn DeltaStateStore>);

        let fs = FakeFs::new(true);
        service
            .ensure_watcher(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();

        service.stop_all().await;
        service.stop_all().await; // idempotent
        assert!(!store.get_state(&key()).await.unwrap().unwrap().is_watching);
        assert!(!service.should_skip_sync(&key()).await);

        service
            .ensure_watcher(Arc::clone(&fs) as Arc<dyn RemoteFs>, &key())
            .await
            .unwrap();
        assert!(service.should_skip_sync(&key()).await);
    }
}
