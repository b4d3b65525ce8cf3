//! Per-remote change watcher
//!
//! Wraps one endpoint's change-notification feature and collects detected
//! changes into a buffer. The buffer is drained atomically when the delta
//! engine scopes a sync; drained changes are prepended back on failure so
//! nothing is lost.
//!
//! ## Locking
//!
//! All buffer mutation is serialised by a single mutex. The initial
//! poll-interval send happens after the mutex is released: the poll channel
//! send could block inside the backend, and holding the lock across it
//! would stall every callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use driftsync_core::domain::change::{EntryKind, FileChange, RemoteKey};
use driftsync_core::ports::RemoteFs;

#[derive(Default)]
struct WatcherState {
    changes: Vec<FileChange>,
    running: bool,
    poll_tx: Option<mpsc::Sender<Duration>>,
    cancel: Option<CancellationToken>,
}

/// Collects change notifications for a single remote endpoint.
pub struct ChangeWatcher {
    remote_key: RemoteKey,
    fs: Arc<dyn RemoteFs>,
    state: Mutex<WatcherState>,
}

impl ChangeWatcher {
    /// Creates a watcher for a remote endpoint. Call
    /// [`start`](ChangeWatcher::start) to begin collecting.
    pub fn new(remote_key: RemoteKey, fs: Arc<dyn RemoteFs>) -> Arc<Self> {
        Arc::new(ChangeWatcher {
            remote_key,
            fs,
            state: Mutex::new(WatcherState::default()),
        })
    }

    pub fn remote_key(&self) -> &RemoteKey {
        &self.remote_key
    }

    /// Begins change-notification polling.
    ///
    /// The watcher owns its cancellation token, so a stopped watcher can be
    /// replaced by a fresh one at any time. No-op when already running or
    /// when the backend lacks the feature.
    pub fn start(self: &Arc<Self>, poll_interval: Duration) {
        let poll_tx = {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return;
            }

            if !self.fs.features().change_notify {
                debug!(
                    remote = %self.remote_key,
                    "Change notification not supported, watcher not started"
                );
                return;
            }

            let cancel = CancellationToken::new();
            let (poll_tx, poll_rx) = mpsc::channel::<Duration>(1);

            state.changes.clear();
            state.running = true;
            state.poll_tx = Some(poll_tx.clone());
            state.cancel = Some(cancel.clone());

            // The backend spawns its own worker and returns immediately.
            let watcher = Arc::clone(self);
            let callback: driftsync_core::ports::ChangeCallback =
                Arc::new(move |path: &str, entry: EntryKind| {
                    watcher.on_change(path, entry);
                });
            self.fs.change_notify(cancel, callback, poll_rx);

            poll_tx
        };

        // Send the initial poll interval outside the mutex. The channel is
        // fresh with capacity 1, so the send cannot fail.
        let _ = poll_tx.try_send(poll_interval);

        info!(
            remote = %self.remote_key,
            poll_secs = poll_interval.as_secs(),
            "Change watcher started"
        );
    }

    /// Callback invoked by the backend for each detected change.
    ///
    /// The notification API does not distinguish create from modify, so
    /// everything is recorded as `Modified`.
    fn on_change(&self, path: &str, entry: EntryKind) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        state.changes.push(FileChange::modified(path, entry));
    }

    /// True if any changes have been collected since the last drain.
    pub fn has_changes(&self) -> bool {
        !self.state.lock().unwrap().changes.is_empty()
    }

    /// Returns and clears all collected changes atomically.
    pub fn drain_changes(&self) -> Vec<FileChange> {
        std::mem::take(&mut self.state.lock().unwrap().changes)
    }

    /// Prepends previously drained changes back into the buffer.
    ///
    /// Restored changes sort before anything collected since the drain, so
    /// no event is silently overwritten.
    pub fn restore_changes(&self, changes: Vec<FileChange>) {
        if changes.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let newer = std::mem::take(&mut state.changes);
        state.changes = changes;
        state.changes.extend(newer);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Stops the watcher: closes the poll channel and cancels the backend
    /// worker. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        state.running = false;

        // Dropping the sender closes the poll channel, which signals the
        // backend worker to exit.
        state.poll_tx = None;

        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }

        info!(remote = %self.remote_key, "Change watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::ports::{ChangeCallback, FsFeatures};

    /// Fake endpoint that hands the registered callback back to the test.
    struct FakeFs {
        notify: bool,
        callback: Mutex<Option<ChangeCallback>>,
        poll_rx: Mutex<Option<mpsc::Receiver<Duration>>>,
    }

    impl FakeFs {
        fn new(notify: bool) -> Arc<Self> {
            Arc::new(FakeFs {
                notify,
                callback: Mutex::new(None),
                poll_rx: Mutex::new(None),
            })
        }

        fn fire(&self, path: &str, entry: EntryKind) {
            let cb = self.callback.lock().unwrap();
            if let Some(cb) = cb.as_ref() {
                cb(path, entry);
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
            poll_rx: mpsc::Receiver<Duration>,
        ) {
            *self.callback.lock().unwrap() = Some(callback);
            *self.poll_rx.lock().unwrap() = Some(poll_rx);
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn key() -> RemoteKey {
        RemoteKey::from_location("fake:/")
    }

    #[test]
    fn test_start_without_feature_stays_stopped() {
        let fs = FakeFs::new(false);
        let watcher = ChangeWatcher::new(key(), fs);
        watcher.start(Duration::from_secs(60));
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_collects_and_drains_changes() {
        let fs = FakeFs::new(true);
        let watcher = ChangeWatcher::new(key(), Arc::clone(&fs) as Arc<dyn RemoteFs>);
        watcher.start(Duration::from_secs(60));
        assert!(watcher.is_running());

        fs.fire("a.txt", EntryKind::Object);
        fs.fire("docs", EntryKind::Directory);
        assert!(watcher.has_changes());

        let drained = watcher.drain_changes();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].path, "a.txt");
        assert!(!watcher.has_changes());
        assert!(watcher.drain_changes().is_empty());
    }

    #[test]
    fn test_restore_prepends_before_newer_events() {
        let fs = FakeFs::new(true);
        let watcher = ChangeWatcher::new(key(), Arc::clone(&fs) as Arc<dyn RemoteFs>);
        watcher.start(Duration::from_secs(60));

        fs.fire("old.txt", EntryKind::Object);
        let drained = watcher.drain_changes();

        // A new event arrives while the drained set is in flight
        fs.fire("new.txt", EntryKind::Object);
        watcher.restore_changes(drained);

        let all = watcher.drain_changes();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "old.txt");
        assert_eq!(all[1].path, "new.txt");
    }

    #[test]
    fn test_stop_is_idempotent_and_mutes_callbacks() {
        let fs = FakeFs::new(true);
        let watcher = ChangeWatcher::new(key(), Arc::clone(&fs) as Arc<dyn RemoteFs>);
        watcher.start(Duration::from_secs(60));

        watcher.stop();
        watcher.stop();
        assert!(!watcher.is_running());

        // Late callback after stop must not be recorded
        fs.fire("late.txt", EntryKind::Object);
        assert!(!watcher.has_changes());
    }

    #[test]
    fn test_start_twice_is_noop() {
        let fs = FakeFs::new(true);
        let watcher = ChangeWatcher::new(key(), Arc::clone(&fs) as Arc<dyn RemoteFs>);
        let cancel = CancellationToken::new();
        watcher.start(Duration::from_secs(60));
        fs.fire("a.txt", EntryKind::Object);
        watcher.start(Duration::from_secs(60));
        // A second start must not clear the buffer
        assert!(watcher.has_changes());
    }

    #[test]
    fn test_initial_poll_interval_delivered() {
        let fs = FakeFs::new(true);
        let watcher = ChangeWatcher::new(key(), Arc::clone(&fs) as Arc<dyn RemoteFs>);
        watcher.start(Duration::from_secs(30));

        // The interval is sent after change_notify returns; the backend's
        // worker reads it from the poll channel.
        let mut rx = fs.poll_rx.lock().unwrap().take().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Duration::from_secs(30));
    }
}
