//! Task engine
//!
//! Runs one transfer per task on a detached worker with isolated
//! configuration, statistics and filter context. Tasks are cooperatively
//! cancellable, retried per profile policy, and stream
//! [`ProgressSample`](driftsync_core::domain::progress::ProgressSample)
//! values over a bounded channel owned by the caller.
//!
//! For push/pull the engine consults the delta service before transferring:
//! the sync may be skipped outright, scoped to watcher-reported paths, or
//! run in full (which re-establishes the delta baseline).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use driftsync_core::domain::change::{FileChange, RemoteKey};
use driftsync_core::domain::profile::{parse_size, Profile};
use driftsync_core::domain::progress::{ProgressSample, SampleStatus};
use driftsync_core::domain::task::{ActionKind, TaskId, TaskIdGenerator, TaskInfo, TaskState};
use driftsync_core::events::EventSink;
use driftsync_core::ports::{
    BisyncOptions, CredentialsStore, HistoryEntry, HistorySink, LogBuffer, TransferBackend,
    TransferContext, TransferOptions,
};
use driftsync_core::stats::TaskStats;
use driftsync_core::CoreError;
use driftsync_delta::{DeltaService, MAX_CHANGES_BEFORE_FALLBACK};

use crate::crypt;
use crate::filter::CompiledFilter;
use crate::progress::{ProgressReporter, DEFAULT_SAMPLE_INTERVAL};
use crate::retry::with_retry;

/// Default bounded progress channel capacity per task.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 64;

struct TaskHandle {
    action: ActionKind,
    tab_id: Option<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<TaskState>,
    last_error: Arc<StdMutex<Option<String>>>,
}

/// Executes transfers as cancellable background tasks.
pub struct TaskEngine {
    backend: Arc<dyn TransferBackend>,
    credentials: Arc<dyn CredentialsStore>,
    delta: Option<Arc<DeltaService>>,
    history: Option<Arc<dyn HistorySink>>,
    events: Arc<dyn EventSink>,
    ids: TaskIdGenerator,
    tasks: DashMap<TaskId, TaskHandle>,
    sample_interval: Duration,
    progress_capacity: usize,
}

impl TaskEngine {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        credentials: Arc<dyn CredentialsStore>,
        delta: Option<Arc<DeltaService>>,
        history: Option<Arc<dyn HistorySink>>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(TaskEngine {
            backend,
            credentials,
            delta,
            history,
            events,
            ids: TaskIdGenerator::new(),
            tasks: DashMap::new(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        })
    }

    /// Overrides the sampling interval and progress channel capacity.
    pub fn with_tuning(
        mut self: Arc<Self>,
        sample_interval: Duration,
        progress_capacity: usize,
    ) -> Arc<Self> {
        let engine = Arc::get_mut(&mut self)
            .expect("with_tuning must be called before the engine is shared");
        engine.sample_interval = sample_interval;
        engine.progress_capacity = progress_capacity.max(1);
        self
    }

    /// Sweeps orphaned ephemeral crypt remotes left over from crashes.
    /// Called once at startup.
    pub async fn sweep_orphaned_crypt_remotes(&self) -> usize {
        crypt::cleanup_orphaned_remotes(&self.credentials).await
    }

    /// Creates a task and begins execution on a detached worker.
    ///
    /// Returns the task id and the receiving half of the bounded progress
    /// channel. The channel is owned by the caller; the engine never closes
    /// it early and drops samples when it is full.
    pub fn start_task(
        self: &Arc<Self>,
        action: ActionKind,
        profile: Profile,
        tab_id: Option<String>,
    ) -> Result<(TaskId, mpsc::Receiver<ProgressSample>), CoreError> {
        profile.validate()?;

        let id = self.ids.next_id();
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = mpsc::channel(self.progress_capacity);
        let (state_tx, state_rx) = watch::channel(TaskState::Running);
        let last_error = Arc::new(StdMutex::new(None));

        self.tasks.insert(
            id,
            TaskHandle {
                action,
                tab_id: tab_id.clone(),
                started_at: Utc::now(),
                cancel: cancel.clone(),
                state_rx,
                last_error: Arc::clone(&last_error),
            },
        );

        self.events.emit(
            "sync:started",
            serde_json::json!({
                "task_id": id.0,
                "action": action.as_str(),
                "tab_id": tab_id.clone(),
            }),
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = engine
                .run_task(id, action, profile, progress_tx, cancel.clone())
                .await;

            let (state, err_msg) = match outcome {
                Ok(()) => (TaskState::Completed, None),
                Err(CoreError::Cancelled) => (TaskState::Cancelled, None),
                Err(e) if cancel.is_cancelled() => {
                    info!(task = %id, error = %e, "Task unwound after cancellation");
                    (TaskState::Cancelled, None)
                }
                Err(e) => (TaskState::Failed, Some(e.to_string())),
            };

            *last_error.lock().unwrap() = err_msg.clone();

            let event = match state {
                TaskState::Completed => "sync:completed",
                TaskState::Cancelled => "sync:cancelled",
                _ => "sync:failed",
            };
            engine.events.emit(
                event,
                serde_json::json!({
                    "task_id": id.0,
                    "action": action.as_str(),
                    "tab_id": tab_id.clone(),
                    "error": err_msg.clone(),
                }),
            );
            if let Some(message) = &err_msg {
                engine.events.emit(
                    "error:occurred",
                    driftsync_core::events::error_payload(
                        "FILESYSTEM",
                        message,
                        None,
                        tab_id.as_deref(),
                    ),
                );
            }

            let _ = state_tx.send(state);
        });

        Ok((id, progress_rx))
    }

    /// Requests cooperative cancellation of a task.
    pub fn stop_task(&self, id: TaskId) -> Result<(), CoreError> {
        let handle = self
            .tasks
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(format!("unknown task {id}")))?;
        handle.cancel.cancel();
        info!(task = %id, "Cancellation requested");
        Ok(())
    }

    /// Blocks until the task reaches a terminal state.
    pub async fn wait_task(&self, id: TaskId) -> Result<TaskState, CoreError> {
        let mut state_rx = {
            let handle = self
                .tasks
                .get(&id)
                .ok_or_else(|| CoreError::NotFound(format!("unknown task {id}")))?;
            handle.state_rx.clone()
        };

        loop {
            let state = *state_rx.borrow();
            if state.is_terminal() {
                return Ok(state);
            }
            if state_rx.changed().await.is_err() {
                return Ok(*state_rx.borrow());
            }
        }
    }

    /// Snapshot of all tracked tasks.
    pub fn active_tasks(&self) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .map(|entry| {
                let handle = entry.value();
                TaskInfo {
                    id: *entry.key(),
                    action: handle.action,
                    tab_id: handle.tab_id.clone(),
                    started_at: handle.started_at,
                    state: *handle.state_rx.borrow(),
                    last_error: handle.last_error.lock().unwrap().clone(),
                }
            })
            .collect()
    }

    /// Releases a terminal task's bookkeeping.
    pub fn remove_task(&self, id: TaskId) -> Result<(), CoreError> {
        let terminal = {
            let handle = self
                .tasks
                .get(&id)
                .ok_or_else(|| CoreError::NotFound(format!("unknown task {id}")))?;
            let is_terminal = handle.state_rx.borrow().is_terminal();
            is_terminal
        };
        if !terminal {
            return Err(CoreError::Validation(format!(
                "task {id} is still running"
            )));
        }
        self.tasks.remove(&id);
        Ok(())
    }

    // -- worker --------------------------------------------------------

    async fn run_task(
        &self,
        id: TaskId,
        action: ActionKind,
        mut profile: Profile,
        progress_tx: mpsc::Sender<ProgressSample>,
        cancel: CancellationToken,
    ) -> Result<(), CoreError> {
        let started_at = Utc::now();

        // Pull is push with the endpoints swapped
        if action == ActionKind::Pull {
            std::mem::swap(&mut profile.source, &mut profile.destination);
        }

        // Delta keys come from the real locations, before crypt wrapping
        // rewrites them to ephemeral remotes
        let src_location = profile.source.clone();
        let dst_location = profile.destination.clone();
        let src_key = RemoteKey::from_location(&src_location);
        let dst_key = RemoteKey::from_location(&dst_location);

        let cleanup =
            crypt::apply_crypt_wrapping(Arc::clone(&self.credentials), &mut profile).await?;

        let result = self
            .run_transfer(
                id,
                action,
                &profile,
                &src_location,
                &dst_location,
                &src_key,
                &dst_key,
                progress_tx,
                &cancel,
                started_at,
            )
            .await;

        // The ephemeral remotes go away on every exit path
        cleanup.run().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        id: TaskId,
        action: ActionKind,
        profile: &Profile,
        src_location: &str,
        dst_location: &str,
        src_key: &RemoteKey,
        dst_key: &RemoteKey,
        progress_tx: mpsc::Sender<ProgressSample>,
        cancel: &CancellationToken,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), CoreError> {
        let delta = self.delta.as_ref().filter(|_| action.uses_delta());

        // Delta skip: both sides quiet and within the periodic caps
        if let Some(delta) = delta {
            if delta.should_skip_sync(src_key).await && delta.should_skip_sync(dst_key).await {
                info!(task = %id, "No changes on either side, skipping sync");
                let _ = progress_tx.try_send(ProgressSample::delta_skip());
                let _ = delta.commit_delta(src_key).await;
                let _ = delta.commit_delta(dst_key).await;
                self.record_history(id, action, profile, TaskState::Completed, None, started_at, 0, 0)
                    .await;
                return Ok(());
            }
        }

        // Scoped delta: narrow the filter to the drained changes
        let mut scoped_changes: Option<Vec<FileChange>> = None;
        let base_filter = CompiledFilter::from_profile(profile)?;
        let filter: Arc<CompiledFilter> = if let Some(delta) = delta {
            match delta.get_changes(src_key).await {
                Some(set) if should_scope(set.changes.len()) => {
                    info!(
                        task = %id,
                        changed = set.changes.len(),
                        "Scoping sync to watcher-reported paths"
                    );
                    let scoped = CompiledFilter::scoped_to_changes(&set.changes)?;
                    scoped_changes = Some(set.changes);
                    Arc::new(scoped)
                }
                _ => Arc::new(base_filter),
            }
        } else {
            Arc::new(base_filter)
        };
        let used_delta = scoped_changes.is_some();

        // Per-task context: options, stats group, log capture, cancellation
        let mut options = derive_options(profile)?;
        if action == ActionKind::DryRun {
            options.dry_run = true;
        }
        let stats = Arc::new(TaskStats::new());
        let logs = Arc::new(LogBuffer::new());
        let ctx = TransferContext {
            options,
            filter,
            stats: Arc::clone(&stats),
            logs: Arc::clone(&logs),
            cancel: cancel.clone(),
        };

        let reporter = ProgressReporter::start(
            Arc::clone(&stats),
            Arc::clone(&logs),
            progress_tx,
            self.sample_interval,
        );

        let transfer_result = self.dispatch(action, profile, &ctx, cancel).await;

        // Commit or restore delta state based on the transfer outcome
        if let Some(delta) = delta {
            match &transfer_result {
                Ok(()) => {
                    if used_delta {
                        let _ = delta.commit_delta(src_key).await;
                        let _ = delta.commit_delta(dst_key).await;
                    } else {
                        // Full sync: new baseline on both sides, watchers up
                        for (location, key) in
                            [(src_location, src_key), (dst_location, dst_key)]
                        {
                            match self.backend.new_fs(location).await {
                                Ok(fs) => {
                                    let _ = delta.commit_full_sync(fs, key).await;
                                }
                                Err(e) => {
                                    warn!(task = %id, location, error = %e,
                                        "Could not resolve endpoint for delta baseline");
                                }
                            }
                        }
                    }
                }
                Err(_) => {
                    if let Some(changes) = scoped_changes.take() {
                        warn!(
                            task = %id,
                            restored = changes.len(),
                            "Scoped sync failed, restoring drained changes"
                        );
                        delta.restore_changes(src_key, changes).await;
                    }
                }
            }
        }

        // Failure semantics: completed iff the transfer call succeeded AND
        // the error counter is zero after retries
        let snapshot = stats.snapshot();
        let outcome = match &transfer_result {
            Ok(()) if snapshot.errors == 0 => Ok(()),
            Ok(()) => Err(CoreError::Filesystem {
                message: snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("{} file(s) failed", snapshot.errors)),
                transient: false,
            }),
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(e) if cancel.is_cancelled() => {
                info!(task = %id, error = %e, "Transfer unwound after cancellation");
                Err(CoreError::Cancelled)
            }
            Err(e) => Err(CoreError::Filesystem {
                message: wrap_transfer_error(action, src_location, dst_location, e),
                transient: false,
            }),
        };

        let status = match &outcome {
            Ok(()) => SampleStatus::Completed,
            Err(CoreError::Cancelled) => SampleStatus::Cancelled,
            Err(_) => SampleStatus::Failed,
        };
        reporter.finish(status, false, used_delta).await;

        let state = match &outcome {
            Ok(()) => TaskState::Completed,
            Err(CoreError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        self.record_history(
            id,
            action,
            profile,
            state,
            outcome.as_ref().err().map(|e| e.to_string()),
            started_at,
            snapshot.bytes,
            snapshot.transfers,
        )
        .await;

        outcome
    }

    /// Maps the action kind onto the backend operation, wrapped in retry.
    async fn dispatch(
        &self,
        action: ActionKind,
        profile: &Profile,
        ctx: &TransferContext,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let src = self.backend.new_fs(&profile.source).await?;
        let dst = self.backend.new_fs(&profile.destination).await?;
        let sleep = Duration::from_secs(profile.retries_sleep as u64);

        match action {
            ActionKind::Pull | ActionKind::Push | ActionKind::DryRun => {
                with_retry(action.as_str(), profile.retries, sleep, cancel, || {
                    self.backend.sync(ctx, Arc::clone(&dst), Arc::clone(&src))
                })
                .await
            }
            ActionKind::Copy => {
                with_retry("copy", profile.retries, sleep, cancel, || {
                    self.backend.copy(ctx, Arc::clone(&dst), Arc::clone(&src))
                })
                .await
            }
            ActionKind::Move => {
                with_retry("move", profile.retries, sleep, cancel, || {
                    self.backend
                        .move_to(ctx, Arc::clone(&dst), Arc::clone(&src))
                })
                .await
            }
            ActionKind::Check => {
                with_retry("check", profile.retries, sleep, cancel, || {
                    self.backend.check(ctx, Arc::clone(&dst), Arc::clone(&src))
                })
                .await
            }
            ActionKind::Bi | ActionKind::BiResync => {
                let opts = BisyncOptions {
                    resync: action == ActionKind::BiResync,
                    conflict_resolve: profile.conflict_resolve,
                    conflict_loser: profile.conflict_loser,
                    conflict_suffix: profile.conflict_suffix.clone(),
                    max_lock: (profile.max_lock > 0)
                        .then(|| Duration::from_secs(profile.max_lock as u64)),
                };
                with_retry("bisync", profile.retries, sleep, cancel, || {
                    self.backend
                        .bisync(ctx, Arc::clone(&src), Arc::clone(&dst), &opts)
                })
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_history(
        &self,
        id: TaskId,
        action: ActionKind,
        profile: &Profile,
        state: TaskState,
        error: Option<String>,
        started_at: chrono::DateTime<chrono::Utc>,
        bytes: u64,
        files: u64,
    ) {
        let Some(history) = &self.history else {
            return;
        };
        let entry = HistoryEntry {
            task_id: id.0,
            action,
            source: profile.source.clone(),
            destination: profile.destination.clone(),
            state,
            error,
            bytes_transferred: bytes,
            files_transferred: files,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = history.record(entry).await {
            error!(task = %id, error = %e, "Failed to record task history");
        }
    }
}

/// Whether a drained change set is small enough for a scoped delta sync.
/// At or above the fallback cap the sync runs in full instead.
fn should_scope(change_count: usize) -> bool {
    change_count > 0 && change_count < MAX_CHANGES_BEFORE_FALLBACK
}

/// Derives per-task transfer options from the profile.
///
/// Checkers scale to twice the transfer count when parallelism is set; the
/// bandwidth cap is `<N>M` bytes per second.
fn derive_options(profile: &Profile) -> Result<TransferOptions, CoreError> {
    let mut options = TransferOptions::default();

    if profile.parallel > 0 {
        options.transfers = profile.parallel;
        options.checkers = profile.parallel * 2;
    }
    if profile.bandwidth > 0 {
        options.bandwidth_limit = parse_size(&format!("{}M", profile.bandwidth))?;
    }
    if profile.conn_timeout > 0 {
        options.conn_timeout = Some(Duration::from_secs(profile.conn_timeout as u64));
    }
    if profile.io_timeout > 0 {
        options.io_timeout = Some(Duration::from_secs(profile.io_timeout as u64));
    }
    options.low_level_retries = profile.low_level_retries;
    options.tps_limit = profile.tps_limit;
    if let Some(expr) = profile.buffer_size.as_deref().filter(|e| !e.is_empty()) {
        options.buffer_size = parse_size(expr)?;
    }
    options.multi_thread_streams = profile.multi_thread_streams;
    options.order_by = profile.order_by.clone();
    options.delete_timing = profile.delete_timing;
    options.immutable = profile.immutable;
    options.max_delete = profile.max_delete;
    if let Some(expr) = profile.max_delete_size.as_deref().filter(|e| !e.is_empty()) {
        options.max_delete_size = parse_size(expr)?;
    }
    if let Some(expr) = profile.max_transfer.as_deref().filter(|e| !e.is_empty()) {
        options.max_transfer = parse_size(expr)?;
    }
    options.backup_suffix = profile.backup_suffix.clone();
    options.suffix_keep_extension = profile.suffix_keep_extension;
    options.dry_run = profile.dry_run;

    Ok(options)
}

/// Wraps a backend error with the operation and endpoints for display.
fn wrap_transfer_error(
    action: ActionKind,
    source: &str,
    destination: &str,
    err: &CoreError,
) -> String {
    format!(
        "{} {} -> {}: {}",
        action.as_str(),
        source,
        destination,
        err
    )
}
