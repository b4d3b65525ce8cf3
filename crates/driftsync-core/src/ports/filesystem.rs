//! Filesystem abstraction port (driven/secondary port)
//!
//! The orchestration core drives transfers through this interface and never
//! talks to a storage backend directly. A production adapter wraps an
//! rclone-equivalent library; the in-tree local backend implements it for
//! `local:` locations and for tests.
//!
//! ## Design Notes
//!
//! - Transfer operations live on [`TransferBackend`] and take endpoint
//!   handles, mirroring the `Sync(ctx, dst, src)` shape of the reference
//!   ecosystem.
//! - Every operation receives a [`TransferContext`] bundling the compiled
//!   filter, the per-task options, the accounting group, the log capture
//!   buffer and the cancellation token. Nothing is ambient.
//! - Adapters convert backend-native stats into the typed
//!   [`TaskStats`](crate::stats::TaskStats) group; the core never sees a
//!   heterogeneous map.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::change::EntryKind;
use crate::domain::errors::CoreError;
use crate::domain::profile::{ConflictLoser, ConflictResolve, DeleteTiming};
use crate::stats::TaskStats;

// ---------------------------------------------------------------------------
// Features / change notification
// ---------------------------------------------------------------------------

/// Optional capabilities of a remote filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsFeatures {
    /// Whether the backend can push change notifications.
    pub change_notify: bool,
    /// Provider tag (e.g. `drive`, `local`); watchers record it.
    pub provider: String,
}

/// Callback invoked by the backend for each detected change.
pub type ChangeCallback = Arc<dyn Fn(&str, EntryKind) + Send + Sync>;

// ---------------------------------------------------------------------------
// Endpoint handle
// ---------------------------------------------------------------------------

/// Handle to one resolved storage endpoint.
pub trait RemoteFs: Send + Sync {
    /// The location string this handle was resolved from.
    fn location(&self) -> &str;

    fn features(&self) -> FsFeatures;

    /// Starts change notification. The backend spawns its own worker and
    /// returns immediately; the worker exits when `cancel` fires or the poll
    /// channel closes. Must only be called when
    /// [`features().change_notify`](FsFeatures::change_notify) is true.
    fn change_notify(
        &self,
        cancel: CancellationToken,
        callback: ChangeCallback,
        poll_rx: mpsc::Receiver<Duration>,
    );

    /// Downcast support for adapters that own the concrete type.
    fn as_any(&self) -> &dyn std::any::Any;
}

// ---------------------------------------------------------------------------
// Transfer context
// ---------------------------------------------------------------------------

/// Path/attribute filter applied during listing.
///
/// Implementations compile include/exclude rules plus age/size/depth
/// predicates; rules are evaluated in order with includes taking precedence
/// over a trailing exclude-all.
pub trait PathFilter: Send + Sync {
    /// Whether a path is inside the filter scope at all.
    fn include_path(&self, path: &str, is_dir: bool) -> bool;

    /// Full predicate including size/age/depth bounds.
    fn include_entry(&self, path: &str, size: u64, age: Duration, depth: u32) -> bool;
}

/// A filter that includes everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PathFilter for AllowAll {
    fn include_path(&self, _path: &str, _is_dir: bool) -> bool {
        true
    }

    fn include_entry(&self, _path: &str, _size: u64, _age: Duration, _depth: u32) -> bool {
        true
    }
}

/// Capture buffer for backend log lines emitted while a task runs.
///
/// The progress aggregator drains it at every sample; the buffer itself is
/// unbounded between drains because samples are frequent.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Mutex<Vec<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: impl Into<String>) {
        self.lines.lock().unwrap().push(line.into());
    }

    /// Returns and clears the buffered lines atomically.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap())
    }
}

/// Per-task transfer tuning derived from the profile.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Concurrent file transfers.
    pub transfers: u32,
    /// Concurrent checkers (2× transfers when parallelism is set).
    pub checkers: u32,
    /// Bandwidth cap in bytes/s, 0 for unlimited.
    pub bandwidth_limit: u64,
    pub conn_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
    /// Low-level retries inside the backend.
    pub low_level_retries: u32,
    /// Transactions-per-second cap, 0 for unlimited.
    pub tps_limit: u32,
    /// Buffer size in bytes, 0 for the backend default.
    pub buffer_size: u64,
    /// Streams per file for multi-threaded transfers, 0 for default.
    pub multi_thread_streams: u32,
    /// Transfer ordering key, empty for none.
    pub order_by: Option<String>,
    pub delete_timing: DeleteTiming,
    pub immutable: bool,
    /// Abort when more than this many deletes would occur, 0 for unlimited.
    pub max_delete: u32,
    /// Abort when deletes exceed this many bytes, 0 for unlimited.
    pub max_delete_size: u64,
    /// Stop transferring after this many bytes, 0 for unlimited.
    pub max_transfer: u64,
    pub backup_suffix: Option<String>,
    pub suffix_keep_extension: bool,
    /// Perform all comparisons but no mutations.
    pub dry_run: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            transfers: 4,
            checkers: 8,
            bandwidth_limit: 0,
            conn_timeout: None,
            io_timeout: None,
            low_level_retries: 10,
            tps_limit: 0,
            buffer_size: 0,
            multi_thread_streams: 0,
            order_by: None,
            delete_timing: DeleteTiming::During,
            immutable: false,
            max_delete: 0,
            max_delete_size: 0,
            max_transfer: 0,
            backup_suffix: None,
            suffix_keep_extension: false,
            dry_run: false,
        }
    }
}

/// Everything a transfer operation needs, bundled per task.
pub struct TransferContext {
    pub options: TransferOptions,
    pub filter: Arc<dyn PathFilter>,
    pub stats: Arc<TaskStats>,
    pub logs: Arc<LogBuffer>,
    pub cancel: CancellationToken,
}

impl TransferContext {
    /// A context with default options and an allow-all filter.
    pub fn new(cancel: CancellationToken) -> Self {
        TransferContext {
            options: TransferOptions::default(),
            filter: Arc::new(AllowAll),
            stats: Arc::new(TaskStats::new()),
            logs: Arc::new(LogBuffer::new()),
            cancel,
        }
    }
}

// ---------------------------------------------------------------------------
// Bi-directional sync options
// ---------------------------------------------------------------------------

/// Options for bi-directional reconciliation.
#[derive(Debug, Clone)]
pub struct BisyncOptions {
    /// Discard prior state and re-establish the baseline.
    pub resync: bool,
    pub conflict_resolve: ConflictResolve,
    pub conflict_loser: ConflictLoser,
    pub conflict_suffix: Option<String>,
    /// Maximum time a peer may hold the reconciliation lock.
    pub max_lock: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Transfer backend
// ---------------------------------------------------------------------------

/// Resolves locations to endpoints and performs transfer operations.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Resolves a location string (`/local/path` or `<remote>:<subpath>`)
    /// to an endpoint handle.
    async fn new_fs(&self, location: &str) -> Result<Arc<dyn RemoteFs>, CoreError>;

    /// Clears listing and accounting caches so the next operation observes
    /// the world fresh. Called by the board executor before each edge.
    fn clear_caches(&self);

    /// One-way sync: `dst` mirrors `src`, including deletions.
    async fn sync(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError>;

    /// Copy without deletions at the destination.
    async fn copy(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError>;

    /// Copy then remove the source files.
    async fn move_to(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError>;

    /// Compare without mutating either side.
    async fn check(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError>;

    /// Bi-directional reconciliation between two peers.
    async fn bisync(
        &self,
        ctx: &TransferContext,
        path1: Arc<dyn RemoteFs>,
        path2: Arc<dyn RemoteFs>,
        opts: &BisyncOptions,
    ) -> Result<(), CoreError>;
}

// ---------------------------------------------------------------------------
// Credentials store
// ---------------------------------------------------------------------------

/// Parameters for an ephemeral encryption-wrapping remote.
#[derive(Debug, Clone)]
pub struct CryptRemoteParams {
    /// The wrapped location, e.g. `gdrive:folder/sub`.
    pub wrapped: String,
    /// Content password (cleartext; the store encodes it for its format).
    pub password: String,
    /// Optional salt password.
    pub password2: Option<String>,
    /// Filename encryption policy (`standard`, `obfuscate`, `off`).
    pub filename_encryption: String,
    pub directory_name_encryption: bool,
}

/// Access to the backend credentials file's sections.
#[async_trait]
pub trait CredentialsStore: Send + Sync {
    async fn create_crypt_remote(
        &self,
        name: &str,
        params: CryptRemoteParams,
    ) -> Result<(), CoreError>;

    async fn delete_remote(&self, name: &str) -> Result<(), CoreError>;

    /// Names of all configured sections.
    async fn list_remotes(&self) -> Result<Vec<String>, CoreError>;
}
