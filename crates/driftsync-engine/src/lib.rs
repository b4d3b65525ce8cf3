//! driftsync engine - per-operation transfer execution
//!
//! The task engine runs copy/move/sync/bi-sync/check/dry-run operations
//! over the filesystem abstraction with isolated per-task configuration,
//! statistics and filter contexts, cooperative cancellation, retry, and a
//! structured progress stream.
//!
//! ## Key Components
//!
//! - [`TaskEngine`] - task lifecycle (start/stop/wait/active)
//! - [`CompiledFilter`] - include/exclude/attribute rule compilation
//! - [`ProgressReporter`] - sampling loop with strict teardown ordering
//! - [`LocalBackend`] - reference backend over the local filesystem
//! - [`crypt`] - ephemeral encryption-wrapping remotes

pub mod crypt;
pub mod filter;
pub mod localfs;
pub mod progress;
pub mod retry;
pub mod task;

pub use filter::CompiledFilter;
pub use localfs::{LocalBackend, LocalFs};
pub use progress::{ProgressReporter, ReporterPhase, DEFAULT_SAMPLE_INTERVAL};
pub use task::{TaskEngine, DEFAULT_PROGRESS_CAPACITY};
