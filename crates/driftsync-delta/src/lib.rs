//! driftsync delta - change-notification watchers and sync-scoping policy
//!
//! Each remote endpoint that supports change notification gets one
//! [`ChangeWatcher`] buffering detected changes. The [`DeltaService`]
//! consults those buffers at every sync request and decides whether to skip
//! the sync entirely, scope it to the changed paths, or force a periodic
//! full resync.

pub mod service;
pub mod watcher;

pub use service::{
    DeltaService, DEFAULT_POLL_INTERVAL, MAX_CHANGES_BEFORE_FALLBACK,
    MAX_DELTA_SYNCS_BEFORE_FULL_SYNC, MAX_TIME_BETWEEN_FULL_SYNCS,
};
pub use watcher::ChangeWatcher;
