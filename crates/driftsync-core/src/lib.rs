//! driftsync core - domain model and port definitions
//!
//! This crate contains the shared vocabulary of the orchestration core:
//! - Domain entities (Profile, Task, Board, FileChange, DeltaState)
//! - Progress sample model and the task-scoped accounting group
//! - Typed error kinds surfaced by every subsystem
//! - Port traits for the filesystem abstraction, credentials store,
//!   state repository and event sink
//! - Daemon configuration

pub mod config;
pub mod domain;
pub mod events;
pub mod ports;
pub mod stats;

pub use domain::errors::CoreError;

/// Convenience alias used throughout the orchestration core.
pub type Result<T> = std::result::Result<T, CoreError>;
