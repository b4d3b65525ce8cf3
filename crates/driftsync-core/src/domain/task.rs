//! Task model
//!
//! A task is a running instance of a [`Profile`](super::profile::Profile)
//! under a cancellation scope. Task ids are process-monotonic; the id
//! generator never reuses a value within a process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Monotonic generator for [`TaskId`] values.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    next: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// The operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// One-way sync with source and destination swapped.
    Pull,
    /// One-way sync: destination mirrors source.
    Push,
    /// Bi-directional reconciliation.
    Bi,
    /// Bi-directional reconciliation discarding prior state.
    BiResync,
    Copy,
    Move,
    Check,
    /// All comparisons, no mutations.
    DryRun,
}

impl ActionKind {
    /// Actions that consult the delta engine before running.
    pub fn uses_delta(&self) -> bool {
        matches!(self, ActionKind::Pull | ActionKind::Push)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Pull => "pull",
            ActionKind::Push => "push",
            ActionKind::Bi => "bi",
            ActionKind::BiResync => "bi-resync",
            ActionKind::Copy => "copy",
            ActionKind::Move => "move",
            ActionKind::Check => "check",
            ActionKind::DryRun => "dry-run",
        }
    }
}

/// Terminal and non-terminal task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of one task's identity and state, as returned by `active_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub action: ActionKind,
    /// Optional correlation with a GUI surface.
    pub tab_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub state: TaskState,
    pub last_error: Option<String>,
}
