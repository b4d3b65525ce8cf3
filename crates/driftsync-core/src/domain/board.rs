//! Board model
//!
//! A board is a directed acyclic graph of transfers. Nodes carry a remote
//! location plus layout hints the executor ignores; each edge embeds the
//! [`Profile`](super::profile::Profile) it executes and an action kind.
//! Acyclicity is enforced at execute time, not at save time.

use serde::{Deserialize, Serialize};

use super::profile::Profile;
use super::task::ActionKind;

/// One endpoint in a board graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub remote_name: String,
    pub path: String,
    /// Canvas layout hints; the executor never reads these.
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub label: String,
}

/// A transfer between two nodes. Parallel edges are allowed and independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_node: String,
    pub target_node: String,
    pub action: ActionKind,
    pub profile: Profile,
}

/// A DAG of transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Execution status of one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// An upstream edge failed, so this edge never ran.
    Skipped,
}

impl EdgeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EdgeStatus::Pending | EdgeStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeStatus::Pending => "pending",
            EdgeStatus::Running => "running",
            EdgeStatus::Completed => "completed",
            EdgeStatus::Failed => "failed",
            EdgeStatus::Cancelled => "cancelled",
            EdgeStatus::Skipped => "skipped",
        }
    }
}
