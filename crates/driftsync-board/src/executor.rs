//! Wave-based board execution
//!
//! Edges run level by level: everything inside a level executes
//! concurrently through the task engine, and the next level starts only
//! when the current one is fully terminal. A failed edge does not abort the
//! board; its downstream edges are marked skipped instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftsync_core::domain::board::{Board, Edge, EdgeStatus};
use driftsync_core::events::EventSink;
use driftsync_core::ports::TransferBackend;
use driftsync_core::CoreError;
use driftsync_engine::TaskEngine;

use crate::graph::{edge_levels, validate_board};

/// Final outcome of one board execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardOutcome {
    /// Every edge completed.
    Completed,
    /// At least one edge failed or was skipped.
    Failed,
    Cancelled,
}

struct Execution {
    statuses: StdMutex<HashMap<String, EdgeStatus>>,
    cancel: CancellationToken,
    done_rx: watch::Receiver<Option<BoardOutcome>>,
}

/// Executes boards through the task engine.
pub struct BoardExecutor {
    engine: Arc<TaskEngine>,
    backend: Arc<dyn TransferBackend>,
    events: Arc<dyn EventSink>,
    executions: DashMap<String, Arc<Execution>>,
}

impl BoardExecutor {
    pub fn new(
        engine: Arc<TaskEngine>,
        backend: Arc<dyn TransferBackend>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(BoardExecutor {
            engine,
            backend,
            events,
            executions: DashMap::new(),
        })
    }

    /// Validates the board and begins execution; returns immediately.
    pub fn execute(self: &Arc<Self>, board: Board) -> Result<(), CoreError> {
        validate_board(&board)?;
        for edge in &board.edges {
            edge.profile.validate().map_err(|e| {
                CoreError::Validation(format!("edge {}: {e}", edge.id))
            })?;
        }

        if let Some(existing) = self.executions.get(&board.id) {
            if existing.done_rx.borrow().is_none() {
                return Err(CoreError::Validation(format!(
                    "board {} is already executing",
                    board.id
                )));
            }
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let statuses: HashMap<String, EdgeStatus> = board
            .edges
            .iter()
            .map(|e| (e.id.clone(), EdgeStatus::Pending))
            .collect();

        let execution = Arc::new(Execution {
            statuses: StdMutex::new(statuses),
            cancel: cancel.clone(),
            done_rx,
        });
        self.executions.insert(board.id.clone(), Arc::clone(&execution));

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = executor.run_board(&board, &execution, cancel).await;
            executor.emit_status(&board.id, &execution, Some(outcome));
            let _ = done_tx.send(Some(outcome));
            info!(board = %board.id, ?outcome, "Board execution finished");
        });

        Ok(())
    }

    /// Requests cancellation of an in-flight execution.
    pub fn stop(&self, board_id: &str) -> Result<(), CoreError> {
        let execution = self
            .executions
            .get(board_id)
            .ok_or_else(|| CoreError::NotFound(format!("no execution for board {board_id}")))?;
        execution.cancel.cancel();
        Ok(())
    }

    /// Per-edge status snapshot of the latest execution.
    pub fn status(&self, board_id: &str) -> Result<HashMap<String, EdgeStatus>, CoreError> {
        let execution = self
            .executions
            .get(board_id)
            .ok_or_else(|| CoreError::NotFound(format!("no execution for board {board_id}")))?;
        let statuses = execution.statuses.lock().unwrap().clone();
        Ok(statuses)
    }

    /// Blocks until the latest execution of the board finishes.
    pub async fn wait(&self, board_id: &str) -> Result<BoardOutcome, CoreError> {
        let mut done_rx = {
            let execution = self.executions.get(board_id).ok_or_else(|| {
                CoreError::NotFound(format!("no execution for board {board_id}"))
            })?;
            execution.done_rx.clone()
        };
        loop {
            if let Some(outcome) = *done_rx.borrow() {
                return Ok(outcome);
            }
            if done_rx.changed().await.is_err() {
                return Err(CoreError::Internal("board supervisor vanished".into()));
            }
        }
    }

    // -- supervisor ----------------------------------------------------

    async fn run_board(
        &self,
        board: &Board,
        execution: &Execution,
        cancel: CancellationToken,
    ) -> BoardOutcome {
        let levels = edge_levels(board);

        for level in levels {
            if cancel.is_cancelled() {
                self.mark_pending_cancelled(execution);
                self.emit_status(&board.id, execution, None);
                return BoardOutcome::Cancelled;
            }

            // Decide, per edge, run vs skip based on direct upstream edges
            let mut runnable: Vec<&Edge> = Vec::new();
            {
                let mut statuses = execution.statuses.lock().unwrap();
                for edge in level {
                    let upstream_ok = board
                        .edges
                        .iter()
                        .filter(|e| e.target_node == edge.source_node)
                        .all(|e| statuses[&e.id] == EdgeStatus::Completed);
                    if upstream_ok {
                        runnable.push(edge);
                    } else {
                        statuses.insert(edge.id.clone(), EdgeStatus::Skipped);
                    }
                }
            }
            self.emit_status(&board.id, execution, None);

            // Launch the whole wave
            let mut running = Vec::new();
            for edge in runnable {
                // Each edge observes the world fresh
                self.backend.clear_caches();

                match self
                    .engine
                    .start_task(edge.action, edge.profile.clone(), None)
                {
                    Ok((task_id, _progress_rx)) => {
                        execution
                            .statuses
                            .lock()
                            .unwrap()
                            .insert(edge.id.clone(), EdgeStatus::Running);
                        running.push((edge.id.clone(), task_id));
                    }
                    Err(e) => {
                        warn!(board = %board.id, edge = %edge.id, error = %e, "Edge rejected");
                        execution
                            .statuses
                            .lock()
                            .unwrap()
                            .insert(edge.id.clone(), EdgeStatus::Failed);
                    }
                }
            }
            self.emit_status(&board.id, execution, None);

            // A cancellation request propagates to the running tasks
            let stop_guard = {
                let engine = Arc::clone(&self.engine);
                let cancel = cancel.clone();
                let task_ids: Vec<_> = running.iter().map(|(_, id)| *id).collect();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    for id in task_ids {
                        let _ = engine.stop_task(id);
                    }
                })
            };

            // Barrier: the level must be fully terminal before the next one
            for (edge_id, task_id) in running {
                let status = match self.engine.wait_task(task_id).await {
                    Ok(state) => match state {
                        driftsync_core::domain::task::TaskState::Completed => {
                            EdgeStatus::Completed
                        }
                        driftsync_core::domain::task::TaskState::Cancelled => {
                            EdgeStatus::Cancelled
                        }
                        _ => EdgeStatus::Failed,
                    },
                    Err(_) => EdgeStatus::Failed,
                };
                let _ = self.engine.remove_task(task_id);
                execution
                    .statuses
                    .lock()
                    .unwrap()
                    .insert(edge_id, status);
            }
            stop_guard.abort();
            self.emit_status(&board.id, execution, None);
        }

        let statuses = execution.statuses.lock().unwrap();
        if statuses.values().any(|s| *s == EdgeStatus::Cancelled) {
            BoardOutcome::Cancelled
        } else if statuses
            .values()
            .all(|s| *s == EdgeStatus::Completed)
        {
            BoardOutcome::Completed
        } else {
            BoardOutcome::Failed
        }
    }

    fn mark_pending_cancelled(&self, execution: &Execution) {
        let mut statuses = execution.statuses.lock().unwrap();
        for status in statuses.values_mut() {
            if *status == EdgeStatus::Pending {
                *status = EdgeStatus::Cancelled;
            }
        }
    }

    fn emit_status(
        &self,
        board_id: &str,
        execution: &Execution,
        outcome: Option<BoardOutcome>,
    ) {
        let statuses = execution.statuses.lock().unwrap();
        let edges: serde_json::Map<String, serde_json::Value> = statuses
            .iter()
            .map(|(id, status)| {
                (
                    id.clone(),
                    serde_json::Value::String(status.as_str().to_string()),
                )
            })
            .collect();
        self.events.emit(
            "board:execution_status",
            serde_json::json!({
                "board_id": board_id,
                "edges": edges,
                "outcome": outcome.map(|o| format!("{o:?}").to_lowercase()),
            }),
        );
    }
}
