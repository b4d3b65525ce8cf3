//! driftsync board - DAG execution of transfer graphs
//!
//! A board is a directed acyclic graph of transfers. The executor
//! validates the graph, groups edges into topological waves, and runs each
//! wave concurrently through the task engine, with per-edge status and
//! partial-failure semantics: a failed edge skips its descendants without
//! aborting the rest of the board.

pub mod executor;
pub mod graph;

pub use executor::{BoardExecutor, BoardOutcome};
pub use graph::{edge_levels, validate_board};
