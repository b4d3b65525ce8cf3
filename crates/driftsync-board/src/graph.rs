//! Board graph validation and level computation
//!
//! Validation checks that every edge references existing nodes and that the
//! directed graph is acyclic (Kahn's algorithm). Level computation assigns
//! each node its longest-path depth; an edge executes at the level of its
//! source node, so all edges within a level are mutually independent.

use std::collections::{HashMap, HashSet, VecDeque};

use driftsync_core::domain::board::{Board, Edge};
use driftsync_core::CoreError;

/// Validates edge endpoints and acyclicity.
///
/// Rejects with [`CoreError::Cycle`] naming the offending edges when the
/// graph contains a cycle, or [`CoreError::Validation`] for dangling edge
/// endpoints.
pub fn validate_board(board: &Board) -> Result<(), CoreError> {
    let node_ids: HashSet<&str> = board.nodes.iter().map(|n| n.id.as_str()).collect();

    for edge in &board.edges {
        if !node_ids.contains(edge.source_node.as_str()) {
            return Err(CoreError::Validation(format!(
                "edge {} references unknown source node {}",
                edge.id, edge.source_node
            )));
        }
        if !node_ids.contains(edge.target_node.as_str()) {
            return Err(CoreError::Validation(format!(
                "edge {} references unknown target node {}",
                edge.id, edge.target_node
            )));
        }
    }

    // Kahn's algorithm: repeatedly remove nodes with no incoming edges.
    // Whatever cannot be removed participates in a cycle.
    let mut in_degree: HashMap<&str, usize> =
        board.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in &board.edges {
        *in_degree.get_mut(edge.target_node.as_str()).unwrap() += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut removed = HashSet::new();

    while let Some(node) = queue.pop_front() {
        removed.insert(node);
        for edge in board.edges.iter().filter(|e| e.source_node == node) {
            let degree = in_degree.get_mut(edge.target_node.as_str()).unwrap();
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(edge.target_node.as_str());
            }
        }
    }

    if removed.len() < board.nodes.len() {
        let cyclic: Vec<String> = board
            .edges
            .iter()
            .filter(|e| {
                !removed.contains(e.source_node.as_str())
                    && !removed.contains(e.target_node.as_str())
            })
            .map(|e| e.id.clone())
            .collect();
        return Err(CoreError::Cycle { edges: cyclic });
    }

    Ok(())
}

/// Groups edges into execution levels.
///
/// A node's level is its longest-path depth from the roots; an edge runs at
/// its source node's level. The board must already be validated.
pub fn edge_levels(board: &Board) -> Vec<Vec<&Edge>> {
    let mut node_level: HashMap<&str, usize> =
        board.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();

    // Longest-path layering via repeated relaxation; the graph is acyclic
    // so this settles in at most |nodes| passes.
    let mut changed = true;
    while changed {
        changed = false;
        for edge in &board.edges {
            let source_level = node_level[edge.source_node.as_str()];
            let target_level = node_level[edge.target_node.as_str()];
            if target_level < source_level + 1 {
                node_level.insert(edge.target_node.as_str(), source_level + 1);
                changed = true;
            }
        }
    }

    let max_level = board
        .edges
        .iter()
        .map(|e| node_level[e.source_node.as_str()])
        .max()
        .unwrap_or(0);

    let mut levels: Vec<Vec<&Edge>> = vec![Vec::new(); max_level + 1];
    for edge in &board.edges {
        levels[node_level[edge.source_node.as_str()]].push(edge);
    }
    levels.retain(|level| !level.is_empty());
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::domain::board::Node;
    use driftsync_core::domain::profile::Profile;
    use driftsync_core::domain::task::ActionKind;

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            remote_name: "local".into(),
            path: format!("/{id}"),
            x: 0.0,
            y: 0.0,
            label: id.into(),
        }
    }

    fn edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: id.into(),
            source_node: from.into(),
            target_node: to.into(),
            action: ActionKind::Copy,
            profile: Profile::new(format!("/{from}"), format!("/{to}")),
        }
    }

    fn diamond() -> Board {
        Board {
            id: "b".into(),
            name: "diamond".into(),
            nodes: vec![node("A"), node("B"), node("C"), node("D")],
            edges: vec![
                edge("e1", "A", "B"),
                edge("e2", "A", "C"),
                edge("e3", "B", "D"),
                edge("e4", "C", "D"),
            ],
        }
    }

    #[test]
    fn test_valid_diamond() {
        assert!(validate_board(&diamond()).is_ok());
    }

    #[test]
    fn test_dangling_edge_endpoint() {
        let mut board = diamond();
        board.edges.push(edge("e5", "A", "Z"));
        assert!(matches!(
            validate_board(&board),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_two_cycle_rejected_with_edges() {
        let board = Board {
            id: "b".into(),
            name: "cycle".into(),
            nodes: vec![node("A"), node("B")],
            edges: vec![edge("e1", "A", "B"), edge("e2", "B", "A")],
        };
        match validate_board(&board) {
            Err(CoreError::Cycle { mut edges }) => {
                edges.sort();
                assert_eq!(edges, vec!["e1".to_string(), "e2".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_reporting_spares_acyclic_edges() {
        let board = Board {
            id: "b".into(),
            name: "partial".into(),
            nodes: vec![node("A"), node("B"), node("C")],
            edges: vec![
                edge("ok", "A", "B"),
                edge("c1", "B", "C"),
                edge("c2", "C", "B"),
            ],
        };
        match validate_board(&board) {
            Err(CoreError::Cycle { mut edges }) => {
                edges.sort();
                assert_eq!(edges, vec!["c1".to_string(), "c2".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let board = Board {
            id: "b".into(),
            name: "selfie".into(),
            nodes: vec![node("A")],
            edges: vec![edge("e1", "A", "A")],
        };
        assert!(matches!(
            validate_board(&board),
            Err(CoreError::Cycle { .. })
        ));
    }

    #[test]
    fn test_diamond_levels() {
        let board = diamond();
        let levels = edge_levels(&board);
        assert_eq!(levels.len(), 2);

        let first: Vec<&str> = levels[0].iter().map(|e| e.id.as_str()).collect();
        let second: Vec<&str> = levels[1].iter().map(|e| e.id.as_str()).collect();
        assert_eq!(first, vec!["e1", "e2"]);
        assert_eq!(second, vec!["e3", "e4"]);
    }

    #[test]
    fn test_chain_levels() {
        let board = Board {
            id: "b".into(),
            name: "chain".into(),
            nodes: vec![node("A"), node("B"), node("C")],
            edges: vec![edge("e1", "A", "B"), edge("e2", "B", "C")],
        };
        let levels = edge_levels(&board);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0][0].id, "e1");
        assert_eq!(levels[1][0].id, "e2");
    }

    #[test]
    fn test_parallel_edges_share_a_level() {
        let board = Board {
            id: "b".into(),
            name: "parallel".into(),
            nodes: vec![node("A"), node("B")],
            edges: vec![edge("e1", "A", "B"), edge("e2", "A", "B")],
        };
        let levels = edge_levels(&board);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }
}
