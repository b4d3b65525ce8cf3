//! Board persistence
//!
//! Boards are stored normalised: one row per board, per node and per edge,
//! with the edge's embedded profile as a JSON column. The executor loads a
//! whole board in one shot; saving is an upsert of all three tables inside a
//! transaction.

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use driftsync_core::domain::board::{Board, Edge, Node};
use driftsync_core::domain::profile::Profile;
use driftsync_core::domain::task::ActionKind;

use crate::StoreError;

/// SQLite-backed board storage.
pub struct SqliteBoardStore {
    pool: SqlitePool,
}

impl SqliteBoardStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Loads a board with its nodes and edges, or `None` when absent.
    pub async fn load(&self, board_id: &str) -> Result<Option<Board>, StoreError> {
        let board_row = sqlx::query("SELECT id, name FROM boards WHERE id = ?")
            .bind(board_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(board_row) = board_row else {
            return Ok(None);
        };

        let node_rows = sqlx::query(
            "SELECT id, remote_name, path, x, y, label FROM board_nodes WHERE board_id = ?",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;

        let nodes = node_rows
            .iter()
            .map(|row| Node {
                id: row.get("id"),
                remote_name: row.get("remote_name"),
                path: row.get("path"),
                x: row.get("x"),
                y: row.get("y"),
                label: row.get("label"),
            })
            .collect();

        let edge_rows = sqlx::query(
            "SELECT id, source_node, target_node, action, profile \
             FROM board_edges WHERE board_id = ?",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;

        let mut edges = Vec::with_capacity(edge_rows.len());
        for row in &edge_rows {
            let action_str: String = row.get("action");
            let action: ActionKind = serde_json::from_value(serde_json::Value::String(
                action_str.clone(),
            ))
            .map_err(|_| {
                StoreError::SerializationError(format!("Unknown edge action: {action_str}"))
            })?;

            let profile_json: String = row.get("profile");
            let profile: Profile = serde_json::from_str(&profile_json).map_err(|e| {
                StoreError::SerializationError(format!("Invalid edge profile JSON: {e}"))
            })?;

            edges.push(Edge {
                id: row.get("id"),
                source_node: row.get("source_node"),
                target_node: row.get("target_node"),
                action,
                profile,
            });
        }

        Ok(Some(Board {
            id: board_row.get("id"),
            name: board_row.get("name"),
            nodes,
            edges,
        }))
    }

    /// Saves a board, replacing its nodes and edges.
    pub async fn save(&self, board: &Board) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO boards (id, name, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
        )
        .bind(&board.id)
        .bind(&board.name)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM board_nodes WHERE board_id = ?")
            .bind(&board.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM board_edges WHERE board_id = ?")
            .bind(&board.id)
            .execute(&mut *tx)
            .await?;

        for node in &board.nodes {
            sqlx::query(
                "INSERT INTO board_nodes (id, board_id, remote_name, path, x, y, label) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&node.id)
            .bind(&board.id)
            .bind(&node.remote_name)
            .bind(&node.path)
            .bind(node.x)
            .bind(node.y)
            .bind(&node.label)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &board.edges {
            let action = serde_json::to_value(edge.action)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| {
                    StoreError::SerializationError("Unserializable edge action".into())
                })?;
            let profile = serde_json::to_string(&edge.profile).map_err(|e| {
                StoreError::SerializationError(format!("Unserializable edge profile: {e}"))
            })?;

            sqlx::query(
                "INSERT INTO board_edges (id, board_id, source_node, target_node, action, profile) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&edge.id)
            .bind(&board.id)
            .bind(&edge.source_node)
            .bind(&edge.target_node)
            .bind(&action)
            .bind(&profile)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabasePool;

    fn sample_board() -> Board {
        Board {
            id: "b1".into(),
            name: "nightly".into(),
            nodes: vec![
                Node {
                    id: "n1".into(),
                    remote_name: "local".into(),
                    path: "/data".into(),
                    x: 0.0,
                    y: 0.0,
                    label: "Local".into(),
                },
                Node {
                    id: "n2".into(),
                    remote_name: "gdrive".into(),
                    path: "/backup".into(),
                    x: 100.0,
                    y: 0.0,
                    label: "Drive".into(),
                },
            ],
            edges: vec![Edge {
                id: "e1".into(),
                source_node: "n1".into(),
                target_node: "n2".into(),
                action: ActionKind::Push,
                profile: Profile::new("/data", "gdrive:/backup"),
            }],
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = SqliteBoardStore::new(pool.pool().clone());

        store.save(&sample_board()).await.unwrap();
        let loaded = store.load("b1").await.unwrap().unwrap();

        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.edges[0].action, ActionKind::Push);
        assert_eq!(loaded.edges[0].profile.destination, "gdrive:/backup");
    }

    #[tokio::test]
    async fn test_load_missing_board() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = SqliteBoardStore::new(pool.pool().clone());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_nodes_and_edges() {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = SqliteBoardStore::new(pool.pool().clone());

        let mut board = sample_board();
        store.save(&board).await.unwrap();

        board.edges.clear();
        store.save(&board).await.unwrap();

        let loaded = store.load("b1").await.unwrap().unwrap();
        assert!(loaded.edges.is_empty());
        assert_eq!(loaded.nodes.len(), 2);
    }
}
