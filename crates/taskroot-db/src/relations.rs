//! Workflow relation edges and bounded graph expansion.

use std::collections::{HashSet, VecDeque};

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use taskroot_core::{Error, RelationKind, Result, TaskRelation};

/// Insert an edge unless it already exists.
pub(crate) async fn insert_relation(
    tx: &mut Transaction<'_, Sqlite>,
    relation: &TaskRelation,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO task_relations (root_id, parent_id, child_id, relation)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&relation.root_id)
    .bind(relation.parent_id.as_deref().unwrap_or(""))
    .bind(&relation.child_id)
    .bind(relation.relation.as_str())
    .execute(&mut **tx)
    .await
    .map_err(Error::Storage)?;
    Ok(())
}

/// SQLite implementation of relation storage.
pub struct SqliteRelationRepository {
    pool: SqlitePool,
}

impl SqliteRelationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_relation_row(row: &SqliteRow) -> TaskRelation {
        let parent_id: String = row.get("parent_id");
        let relation: String = row.get("relation");
        TaskRelation {
            root_id: row.get("root_id"),
            parent_id: Some(parent_id).filter(|p| !p.is_empty()),
            child_id: row.get("child_id"),
            relation: relation.parse().unwrap_or(RelationKind::Child),
        }
    }

    /// Store an edge. Storing the same edge again is a no-op.
    pub async fn store(&self, relation: &TaskRelation) -> Result<()> {
        if relation.root_id.is_empty() || relation.child_id.is_empty() {
            return Err(Error::InvalidInput(
                "relation root_id and child_id must not be empty".into(),
            ));
        }
        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;
        insert_relation(&mut tx, relation).await?;
        tx.commit().await.map_err(Error::Storage)?;
        Ok(())
    }

    /// Edges touching `node` as root or parent, in insertion order, at most
    /// `limit` of them.
    async fn edges_from(&self, node: &str, limit: usize) -> Result<Vec<TaskRelation>> {
        let rows = sqlx::query(
            r#"
            SELECT root_id, parent_id, child_id, relation
            FROM task_relations
            WHERE root_id = ? OR parent_id = ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(node)
        .bind(node)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Storage)?;
        Ok(rows.iter().map(Self::parse_relation_row).collect())
    }

    /// Breadth-first expansion from `root_id`.
    ///
    /// The root sits at depth 0. An edge is reported only when its child is
    /// at most `max_depth` away from the root and fits within `max_nodes`
    /// visited nodes; no more than `max_nodes` edges are returned. Cycles are
    /// harmless: each node is expanded once and each edge reported once.
    pub async fn expand(
        &self,
        root_id: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<Vec<TaskRelation>> {
        let mut edges = Vec::new();
        let mut seen_edges: HashSet<TaskRelation> = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        visited.insert(root_id.to_string());
        queue.push_back((root_id.to_string(), 0));
        let mut truncated = false;

        'bfs: while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            // one row past the budget tells a full fan-out from a truncated one
            let budget = max_nodes - edges.len().min(max_nodes);
            let adjacent = self.edges_from(&node, budget + 1).await?;
            if adjacent.len() > budget {
                truncated = true;
            }
            for edge in adjacent {
                if edges.len() >= max_nodes {
                    truncated = true;
                    break 'bfs;
                }
                if seen_edges.contains(&edge) {
                    continue;
                }
                let child = edge.child_id.clone();
                if !visited.contains(&child) {
                    if visited.len() >= max_nodes {
                        truncated = true;
                        continue;
                    }
                    visited.insert(child.clone());
                    queue.push_back((child, depth + 1));
                }
                seen_edges.insert(edge.clone());
                edges.push(edge);
            }
        }

        if truncated {
            warn!(
                subsystem = "db",
                op = "get_task_relations",
                root_id,
                max_nodes,
                "Relation graph truncated at node cap"
            );
        }
        debug!(
            subsystem = "db",
            op = "get_task_relations",
            root_id,
            result_count = edges.len(),
            nodes = visited.len(),
            "Relation graph expanded"
        );
        Ok(edges)
    }
}
