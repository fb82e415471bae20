use super::{conversion_error, StateStore, StoreResult};
use rusqlite::{OptionalExtension, Row};
use serde::Serialize;

/// A physical or logical host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub os: String,
    pub capabilities: Vec<String>,
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let capabilities: String = row.get(3)?;
    Ok(Node {
        id: row.get(0)?,
        hostname: row.get(1)?,
        os: row.get(2)?,
        capabilities: serde_json::from_str(&capabilities)
            .map_err(|e| conversion_error(3, e.to_string()))?,
    })
}

impl StateStore {
    pub fn get_node(&self, id: &str) -> StoreResult<Option<Node>> {
        let conn = self.lock()?;
        let node = conn
            .query_row(
                "SELECT id, hostname, os, capabilities FROM nodes WHERE id = ?1",
                [id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    pub fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, hostname, os, capabilities FROM nodes ORDER BY id")?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    pub fn count_nodes(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
