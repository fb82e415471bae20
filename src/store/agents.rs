use super::{read_timestamp, StateStore, StoreResult};
use crate::protocol::messages::{format_timestamp, PresenceEvent, UNKNOWN};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

/// Status written by the staleness sweep
pub const SLEEPING: &str = "sleeping";

/// A logical process running on a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    pub id: String,
    pub node_id: String,
    pub role: String,
    pub operator: Option<String>,
    pub version: Option<String>,
    pub status: String,
    pub last_seen: DateTime<Utc>,
    pub parent_id: Option<String>,
}

/// Which rows a presence upsert created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceOutcome {
    pub node_created: bool,
    pub agent_created: bool,
}

const AGENT_COLUMNS: &str =
    "id, node_id, role, operator, version, status, last_seen, parent_id";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        node_id: row.get(1)?,
        role: row.get(2)?,
        operator: row.get(3)?,
        version: row.get(4)?,
        status: row.get(5)?,
        last_seen: read_timestamp(6, row.get(6)?)?,
        parent_id: row.get(7)?,
    })
}

impl StateStore {
    /// Merge one presence event into the node and agent tables.
    ///
    /// Runs as a single transaction. A known agent has status, last_seen,
    /// operator, version and parent_id overwritten; role is fixed at creation.
    /// A known node only has its capabilities replaced, and only when the
    /// event carries some.
    pub fn apply_presence(&self, event: &PresenceEvent) -> StoreResult<PresenceOutcome> {
        let capabilities = serde_json::to_string(&event.capabilities)?;
        let hostname = event.hostname.as_deref().unwrap_or(&event.node_id);
        let os = event.os.as_deref().unwrap_or(UNKNOWN);
        let role = event.role.as_deref().unwrap_or(UNKNOWN);
        let last_seen = format_timestamp(&event.seen_at);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let node_created = tx.execute(
            "INSERT OR IGNORE INTO nodes (id, hostname, os, capabilities) VALUES (?1, ?2, ?3, ?4)",
            params![event.node_id, hostname, os, capabilities],
        )? == 1;

        if !node_created && !event.capabilities.is_empty() {
            tx.execute(
                "UPDATE nodes SET capabilities = ?2 WHERE id = ?1",
                params![event.node_id, capabilities],
            )?;
        }

        let agent_created = tx.execute(
            "INSERT OR IGNORE INTO agents (id, node_id, role, operator, version, status, last_seen, parent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.agent_id,
                event.node_id,
                role,
                event.operator,
                event.version,
                event.state,
                last_seen,
                event.parent_id
            ],
        )? == 1;

        if !agent_created {
            tx.execute(
                "UPDATE agents
                 SET status = ?2, last_seen = ?3, operator = ?4, version = ?5, parent_id = ?6
                 WHERE id = ?1",
                params![
                    event.agent_id,
                    event.state,
                    last_seen,
                    event.operator,
                    event.version,
                    event.parent_id
                ],
            )?;
        }

        tx.commit()?;

        Ok(PresenceOutcome {
            node_created,
            agent_created,
        })
    }

    pub fn get_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        let conn = self.lock()?;
        let agent = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                [id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    /// All agents, most recently seen first
    pub fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY last_seen DESC, id"
        ))?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    /// Set `sleeping` on agents last seen before `cutoff`. Returns rows changed.
    pub fn mark_stale_agents(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE agents SET status = ?1 WHERE last_seen < ?2 AND status != ?1",
            params![SLEEPING, format_timestamp(&cutoff)],
        )?;
        Ok(changed)
    }

    pub fn count_agents(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
