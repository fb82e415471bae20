use super::{conversion_error, read_timestamp, StateStore, StoreResult};
use crate::protocol::messages::format_timestamp;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Delivery state recorded on a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Delivered,
    Pending,
    Error,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Delivered => "delivered",
            DeliveryState::Pending => "pending",
            DeliveryState::Error => "error",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(DeliveryState::Delivered),
            "pending" => Ok(DeliveryState::Pending),
            "error" => Ok(DeliveryState::Error),
            other => Err(format!("unknown delivery state '{other}'")),
        }
    }
}

/// An appended ledger row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub sender: String,
    pub target: String,
    pub topic: String,
    pub payload: String,
    pub state: DeliveryState,
}

/// A ledger row before insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub ts: DateTime<Utc>,
    pub sender: String,
    pub target: String,
    pub topic: String,
    pub payload: String,
    pub state: DeliveryState,
}

impl NewMessage {
    pub fn new(
        sender: impl Into<String>,
        target: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
        state: DeliveryState,
    ) -> Self {
        Self {
            ts: Utc::now(),
            sender: sender.into(),
            target: target.into(),
            topic: topic.into(),
            payload: payload.into(),
            state,
        }
    }

    pub fn delivered(
        sender: impl Into<String>,
        target: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(sender, target, topic, payload, DeliveryState::Delivered)
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let state: String = row.get(6)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        ts: read_timestamp(1, row.get(1)?)?,
        sender: row.get(2)?,
        target: row.get(3)?,
        topic: row.get(4)?,
        payload: row.get(5)?,
        state: state.parse().map_err(|e| conversion_error(6, e))?,
    })
}

const MESSAGE_COLUMNS: &str = "id, ts, sender, target, topic, payload, state";

impl StateStore {
    /// Append a ledger row and return its id. Rows are never updated afterwards.
    pub fn append_message(&self, message: &NewMessage) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (ts, sender, target, topic, payload, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format_timestamp(&message.ts),
                message.sender,
                message.target,
                message.topic,
                message.payload,
                message.state.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest rows first
    pub fn recent_messages(&self, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY ts DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit as i64], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full ledger in audit order
    pub fn message_history(&self) -> StoreResult<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY ts ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_messages(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
