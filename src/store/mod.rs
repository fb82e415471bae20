//! Durable state for the mesh: nodes, agents and the message ledger
//!
//! A single SQLite connection sits behind a mutex. Every operation takes the
//! lock for one statement or one transaction and releases it immediately, so
//! no lock is ever held across network I/O.

mod agents;
mod messages;
mod nodes;

pub use agents::{Agent, PresenceOutcome, SLEEPING};
pub use messages::{DeliveryState, MessageRecord, NewMessage};
pub use nodes::Node;

use crate::protocol::messages::parse_timestamp;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// State store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    os TEXT NOT NULL DEFAULT 'unknown',
    capabilities TEXT NOT NULL DEFAULT '[]'
);
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES nodes(id),
    role TEXT NOT NULL DEFAULT 'unknown',
    operator TEXT,
    version TEXT,
    status TEXT NOT NULL DEFAULT 'unknown',
    last_seen TEXT NOT NULL,
    parent_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_agents_node ON agents(node_id);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    sender TEXT NOT NULL,
    target TEXT NOT NULL,
    topic TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'delivered'
);
CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);
";

/// Relational store shared by the reconciler, the signal logger and readers
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) a database file. `:memory:` opens a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        debug!(path = %path.display(), "Opened state store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Cheap liveness probe used by the readiness check
    pub fn ping(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

pub(crate) fn read_timestamp(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(&raw).ok_or_else(|| conversion_error(column, format!("bad timestamp '{raw}'")))
}
