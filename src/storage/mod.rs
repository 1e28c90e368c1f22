//! SQLite persistence for the repricing engine.
//!
//! `Store` is a cloneable handle over a single connection. The catalog,
//! quota request log, offer snapshots, inbound messages and pending feed
//! items each live in their own submodule as `impl Store` blocks.
//! The audit trail is written off the hot path by `writer`.

pub mod catalog;
pub mod feeds;
pub mod messages;
pub mod requests;
pub mod schema;
pub mod snapshots;
pub mod types;
pub mod writer;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::info;

use crate::errors::EngineResult;
use schema::create_tables;

pub use types::{FeedSubmission, PriceChangeRecord, SubmissionAuditRecord};
pub use writer::{create_audit_channel, AuditChannel};

/// Shared handle to the engine database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and make sure the schema exists.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        create_tables(&conn)?;
        info!("[STORAGE] Database initialized at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Lock the connection. Never held across an `.await`.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
