//! Append-only quota request log.
//!
//! The window check and the append must happen in one transaction, so the
//! quota controller drives these helpers through `Store::with_transaction`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::errors::EngineResult;

/// Timestamps of the `limit` most recent requests, newest first.
pub(crate) fn recent_requests(
    conn: &Connection,
    policy: &str,
    account_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<DateTime<Utc>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts_ms FROM request_log
         WHERE policy = ?1 AND account_id = ?2
         ORDER BY ts_ms DESC, id DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![policy, account_id, limit as i64], |row| {
        row.get::<_, i64>(0)
    })?;
    rows.map(|r| r.map(from_millis)).collect()
}

/// Append `count` request records stamped `at`.
pub(crate) fn append_requests(
    conn: &Connection,
    policy: &str,
    account_id: &str,
    at: DateTime<Utc>,
    count: u32,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO request_log (policy, account_id, ts_ms) VALUES (?1, ?2, ?3)",
    )?;
    let ts = to_millis(at);
    for _ in 0..count {
        stmt.execute(params![policy, account_id, ts])?;
    }
    Ok(())
}

impl Store {
    /// Run `f` inside a single immediate transaction.
    pub(crate) fn with_transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Connection) -> EngineResult<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Delete request records older than `cutoff`. Returns rows removed.
    pub fn prune_requests(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let removed = self.conn().execute(
            "DELETE FROM request_log WHERE ts_ms < ?1",
            [to_millis(cutoff)],
        )?;
        Ok(removed)
    }

    pub fn request_count(&self, policy: &str, account_id: &str) -> EngineResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM request_log WHERE policy = ?1 AND account_id = ?2",
            params![policy, account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_recent_requests_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store
            .with_transaction(|conn| {
                append_requests(conn, "P", "A", t0, 1)?;
                append_requests(conn, "P", "A", t0 + Duration::seconds(5), 2)?;
                append_requests(conn, "P", "B", t0 + Duration::seconds(9), 1)?;
                Ok(())
            })
            .unwrap();

        let recent = store
            .with_transaction(|conn| Ok(recent_requests(conn, "P", "A", 10)?))
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0] >= recent[2]);
        assert_eq!(store.request_count("P", "B").unwrap(), 1);
    }

    #[test]
    fn test_prune_requests() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store
            .with_transaction(|conn| {
                append_requests(conn, "P", "A", t0 - Duration::hours(2), 3)?;
                append_requests(conn, "P", "A", t0, 1)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.prune_requests(t0 - Duration::hours(1)).unwrap(), 3);
        assert_eq!(store.request_count("P", "A").unwrap(), 1);
    }
}
