//! Inbound notification rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::errors::EngineResult;
use crate::types::InboundMessage;

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<InboundMessage> {
    Ok(InboundMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        body: row.get(2)?,
        processed: row.get::<_, i64>(3)? != 0,
        deleted_upstream: row.get::<_, i64>(4)? != 0,
        marked_for_deletion: row.get::<_, i64>(5)? != 0,
        received_at: from_millis(row.get(6)?),
    })
}

impl Store {
    /// Store one received copy of a message. Duplicates get their own row.
    pub fn insert_message(
        &self,
        message_id: &str,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO inbound_messages (message_id, body, received_at_ms) VALUES (?1, ?2, ?3)",
            params![message_id, body, to_millis(received_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Every stored copy of `message_id`, oldest row first.
    pub fn message_copies(&self, message_id: &str) -> EngineResult<Vec<InboundMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, message_id, body, processed, deleted_upstream, marked_for_deletion, received_at_ms
             FROM inbound_messages WHERE message_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([message_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_message_processed(&self, row_id: i64) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE inbound_messages SET processed = 1 WHERE id = ?1",
            [row_id],
        )?;
        Ok(())
    }

    pub fn mark_messages_for_deletion(&self, row_ids: &[i64]) -> EngineResult<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE inbound_messages SET marked_for_deletion = 1 WHERE id = ?1",
            )?;
            for id in row_ids {
                stmt.execute([id])?;
            }
            Ok(())
        })
    }

    pub fn mark_deleted_upstream(&self, message_id: &str) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE inbound_messages SET deleted_upstream = 1 WHERE message_id = ?1",
            [message_id],
        )?;
        Ok(())
    }

    /// Remove all local copies of a message. Returns rows removed.
    pub fn delete_message_copies(&self, message_id: &str) -> EngineResult<usize> {
        let removed = self
            .conn()
            .execute("DELETE FROM inbound_messages WHERE message_id = ?1", [message_id])?;
        Ok(removed)
    }

    /// Remove specific copies by row id. Returns rows removed.
    pub fn delete_message_rows(&self, row_ids: &[i64]) -> EngineResult<usize> {
        if row_ids.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare_cached("DELETE FROM inbound_messages WHERE id = ?1")?;
            let mut removed = 0;
            for id in row_ids {
                removed += stmt.execute([id])?;
            }
            Ok(removed)
        })
    }

    /// Distinct ids of messages with no processed copy (startup recovery).
    pub fn unprocessed_message_ids(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT message_id FROM inbound_messages
             GROUP BY message_id
             HAVING MAX(processed) = 0
             ORDER BY MIN(id)",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_copies_and_processing() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let first = store.insert_message("m-1", "{}", now).unwrap();
        store.insert_message("m-1", "{}", now).unwrap();
        store.insert_message("m-2", "{}", now).unwrap();

        let copies = store.message_copies("m-1").unwrap();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].id, first);

        store.mark_message_processed(first).unwrap();
        assert_eq!(store.unprocessed_message_ids().unwrap(), vec!["m-2".to_string()]);

        assert_eq!(store.delete_message_copies("m-1").unwrap(), 2);
        assert!(store.message_copies("m-1").unwrap().is_empty());
    }
}
