//! Offer snapshot persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::errors::EngineResult;
use crate::types::{ListingId, Offer, OfferSnapshot};

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<(ListingId, i64, Option<String>, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl Store {
    /// Insert a snapshot unless one already exists for `(listing_id, captured_at)`.
    ///
    /// Returns `true` if a row was created.
    pub fn insert_snapshot(&self, snapshot: &OfferSnapshot) -> EngineResult<bool> {
        let offers_json = serde_json::to_string(&snapshot.offers)?;
        let created = self.conn().execute(
            "INSERT OR IGNORE INTO offer_snapshots (listing_id, captured_at_ms, source_message_id, offers_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.listing_id,
                to_millis(snapshot.captured_at),
                snapshot.source_message_id,
                offers_json,
            ],
        )?;
        Ok(created > 0)
    }

    pub fn snapshot_exists(&self, listing_id: ListingId, captured_at: DateTime<Utc>) -> EngineResult<bool> {
        let exists: i64 = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM offer_snapshots WHERE listing_id = ?1 AND captured_at_ms = ?2)",
            params![listing_id, to_millis(captured_at)],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// The `limit` newest snapshots for a listing, newest first.
    pub fn latest_snapshots(&self, listing_id: ListingId, limit: usize) -> EngineResult<Vec<OfferSnapshot>> {
        let raw = {
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(
                "SELECT listing_id, captured_at_ms, source_message_id, offers_json
                 FROM offer_snapshots
                 WHERE listing_id = ?1
                 ORDER BY captured_at_ms DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![listing_id, limit as i64], snapshot_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        raw.into_iter()
            .map(|(listing_id, captured_ms, source, json)| -> EngineResult<OfferSnapshot> {
                let offers: Vec<Offer> = serde_json::from_str(&json)?;
                Ok(OfferSnapshot::new(listing_id, from_millis(captured_ms), offers, source))
            })
            .collect()
    }

    /// Row ids of up to `limit` snapshots for a listing, oldest first.
    pub fn oldest_snapshot_ids(&self, listing_id: ListingId, limit: usize) -> EngineResult<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM offer_snapshots
             WHERE listing_id = ?1
             ORDER BY captured_at_ms ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![listing_id, limit as i64], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn snapshot_count(&self, listing_id: ListingId) -> EngineResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM offer_snapshots WHERE listing_id = ?1",
            [listing_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete snapshots by row id in one transaction.
    pub fn delete_snapshots(&self, ids: &[i64]) -> EngineResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare_cached("DELETE FROM offer_snapshots WHERE id = ?1")?;
            let mut removed = 0;
            for id in ids {
                removed += stmt.execute([id])?;
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_insert_is_idempotent_per_instant() {
        let store = Store::open_in_memory().unwrap();
        let at = Utc::now();
        let snap = OfferSnapshot::new(7, at, vec![], Some("m-1".into()));

        assert!(store.insert_snapshot(&snap).unwrap());
        assert!(!store.insert_snapshot(&snap).unwrap());
        assert_eq!(store.snapshot_count(7).unwrap(), 1);
        assert!(store.snapshot_exists(7, at).unwrap());
    }

    #[test]
    fn test_latest_is_ordered_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        for i in 0..4 {
            let snap = OfferSnapshot::new(1, t0 + Duration::seconds(i), vec![], None);
            store.insert_snapshot(&snap).unwrap();
        }

        let latest = store.latest_snapshots(1, 2).unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest[0].captured_at > latest[1].captured_at);
        assert_eq!(to_millis(latest[0].captured_at), to_millis(t0 + Duration::seconds(3)));
    }
}
