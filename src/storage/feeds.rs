//! Pending feed items and submission receipts.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::types::FeedSubmission;
use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::errors::{EngineError, EngineResult};
use crate::types::{FeedOperation, PendingFeedItem, SubmissionReport};

type RawFeedItem = (i64, String, String, String, String, i64, Option<i64>, Option<String>);

fn raw_item_from_row(row: &Row<'_>) -> rusqlite::Result<RawFeedItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_item(raw: RawFeedItem) -> EngineResult<PendingFeedItem> {
    let (id, marketplace_id, sku, operation, payload, created_ms, launched_ms, submission_id) = raw;
    let operation = operation
        .parse::<FeedOperation>()
        .map_err(EngineError::Configuration)?;
    Ok(PendingFeedItem {
        id,
        marketplace_id,
        sku,
        operation,
        payload: serde_json::from_str(&payload)?,
        created_at: from_millis(created_ms),
        launched_at: launched_ms.map(from_millis),
        submission_id,
    })
}

impl Store {
    pub fn insert_feed_item(
        &self,
        marketplace_id: &str,
        sku: &str,
        operation: FeedOperation,
        payload: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let payload = serde_json::to_string(payload)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pending_feed_items (marketplace_id, sku, operation, payload, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![marketplace_id, sku, operation.as_str(), payload, to_millis(created_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Items of `operation` not yet launched, ordered by marketplace then age.
    pub fn pending_feed_items(&self, operation: FeedOperation) -> EngineResult<Vec<PendingFeedItem>> {
        let raw = {
            let conn = self.conn();
            let mut stmt = conn.prepare_cached(
                "SELECT id, marketplace_id, sku, operation, payload, created_at_ms, launched_at_ms, submission_id
                 FROM pending_feed_items
                 WHERE operation = ?1 AND launched_at_ms IS NULL
                 ORDER BY marketplace_id, created_at_ms, id",
            )?;
            let rows = stmt.query_map([operation.as_str()], raw_item_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw.into_iter().map(decode_item).collect()
    }

    pub fn feed_item(&self, id: i64) -> EngineResult<Option<PendingFeedItem>> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, marketplace_id, sku, operation, payload, created_at_ms, launched_at_ms, submission_id
                 FROM pending_feed_items WHERE id = ?1",
                [id],
                raw_item_from_row,
            )
            .optional()?;
        raw.map(decode_item).transpose()
    }

    /// Mark one page of items as launched under `submission_id`, in one transaction.
    pub fn mark_feed_items_launched(
        &self,
        ids: &[i64],
        submission_id: &str,
        launched_at: DateTime<Utc>,
    ) -> EngineResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ts = to_millis(launched_at);
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE pending_feed_items SET launched_at_ms = ?1, submission_id = ?2
                 WHERE id = ?3 AND launched_at_ms IS NULL",
            )?;
            let mut updated = 0;
            for id in ids {
                updated += stmt.execute(params![ts, submission_id, id])?;
            }
            Ok(updated)
        })
    }

    pub fn insert_submission(
        &self,
        submission_id: &str,
        marketplace_id: &str,
        operation: FeedOperation,
        item_count: u32,
        submitted_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO feed_submissions
                (submission_id, marketplace_id, operation, item_count, submitted_at_ms, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'submitted')",
            params![
                submission_id,
                marketplace_id,
                operation.as_str(),
                item_count,
                to_millis(submitted_at),
            ],
        )?;
        Ok(())
    }

    pub fn save_submission_report(
        &self,
        report: &SubmissionReport,
        fetched_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let body = serde_json::to_string(report)?;
        self.conn().execute(
            "UPDATE feed_submissions SET status = ?1, report = ?2, report_fetched_at_ms = ?3
             WHERE submission_id = ?4",
            params![report.status.as_str(), body, to_millis(fetched_at), report.submission_id],
        )?;
        Ok(())
    }

    pub fn submission(&self, submission_id: &str) -> EngineResult<Option<FeedSubmission>> {
        let raw = self
            .conn()
            .query_row(
                "SELECT submission_id, marketplace_id, operation, item_count, submitted_at_ms,
                        status, report, report_fetched_at_ms
                 FROM feed_submissions WHERE submission_id = ?1",
                [submission_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(submission_id, marketplace_id, operation, item_count, submitted_ms, status, report, fetched_ms)| -> EngineResult<FeedSubmission> {
            Ok(FeedSubmission {
                submission_id,
                marketplace_id,
                operation: operation.parse().map_err(EngineError::Configuration)?,
                item_count,
                submitted_at: from_millis(submitted_ms),
                status,
                report,
                report_fetched_at: fetched_ms.map(from_millis),
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_items_exclude_launched() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let a = store
            .insert_feed_item("M1", "SKU-1", FeedOperation::Price, &json!({"price": 1.0}), now)
            .unwrap();
        store
            .insert_feed_item("M1", "SKU-2", FeedOperation::Price, &json!({"price": 2.0}), now)
            .unwrap();
        store
            .insert_feed_item("M1", "SKU-3", FeedOperation::Inventory, &json!({"qty": 3}), now)
            .unwrap();

        assert_eq!(store.pending_feed_items(FeedOperation::Price).unwrap().len(), 2);
        assert_eq!(store.mark_feed_items_launched(&[a], "S1", now).unwrap(), 1);

        let pending = store.pending_feed_items(FeedOperation::Price).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sku, "SKU-2");

        let launched = store.feed_item(a).unwrap().unwrap();
        assert_eq!(launched.submission_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_submission_receipt_and_report() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_submission("S1", "M1", FeedOperation::Price, 4, now).unwrap();

        let receipt = store.submission("S1").unwrap().unwrap();
        assert_eq!(receipt.status, "submitted");
        assert!(receipt.report.is_none());

        let report = SubmissionReport {
            submission_id: "S1".into(),
            status: crate::types::ReportStatus::Done,
            messages_processed: 4,
            messages_successful: 4,
            messages_with_error: 0,
            raw: String::new(),
        };
        store.save_submission_report(&report, now).unwrap();
        let receipt = store.submission("S1").unwrap().unwrap();
        assert_eq!(receipt.status, "done");
        assert!(receipt.report.is_some());
    }
}
