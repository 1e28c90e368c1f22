//! Feed batching and submission.
//!
//! Pending change requests are grouped per marketplace, reduced to one entry
//! per SKU (latest `created_at` wins), and submitted as one bulk document per
//! marketplace. Every original item that went into a submitted document,
//! superseded duplicates included, is marked launched under the returned
//! submission id. The processing report is fetched later by a deferred
//! `FetchSubmissionReport` task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::clock::{to_millis, SharedClock};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::remote::GatedClient;
use crate::scheduler::{ScheduleOptions, Task, TaskScheduler};
use crate::storage::{AuditChannel, Store, SubmissionAuditRecord};
use crate::types::{FeedDocument, FeedEntry, FeedOperation, PendingFeedItem};

/// One marketplace's share of a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch {
    pub document: FeedDocument,
    /// Every pending item the document consumes
    pub consumed_ids: Vec<i64>,
}

/// Group pending items per marketplace and keep the latest item per SKU.
///
/// Ties on `created_at` go to the higher row id (the later insert).
pub fn build_batches(items: Vec<PendingFeedItem>, operation: FeedOperation) -> Vec<FeedBatch> {
    let mut by_marketplace: BTreeMap<String, Vec<PendingFeedItem>> = BTreeMap::new();
    for item in items.into_iter().filter(|i| i.operation == operation) {
        by_marketplace
            .entry(item.marketplace_id.clone())
            .or_default()
            .push(item);
    }

    by_marketplace
        .into_iter()
        .map(|(marketplace_id, items)| {
            let consumed_ids = items.iter().map(|i| i.id).collect();

            let mut latest: BTreeMap<String, PendingFeedItem> = BTreeMap::new();
            for item in items {
                let newer = latest
                    .get(&item.sku)
                    .map_or(true, |kept| (item.created_at, item.id) > (kept.created_at, kept.id));
                if newer {
                    latest.insert(item.sku.clone(), item);
                }
            }

            let entries = latest
                .into_values()
                .map(|item| FeedEntry {
                    sku: item.sku,
                    payload: item.payload,
                })
                .collect();

            FeedBatch {
                document: FeedDocument {
                    marketplace_id,
                    operation,
                    entries,
                },
                consumed_ids,
            }
        })
        .collect()
}

/// Queue a flush of every feed operation (periodic tick).
pub fn schedule_flushes(scheduler: &dyn TaskScheduler) -> EngineResult<()> {
    for operation in FeedOperation::ALL {
        scheduler.schedule(Task::FlushFeeds { operation }, ScheduleOptions::now())?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Submitted { submission_id: String },
    /// Throttled or transient failure; the items stay pending and a flush
    /// is rescheduled
    Deferred { retry_after: Duration },
    /// Rejected by the remote; the items stay pending until the next
    /// periodic flush
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionResult {
    pub marketplace_id: String,
    pub operation: FeedOperation,
    /// Entries in the submitted document
    pub submitted_items: usize,
    /// Original pending items marked launched
    pub consumed_items: usize,
    pub outcome: SubmissionOutcome,
}

pub struct FeedAggregator {
    store: Store,
    client: Arc<GatedClient>,
    scheduler: Arc<dyn TaskScheduler>,
    audit: AuditChannel,
    clock: SharedClock,
    page_size: usize,
    report_delay: chrono::Duration,
    concurrency: usize,
}

impl FeedAggregator {
    pub fn new(
        store: Store,
        client: Arc<GatedClient>,
        scheduler: Arc<dyn TaskScheduler>,
        audit: AuditChannel,
        clock: SharedClock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            client,
            scheduler,
            audit,
            clock,
            page_size: config.feed_page_size.max(1),
            report_delay: chrono::Duration::minutes(config.report_delay_mins),
            concurrency: config.feed_concurrency.max(1),
        }
    }

    pub fn report_delay(&self) -> chrono::Duration {
        self.report_delay
    }

    /// Queue an inventory, shipment or price change for the next flush.
    pub fn enqueue(
        &self,
        marketplace_id: &str,
        sku: &str,
        operation: FeedOperation,
        payload: &serde_json::Value,
    ) -> EngineResult<i64> {
        self.store
            .insert_feed_item(marketplace_id, sku, operation, payload, self.clock.now())
    }

    /// Submit everything pending for `operation`, one document per
    /// marketplace, marketplaces in parallel.
    pub async fn flush(&self, operation: FeedOperation) -> EngineResult<Vec<SubmissionResult>> {
        let pending = self.store.pending_feed_items(operation)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let batches = build_batches(pending, operation);
        info!("[FEED] Flushing {} feed for {} marketplaces", operation, batches.len());

        let results: Vec<SubmissionResult> = stream::iter(batches)
            .map(|batch| self.submit_batch(batch))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let retry_after = results
            .iter()
            .filter_map(|r| match r.outcome {
                SubmissionOutcome::Deferred { retry_after } => Some(retry_after),
                _ => None,
            })
            .max();
        if let Some(retry_after) = retry_after {
            let not_before = self.clock.now() + chrono::Duration::from_std(retry_after).unwrap_or_default();
            self.scheduler
                .schedule(Task::FlushFeeds { operation }, ScheduleOptions::at(not_before))?;
        }

        Ok(results)
    }

    async fn submit_batch(&self, batch: FeedBatch) -> SubmissionResult {
        let FeedBatch { document, consumed_ids } = batch;
        let mut result = SubmissionResult {
            marketplace_id: document.marketplace_id.clone(),
            operation: document.operation,
            submitted_items: document.entries.len(),
            consumed_items: 0,
            outcome: SubmissionOutcome::Failed { error: String::new() },
        };

        let submission_id = match self.client.submit_feed(&document).await {
            Ok(id) => id,
            Err(e) if e.is_retryable() => {
                let retry_after = e.retry_delay().unwrap_or_default();
                info!(
                    "[FEED] {} feed for {} deferred {}s: {}",
                    document.operation,
                    document.marketplace_id,
                    retry_after.as_secs(),
                    e
                );
                result.outcome = SubmissionOutcome::Deferred { retry_after };
                return result;
            }
            Err(e) => {
                warn!("[FEED] {} feed for {} failed: {}", document.operation, document.marketplace_id, e);
                result.outcome = SubmissionOutcome::Failed { error: e.to_string() };
                return result;
            }
        };

        match self.record_submission(&document, &consumed_ids, &submission_id) {
            Ok(consumed) => {
                result.consumed_items = consumed;
                result.outcome = SubmissionOutcome::Submitted { submission_id };
            }
            Err(e) => {
                // Submitted upstream but not recorded: the items will go out again.
                error!(
                    "[FEED] Submission {} for {} not recorded: {}",
                    submission_id, document.marketplace_id, e
                );
                result.outcome = SubmissionOutcome::Failed { error: e.to_string() };
            }
        }
        result
    }

    fn record_submission(
        &self,
        document: &FeedDocument,
        consumed_ids: &[i64],
        submission_id: &str,
    ) -> EngineResult<usize> {
        let now = self.clock.now();
        self.store.insert_submission(
            submission_id,
            &document.marketplace_id,
            document.operation,
            document.entries.len() as u32,
            now,
        )?;

        let mut consumed = 0;
        for page in consumed_ids.chunks(self.page_size) {
            consumed += self.store.mark_feed_items_launched(page, submission_id, now)?;
        }

        self.scheduler.schedule(
            Task::FetchSubmissionReport { submission_id: submission_id.to_string() },
            ScheduleOptions::at(now + self.report_delay),
        )?;

        self.audit.record_submission(SubmissionAuditRecord {
            submission_id: submission_id.to_string(),
            marketplace_id: document.marketplace_id.clone(),
            operation: document.operation.to_string(),
            submitted_items: document.entries.len() as u32,
            consumed_items: consumed as u32,
            submitted_at_ms: to_millis(now),
        });

        info!(
            "[FEED] Submitted {} {} entries for {} as {} ({} items consumed)",
            document.entries.len(),
            document.operation,
            document.marketplace_id,
            submission_id,
            consumed
        );
        Ok(consumed)
    }

    /// Retrieve and store the processing report. Returns `true` once the
    /// report is final.
    pub async fn fetch_report(&self, submission_id: &str) -> EngineResult<bool> {
        let submission = self.store.submission(submission_id)?.ok_or_else(|| {
            EngineError::Configuration(format!("unknown feed submission {}", submission_id))
        })?;

        let report = self
            .client
            .get_submission_report(&submission.marketplace_id, submission_id)
            .await?;
        self.store.save_submission_report(&report, self.clock.now())?;

        if report.messages_with_error > 0 {
            warn!(
                "[FEED] Submission {}: {} of {} messages with errors",
                submission_id, report.messages_with_error, report.messages_processed
            );
        } else {
            info!(
                "[FEED] Submission {}: {} ({} processed)",
                submission_id,
                report.status.as_str(),
                report.messages_processed
            );
        }
        Ok(report.status.is_final())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn item(id: i64, marketplace: &str, sku: &str, secs: i64, price: f64) -> PendingFeedItem {
        PendingFeedItem {
            id,
            marketplace_id: marketplace.into(),
            sku: sku.into(),
            operation: FeedOperation::Price,
            payload: json!({ "sku": sku, "price": price }),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs),
            launched_at: None,
            submission_id: None,
        }
    }

    #[test]
    fn test_latest_item_per_sku_wins() {
        let items = vec![
            item(1, "M1", "A", 10, 1.0),
            item(2, "M1", "A", 5, 2.0),
            item(3, "M1", "B", 0, 3.0),
            item(4, "M2", "A", 0, 4.0),
        ];
        let batches = build_batches(items, FeedOperation::Price);
        assert_eq!(batches.len(), 2);

        let m1 = &batches[0];
        assert_eq!(m1.document.marketplace_id, "M1");
        assert_eq!(m1.document.entries.len(), 2);
        assert_eq!(m1.document.entries[0].payload["price"], 1.0);
        assert_eq!(m1.consumed_ids, vec![1, 2, 3]);

        assert_eq!(batches[1].consumed_ids, vec![4]);
    }

    #[test]
    fn test_periodic_flush_covers_every_operation() {
        let scheduler = crate::scheduler::RecordingScheduler::new();
        schedule_flushes(&scheduler).unwrap();
        assert_eq!(
            scheduler.tasks(),
            vec![
                Task::FlushFeeds { operation: FeedOperation::Price },
                Task::FlushFeeds { operation: FeedOperation::Inventory },
                Task::FlushFeeds { operation: FeedOperation::Shipment },
            ]
        );
    }

    #[test]
    fn test_created_at_tie_goes_to_later_row() {
        let items = vec![item(7, "M1", "A", 0, 1.0), item(8, "M1", "A", 0, 2.0)];
        let batches = build_batches(items, FeedOperation::Price);
        assert_eq!(batches[0].document.entries[0].payload["price"], 2.0);
    }
}
