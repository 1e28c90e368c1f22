//! Offer-change notification handling.
//!
//! Turns one stored inbound message into offer snapshots for every matching
//! listing, then re-evaluates those listings' prices. Message copies are
//! deduplicated by `message_id` and snapshots by `(listing, change time)`,
//! so at-least-once delivery and concurrent handlers converge.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::errors::{EngineError, EngineResult};
use crate::history::OfferHistoryStore;
use crate::locks::ListingLocks;
use crate::notification;
use crate::pricing::PricingEngine;
use crate::scheduler::{ScheduleOptions, Task, TaskScheduler};
use crate::storage::Store;
use crate::types::OfferSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOutcome {
    /// Listings that received a new snapshot from this message
    pub matched_listings: usize,
    pub processed: bool,
}

pub struct OfferChangeProcessor {
    store: Store,
    history: Arc<OfferHistoryStore>,
    pricing: Arc<PricingEngine>,
    locks: Arc<ListingLocks>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: SharedClock,
}

impl OfferChangeProcessor {
    pub fn new(
        store: Store,
        history: Arc<OfferHistoryStore>,
        pricing: Arc<PricingEngine>,
        locks: Arc<ListingLocks>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            history,
            pricing,
            locks,
            scheduler,
            clock,
        }
    }

    pub async fn handle(&self, message_id: &str) -> EngineResult<HandleOutcome> {
        let copies = self.store.message_copies(message_id)?;
        let Some((canonical, duplicates)) = copies.split_first() else {
            debug!("[OFFERS] Message {} has no stored copies", message_id);
            return Ok(HandleOutcome { matched_listings: 0, processed: false });
        };

        // Drop copies marked on an earlier pass
        let (marked, unmarked): (Vec<_>, Vec<_>) =
            duplicates.iter().partition(|m| m.marked_for_deletion);
        if !marked.is_empty() {
            let ids: Vec<i64> = marked.iter().map(|m| m.id).collect();
            let removed = self.store.delete_message_rows(&ids)?;
            debug!("[OFFERS] Message {}: dropped {} stale copies", message_id, removed);
        }

        let duplicate_ids: Vec<i64> = unmarked.iter().map(|m| m.id).collect();
        if !duplicate_ids.is_empty() {
            debug!("[OFFERS] Message {}: {} duplicate copies", message_id, duplicate_ids.len());
            self.store.mark_messages_for_deletion(&duplicate_ids)?;
        }

        if canonical.processed {
            debug!("[OFFERS] Message {} already processed", message_id);
            return Ok(HandleOutcome { matched_listings: 0, processed: true });
        }

        let parsed = notification::parse(&canonical.body).map_err(|e| {
            warn!("[OFFERS] Message {} left unprocessed: {}", message_id, e);
            e
        })?;

        let listings = self
            .store
            .listings_for_asin(&parsed.asin, &parsed.marketplace_id)?;
        let mut matched = 0;

        for listing in listings {
            if self.history.exists(listing.id, parsed.change_time)? {
                debug!(
                    "[OFFERS] Listing {} already has a snapshot at {}",
                    listing.id, parsed.change_time
                );
                continue;
            }

            let seller_id = self
                .store
                .backend(listing.backend_id)?
                .and_then(|b| b.seller_id)
                .ok_or_else(|| {
                    let msg = format!("backend {} of listing {} has no seller id", listing.backend_id, listing.id);
                    error!("[OFFERS] {}", msg);
                    EngineError::Configuration(msg)
                })?;

            let snapshot = OfferSnapshot::new(
                listing.id,
                parsed.change_time,
                parsed.to_offers(&seller_id),
                Some(message_id.to_string()),
            );
            let created = {
                let _guard = self.locks.lock(listing.id).await;
                self.history.record(&snapshot)?
            };
            if !created {
                continue;
            }
            matched += 1;

            match self.pricing.evaluate(listing.id, false).await {
                Ok(decision) => {
                    debug!("[OFFERS] Listing {} evaluated: {:?}", listing.id, decision);
                }
                Err(e) => match e.retry_delay() {
                    // The snapshot is stored, so a redelivery would skip this
                    // listing: retry the evaluation on its own.
                    Some(delay) => {
                        info!(
                            "[OFFERS] Pricing listing {} deferred {}s: {}",
                            listing.id,
                            delay.as_secs(),
                            e
                        );
                        let not_before = self.clock.now()
                            + chrono::Duration::from_std(delay).unwrap_or_default();
                        self.scheduler.schedule(
                            Task::EvaluatePricing { listing_id: listing.id, force_change: false },
                            ScheduleOptions::at(not_before),
                        )?;
                    }
                    None => return Err(e),
                },
            }
        }

        self.store.mark_message_processed(canonical.id)?;
        self.scheduler.schedule(
            Task::DeleteMessage { message_id: message_id.to_string() },
            ScheduleOptions::now(),
        )?;

        info!(
            "[OFFERS] Message {} ({} / {}): {} listings updated",
            message_id, parsed.asin, parsed.marketplace_id, matched
        );
        Ok(HandleOutcome { matched_listings: matched, processed: true })
    }
}
