//! Bounded-retention offer history per listing.
//!
//! Snapshots are idempotent on `(listing_id, captured_at)`. Only the newest
//! `retention` snapshots are kept: an insert that pushes a listing past the
//! bound schedules a `TrimHistory` task, and each trim pass deletes at most
//! one bounded batch, asking to be run again while backlog remains.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::errors::EngineResult;
use crate::scheduler::{Priority, ScheduleOptions, Task, TaskScheduler};
use crate::storage::Store;
use crate::types::{ListingId, OfferSnapshot};

/// Result of one trim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimOutcome {
    pub deleted: usize,
    /// The pass read a full batch, so more may be waiting
    pub backlog: bool,
}

pub struct OfferHistoryStore {
    store: Store,
    scheduler: Arc<dyn TaskScheduler>,
    retention: usize,
    trim_batch: usize,
}

impl OfferHistoryStore {
    pub fn new(store: Store, scheduler: Arc<dyn TaskScheduler>, config: &EngineConfig) -> Self {
        Self {
            store,
            scheduler,
            retention: config.retention.max(1),
            trim_batch: config.trim_batch().max(config.retention + 1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Store a snapshot. Returns `false` if one already existed for the same
    /// listing and instant.
    pub fn record(&self, snapshot: &OfferSnapshot) -> EngineResult<bool> {
        let created = self.store.insert_snapshot(snapshot)?;
        if !created {
            debug!(
                "[HISTORY] Snapshot for listing {} at {} already stored",
                snapshot.listing_id, snapshot.captured_at
            );
            return Ok(false);
        }

        if self.store.snapshot_count(snapshot.listing_id)? > self.retention {
            self.evict_old(snapshot.listing_id)?;
        }
        Ok(true)
    }

    pub fn exists(&self, listing_id: ListingId, captured_at: DateTime<Utc>) -> EngineResult<bool> {
        self.store.snapshot_exists(listing_id, captured_at)
    }

    /// Retained snapshots, newest first.
    pub fn latest(&self, listing_id: ListingId) -> EngineResult<Vec<OfferSnapshot>> {
        self.store.latest_snapshots(listing_id, self.retention)
    }

    /// The `n` newest snapshots, newest first. `latest_n(id, 2)[1]` is the
    /// state before the most recent change.
    pub fn latest_n(&self, listing_id: ListingId, n: usize) -> EngineResult<Vec<OfferSnapshot>> {
        self.store.latest_snapshots(listing_id, n)
    }

    /// Queue a trim pass for the listing.
    pub fn evict_old(&self, listing_id: ListingId) -> EngineResult<()> {
        self.scheduler.schedule(
            Task::TrimHistory { listing_id },
            ScheduleOptions::now().with_priority(Priority::Low),
        )
    }

    /// One bounded trim pass: read up to `retention + extra` snapshots
    /// oldest-first and delete all but the newest `retention` of them.
    pub fn trim(&self, listing_id: ListingId) -> EngineResult<TrimOutcome> {
        let ids = self.store.oldest_snapshot_ids(listing_id, self.trim_batch)?;
        let backlog = ids.len() == self.trim_batch;

        let deleted = if ids.len() > self.retention {
            let excess = ids.len() - self.retention;
            self.store.delete_snapshots(&ids[..excess])?
        } else {
            0
        };

        if deleted > 0 {
            info!(
                "[HISTORY] Trimmed {} snapshots for listing {}{}",
                deleted,
                listing_id,
                if backlog { " (backlog remains)" } else { "" }
            );
        }
        Ok(TrimOutcome { deleted, backlog })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RecordingScheduler;
    use chrono::{Duration, TimeZone};

    fn history(scheduler: Arc<RecordingScheduler>) -> (OfferHistoryStore, Store) {
        let store = Store::open_in_memory().unwrap();
        let history = OfferHistoryStore::new(store.clone(), scheduler, &EngineConfig::default());
        (history, store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_record_is_idempotent() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let (history, store) = history(scheduler);
        let snap = OfferSnapshot::new(5, at(0), vec![], None);

        assert!(history.record(&snap).unwrap());
        assert!(!history.record(&snap).unwrap());
        assert_eq!(store.snapshot_count(5).unwrap(), 1);
        assert!(history.exists(5, at(0)).unwrap());
    }

    #[test]
    fn test_exceeding_retention_schedules_trim() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let (history, _store) = history(scheduler.clone());

        for i in 0..3 {
            history.record(&OfferSnapshot::new(5, at(i), vec![], None)).unwrap();
        }
        assert!(scheduler.tasks().is_empty());

        history.record(&OfferSnapshot::new(5, at(3), vec![], None)).unwrap();
        let scheduled = scheduler.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].task, Task::TrimHistory { listing_id: 5 });
        assert_eq!(scheduled[0].options.priority, Priority::Low);
    }

    #[test]
    fn test_trim_converges_to_newest_three() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let (history, store) = history(scheduler);
        for i in 0..20 {
            store.insert_snapshot(&OfferSnapshot::new(9, at(i), vec![], None)).unwrap();
        }

        let first = history.trim(9).unwrap();
        assert_eq!(first, TrimOutcome { deleted: 10, backlog: true });

        let second = history.trim(9).unwrap();
        assert_eq!(second, TrimOutcome { deleted: 7, backlog: false });

        let kept = history.latest_n(9, 10).unwrap();
        let kept_at: Vec<_> = kept.iter().map(|s| s.captured_at).collect();
        assert_eq!(kept_at, vec![at(19), at(18), at(17)]);
    }
}
