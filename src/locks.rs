//! Per-listing mutual exclusion.
//!
//! Snapshot inserts and price writes for the same listing are serialized
//! through one async mutex per listing id. Everything else may interleave.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::ListingId;

#[derive(Default)]
pub struct ListingLocks {
    locks: Mutex<FxHashMap<ListingId, Arc<AsyncMutex<()>>>>,
}

impl ListingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `listing_id`. Released on drop.
    pub async fn lock(&self, listing_id: ListingId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(listing_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of listings that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
