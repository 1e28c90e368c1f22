//! Storage record types.

use chrono::{DateTime, Utc};

use crate::types::{FeedOperation, ListingId};

/// Audit record for a committed price change
#[derive(Debug, Clone)]
pub struct PriceChangeRecord {
    pub listing_id: ListingId,
    pub sku: String,
    pub marketplace_id: String,
    pub old_price: f64,
    pub new_price: f64,
    pub shipping_price: f64,
    /// Which pricing path produced the change ("sole_offer", "raise_with_buy_box", ...)
    pub reason: String,
    pub changed_at_ms: i64,
}

/// Audit record for a feed submission
#[derive(Debug, Clone)]
pub struct SubmissionAuditRecord {
    pub submission_id: String,
    pub marketplace_id: String,
    pub operation: String,
    /// Items in the submitted payload (after last-write-wins dedup)
    pub submitted_items: u32,
    /// Original items marked consumed, superseded duplicates included
    pub consumed_items: u32,
    pub submitted_at_ms: i64,
}

/// Receipt of a feed submission, with its processing report once fetched
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSubmission {
    pub submission_id: String,
    pub marketplace_id: String,
    pub operation: FeedOperation,
    pub item_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub status: String,
    pub report: Option<String>,
    pub report_fetched_at: Option<DateTime<Utc>>,
}
