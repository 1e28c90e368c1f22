//! Core domain types for the repricing engine.
//!
//! Listings, offers and snapshots, the inbound message and pending-feed
//! records, and the quota policy configuration.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row id of a listing in the catalog store.
pub type ListingId = i64;

/// Two prices closer than this are considered equal.
pub const PRICE_EPSILON: f64 = 0.005;

/// Round a money amount to cents.
#[inline]
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Compare two money amounts at cent precision.
#[inline]
pub fn same_price(a: f64, b: f64) -> bool {
    (a - b).abs() < PRICE_EPSILON
}

// === Permission flags ===

/// Tri-state "change prices" flag stored on listings, products and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PriceFlag {
    /// Explicit `'1'`
    Enabled,
    /// Explicit `'0'`
    Disabled,
    /// No value set; defer to the next level up
    #[default]
    Inherit,
}

impl PriceFlag {
    /// Decode the storage representation (`'1'`, `'0'`, NULL / empty).
    pub fn from_db(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("1") => PriceFlag::Enabled,
            Some("0") => PriceFlag::Disabled,
            _ => PriceFlag::Inherit,
        }
    }

    pub fn as_db(&self) -> Option<&'static str> {
        match self {
            PriceFlag::Enabled => Some("1"),
            PriceFlag::Disabled => Some("0"),
            PriceFlag::Inherit => None,
        }
    }
}

// === Quota policies ===

/// Unit of a quota policy's long window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
    #[serde(alias = "sec", alias = "seconds")]
    Second,
    #[serde(alias = "min", alias = "minutes")]
    Minute,
    #[serde(alias = "hours")]
    Hour,
    #[serde(alias = "days")]
    Day,
}

impl WindowUnit {
    /// Seconds per unit.
    pub fn factor(&self) -> i64 {
        match self {
            WindowUnit::Second => 1,
            WindowUnit::Minute => 60,
            WindowUnit::Hour => 3_600,
            WindowUnit::Day => 86_400,
        }
    }
}

/// Coarse second window of a quota policy (e.g. "200 requests per hour").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongWindow {
    /// Maximum requests admitted inside one long window
    pub max_requests: u32,
    /// Window length in `unit`s
    pub size: u32,
    pub unit: WindowUnit,
}

impl LongWindow {
    pub fn length_secs(&self) -> i64 {
        self.size as i64 * self.unit.factor()
    }
}

/// Named rate-limit rule enforced by the marketplace per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub name: String,
    /// Capacity of the short (burst) window
    pub max_quota: u32,
    /// Seconds for the short window to replenish
    pub restore_rate: f64,
    #[serde(default)]
    pub long_window: Option<LongWindow>,
}

impl QuotaPolicy {
    pub fn new(name: &str, max_quota: u32, restore_rate: f64) -> Self {
        Self {
            name: name.to_string(),
            max_quota,
            restore_rate,
            long_window: None,
        }
    }

    pub fn with_long_window(mut self, max_requests: u32, size: u32, unit: WindowUnit) -> Self {
        self.long_window = Some(LongWindow { max_requests, size, unit });
        self
    }

    /// Number of recent requests examined by the short window:
    /// `max_quota - ceil(max_quota / 3)`, never less than one.
    pub fn short_window_len(&self) -> u32 {
        let reserve = self.max_quota.div_ceil(3);
        self.max_quota.saturating_sub(reserve).max(1)
    }
}

// === Offers ===

/// One seller's offer on a listing at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub seller_id: String,
    pub is_own_offer: bool,
    pub condition: String,
    pub price: f64,
    pub shipping_price: f64,
    pub currency: String,
    pub is_buy_box_winner: bool,
    pub is_fulfilled_by_remote: bool,
    pub is_lowest_price: bool,
    pub feedback_rating: Option<f64>,
    pub feedback_count: Option<u64>,
    pub ship_country: Option<String>,
    pub is_prime: bool,
}

impl Offer {
    /// Landed price: item price plus shipping.
    #[inline]
    pub fn total(&self) -> f64 {
        self.price + self.shipping_price
    }

    /// Own offer: flagged as such, or carrying the account's seller id.
    pub fn is_own(&self, own_seller_id: Option<&str>) -> bool {
        self.is_own_offer || own_seller_id.map_or(false, |s| self.seller_id == s)
    }
}

/// Lowest landed price among offers that are not our own.
pub fn lowest_competitor_total(offers: &[Offer], own_seller_id: Option<&str>) -> Option<f64> {
    offers
        .iter()
        .filter(|o| !o.is_own(own_seller_id))
        .map(Offer::total)
        .reduce(f64::min)
}

/// All offers captured for one listing at one notification instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferSnapshot {
    pub listing_id: ListingId,
    pub captured_at: DateTime<Utc>,
    pub offers: Vec<Offer>,
    pub source_message_id: Option<String>,
}

impl OfferSnapshot {
    pub fn new(
        listing_id: ListingId,
        captured_at: DateTime<Utc>,
        offers: Vec<Offer>,
        source_message_id: Option<String>,
    ) -> Self {
        Self {
            listing_id,
            captured_at,
            offers,
            source_message_id,
        }
    }

    /// Lowest landed price among competitor offers.
    pub fn lowest_competitor_total(&self, own_seller_id: Option<&str>) -> Option<f64> {
        lowest_competitor_total(&self.offers, own_seller_id)
    }
}

// === Catalog ===

/// Seller account on the marketplace (the "backend").
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub id: i64,
    pub name: String,
    pub seller_id: Option<String>,
    pub change_prices: PriceFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub change_prices: PriceFlag,
}

/// A seller SKU on one marketplace together with its pricing configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub id: ListingId,
    pub backend_id: i64,
    pub product_id: Option<i64>,
    pub marketplace_id: String,
    pub sku: String,
    pub asin: String,
    pub currency: String,
    pub current_price: f64,
    pub current_shipping_price: f64,
    /// Unit cost used to compute the profit of a candidate price
    pub cost_price: f64,
    pub margin_min: Option<f64>,
    pub margin_max: Option<f64>,
    pub min_absolute_profit: Option<f64>,
    pub undercut_step_percent: f64,
    pub fee_percent: f64,
    pub last_price_refresh_at: Option<DateTime<Utc>>,
    pub change_prices: PriceFlag,
}

impl Listing {
    #[inline]
    pub fn total(&self) -> f64 {
        self.current_price + self.current_shipping_price
    }
}

/// Listing fields needed to register a new SKU.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub backend_id: i64,
    pub product_id: Option<i64>,
    pub marketplace_id: String,
    pub sku: String,
    pub asin: String,
    pub currency: String,
    pub current_price: f64,
    pub current_shipping_price: f64,
    pub cost_price: f64,
    pub margin_min: Option<f64>,
    pub margin_max: Option<f64>,
    pub min_absolute_profit: Option<f64>,
    pub undercut_step_percent: f64,
    pub fee_percent: f64,
    pub change_prices: PriceFlag,
}

/// Own price / fee as reported by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OwnPrice {
    pub price: f64,
    pub shipping_price: f64,
    pub fee_percent: f64,
}

// === Inbound messages ===

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Local row id; several rows may share one `message_id`
    pub id: i64,
    pub message_id: String,
    pub body: String,
    pub processed: bool,
    pub deleted_upstream: bool,
    pub marked_for_deletion: bool,
    pub received_at: DateTime<Utc>,
}

// === Feeds ===

/// Kind of bulk change carried by a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOperation {
    Price,
    Inventory,
    Shipment,
}

impl FeedOperation {
    pub const ALL: [FeedOperation; 3] = [
        FeedOperation::Price,
        FeedOperation::Inventory,
        FeedOperation::Shipment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedOperation::Price => "price",
            FeedOperation::Inventory => "inventory",
            FeedOperation::Shipment => "shipment",
        }
    }
}

impl fmt::Display for FeedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price" => Ok(FeedOperation::Price),
            "inventory" => Ok(FeedOperation::Inventory),
            "shipment" => Ok(FeedOperation::Shipment),
            other => Err(format!("unknown feed operation '{}'", other)),
        }
    }
}

/// A change request waiting to be batched into a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFeedItem {
    pub id: i64,
    pub marketplace_id: String,
    pub sku: String,
    pub operation: FeedOperation,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub submission_id: Option<String>,
}

/// One line of a bulk feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub sku: String,
    pub payload: serde_json::Value,
}

/// Bulk payload for one marketplace. Rendering it into the marketplace's
/// wire format is the remote client's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedDocument {
    pub marketplace_id: String,
    pub operation: FeedOperation,
    pub entries: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    InProgress,
    Done,
    Cancelled,
}

impl ReportStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, ReportStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::InProgress => "in_progress",
            ReportStatus::Done => "done",
            ReportStatus::Cancelled => "cancelled",
        }
    }
}

/// Processing report for a submitted feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub submission_id: String,
    pub status: ReportStatus,
    pub messages_processed: u32,
    pub messages_successful: u32,
    pub messages_with_error: u32,
    pub raw: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_window_len() {
        assert_eq!(QuotaPolicy::new("p", 10, 60.0).short_window_len(), 6);
        assert_eq!(QuotaPolicy::new("p", 20, 60.0).short_window_len(), 13);
        assert_eq!(QuotaPolicy::new("p", 3, 60.0).short_window_len(), 2);
        // Degenerate capacity still examines one record
        assert_eq!(QuotaPolicy::new("p", 1, 60.0).short_window_len(), 1);
    }

    #[test]
    fn test_price_flag_db_roundtrip() {
        assert_eq!(PriceFlag::from_db(Some("1")), PriceFlag::Enabled);
        assert_eq!(PriceFlag::from_db(Some("0")), PriceFlag::Disabled);
        assert_eq!(PriceFlag::from_db(Some("")), PriceFlag::Inherit);
        assert_eq!(PriceFlag::from_db(None), PriceFlag::Inherit);
        assert_eq!(PriceFlag::Disabled.as_db(), Some("0"));
    }

    #[test]
    fn test_lowest_competitor_total_ignores_own() {
        let mk = |own: bool, seller: &str, price: f64| Offer {
            seller_id: seller.into(),
            is_own_offer: own,
            condition: "new".into(),
            price,
            shipping_price: 1.0,
            currency: "EUR".into(),
            is_buy_box_winner: false,
            is_fulfilled_by_remote: false,
            is_lowest_price: false,
            feedback_rating: None,
            feedback_count: None,
            ship_country: None,
            is_prime: false,
        };
        let offers = vec![mk(true, "ME", 5.0), mk(false, "X", 9.0), mk(false, "Y", 7.0), mk(false, "ME", 4.0)];
        let snap = OfferSnapshot::new(1, Utc::now(), offers, None);
        assert_eq!(snap.lowest_competitor_total(None), Some(5.0));
        // Unflagged offer carrying our seller id is still ours
        assert_eq!(snap.lowest_competitor_total(Some("ME")), Some(8.0));
    }

    #[test]
    fn test_feed_operation_parse() {
        assert_eq!("price".parse::<FeedOperation>(), Ok(FeedOperation::Price));
        assert!("bogus".parse::<FeedOperation>().is_err());
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(round_cents(87.0700000001), 87.07);
        assert_eq!(round_cents(10.005_1), 10.01);
    }
}
