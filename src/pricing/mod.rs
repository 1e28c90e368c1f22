//! Buy-Box pricing.
//!
//! `PricingEngine::evaluate` decides whether a listing's price should move:
//!
//! - **Holding the Buy Box**: never lower. With no competition, price at
//!   `margin_max`. Otherwise follow competitors upward by exactly the amount
//!   their floor rose since the previous snapshot, if the margin stays in
//!   bounds.
//! - **Not holding it**: undercut the Buy Box winner by the listing's step,
//!   subject to the minimum profit and margin rules.
//! - **Neither moved the price**: pull a current price whose margin is out
//!   of bounds back to the nearer bound.
//!
//! A committed change is the only write path for `listings.current_price`.
//! It also queues a price feed item and an audit record.

pub mod margin;
pub mod permission;

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::{to_millis, SharedClock};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::history::OfferHistoryStore;
use crate::locks::ListingLocks;
use crate::remote::GatedClient;
use crate::storage::{AuditChannel, PriceChangeRecord, Store};
use crate::types::{
    lowest_competitor_total, round_cents, same_price, FeedOperation, Listing, ListingId, Offer,
    OfferSnapshot, PriceFlag,
};

use margin::{margin_percent, price_for_margin, price_for_profit, profit_amount, within_bounds};
use permission::{resolve_flag, Permission};

/// Why a price was changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceReason {
    /// Only our own offer exists
    SoleOffer,
    /// We hold the Buy Box and competitors raised their floor
    CompetitorsRaised,
    /// Undercutting the Buy Box winner
    UndercutBuyBox,
    /// Undercut would drop profit below the absolute minimum
    MinAbsoluteProfit,
    /// Undercut margin exceeded the maximum
    MarginMax,
    ClampToMarginMin,
    ClampToMarginMax,
}

impl PriceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceReason::SoleOffer => "sole_offer",
            PriceReason::CompetitorsRaised => "competitors_raised",
            PriceReason::UndercutBuyBox => "undercut_buy_box",
            PriceReason::MinAbsoluteProfit => "min_absolute_profit",
            PriceReason::MarginMax => "margin_max",
            PriceReason::ClampToMarginMin => "clamp_margin_min",
            PriceReason::ClampToMarginMax => "clamp_margin_max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingDecision {
    Changed { price: f64, reason: PriceReason },
    Unchanged,
}

impl PricingDecision {
    pub fn is_changed(&self) -> bool {
        matches!(self, PricingDecision::Changed { .. })
    }

    pub fn price(&self) -> Option<f64> {
        match self {
            PricingDecision::Changed { price, .. } => Some(*price),
            PricingDecision::Unchanged => None,
        }
    }
}

/// Candidate price (unrounded) and the rule that produced it.
type Candidate = Option<(f64, PriceReason)>;

/// Locate our own offer among `offers`.
///
/// With several matches, prefer the one priced exactly like the listing;
/// otherwise take the first and give it the listing's price fields.
pub fn find_own_offer(offers: &[Offer], own_seller_id: Option<&str>, listing: &Listing) -> Option<Offer> {
    let candidates: Vec<&Offer> = offers.iter().filter(|o| o.is_own(own_seller_id)).collect();
    match candidates.as_slice() {
        [] => None,
        [only] => Some((*only).clone()),
        [first, ..] => candidates
            .iter()
            .find(|o| {
                same_price(o.price, listing.current_price)
                    && same_price(o.shipping_price, listing.current_shipping_price)
            })
            .map(|o| (*o).clone())
            .or_else(|| {
                let mut normalized = (*first).clone();
                normalized.price = listing.current_price;
                normalized.shipping_price = listing.current_shipping_price;
                Some(normalized)
            }),
    }
}

/// Pull an out-of-bounds current margin back to the nearer bound.
fn clamp_to_margin_bounds(listing: &Listing) -> Candidate {
    let ship = listing.current_shipping_price;
    let margin = margin_percent(listing.current_price, ship, listing.cost_price, listing.fee_percent)?;

    if let Some(min) = listing.margin_min {
        if margin < min {
            return price_for_margin(min, ship, listing.cost_price, listing.fee_percent)
                .map(|p| (p, PriceReason::ClampToMarginMin));
        }
    }
    if let Some(max) = listing.margin_max {
        if margin > max {
            return price_for_margin(max, ship, listing.cost_price, listing.fee_percent)
                .map(|p| (p, PriceReason::ClampToMarginMax));
        }
    }
    None
}

/// Undercut the Buy Box winner. `own` is our offer, which does not hold it.
fn change_to_get_buy_box(listing: &Listing, own: &Offer, offers: &[Offer]) -> Candidate {
    let Some(buy_box) = offers.iter().find(|o| o.is_buy_box_winner) else {
        warn!("[PRICING] {} ({}): no Buy Box winner among offers", listing.sku, listing.marketplace_id);
        return None;
    };

    // Our shipping is the listing's, as submitted in the feed.
    let ship = listing.current_shipping_price;
    let minus = (listing.undercut_step_percent * buy_box.price + buy_box.shipping_price) / 100.0;
    let mut try_price = if buy_box.total() < own.total() {
        buy_box.price + buy_box.shipping_price - ship - minus
    } else {
        // Buy Box total is not below ours yet we do not hold it: step down
        // from our own price. Only the margin rules below bound this.
        warn!(
            "[PRICING] {} ({}): Buy Box at {:.2} not below own {:.2}, stepping down from own price",
            listing.sku,
            listing.marketplace_id,
            buy_box.total(),
            own.total()
        );
        own.price - minus
    };
    if try_price <= 0.0 {
        try_price = own.price;
    }

    let (cost, fee) = (listing.cost_price, listing.fee_percent);
    let margin = margin_percent(try_price, ship, cost, fee)?;

    if let Some(min_profit) = listing.min_absolute_profit {
        if profit_amount(try_price, ship, cost, fee) < min_profit {
            let floor_price = price_for_profit(min_profit, ship, cost, fee)?;
            let floor_margin = margin_percent(floor_price, ship, cost, fee)?;
            return if listing.margin_min.map_or(true, |min| floor_margin >= min) {
                Some((floor_price, PriceReason::MinAbsoluteProfit))
            } else {
                debug!(
                    "[PRICING] {}: minimum-profit price {:.2} below margin floor",
                    listing.sku, floor_price
                );
                None
            };
        }
    }

    if let Some(min) = listing.margin_min {
        if margin > min {
            return Some((try_price, PriceReason::UndercutBuyBox));
        }
    }
    if let Some(max) = listing.margin_max {
        if margin > max {
            return price_for_margin(max, ship, cost, fee).map(|p| (p, PriceReason::MarginMax));
        }
    }
    None
}

pub struct PricingEngine {
    store: Store,
    client: Arc<GatedClient>,
    history: Arc<OfferHistoryStore>,
    locks: Arc<ListingLocks>,
    audit: AuditChannel,
    clock: SharedClock,
    price_refresh: chrono::Duration,
    offer_cache: chrono::Duration,
}

impl PricingEngine {
    pub fn new(
        store: Store,
        client: Arc<GatedClient>,
        history: Arc<OfferHistoryStore>,
        locks: Arc<ListingLocks>,
        audit: AuditChannel,
        clock: SharedClock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            client,
            history,
            locks,
            audit,
            clock,
            price_refresh: chrono::Duration::hours(config.price_refresh_hours),
            offer_cache: chrono::Duration::seconds(config.offer_cache_secs),
        }
    }

    /// Decide and, if warranted, commit a new price for the listing.
    ///
    /// Holds the listing's lock for the whole evaluation. `force_change`
    /// bypasses the change-prices flags.
    pub async fn evaluate(&self, listing_id: ListingId, force_change: bool) -> EngineResult<PricingDecision> {
        let _guard = self.locks.lock(listing_id).await;

        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| EngineError::Configuration(format!("listing {} not found", listing_id)))?;
        let backend = self.store.backend(listing.backend_id)?.ok_or_else(|| {
            EngineError::Configuration(format!(
                "listing {} references missing backend {}",
                listing_id, listing.backend_id
            ))
        })?;
        let product_flag = match listing.product_id {
            Some(product_id) => self
                .store
                .product(product_id)?
                .map_or(PriceFlag::Inherit, |p| p.change_prices),
            None => PriceFlag::Inherit,
        };

        if resolve_flag(listing.change_prices, product_flag, backend.change_prices) == Permission::Disabled
            && !force_change
        {
            debug!("[PRICING] {}: price changes disabled", listing.sku);
            return Ok(PricingDecision::Unchanged);
        }

        let listing = self.refresh_own_price(listing).await?;
        let offers = self.current_offers(&listing).await?;
        let seller_id = backend.seller_id.as_deref();

        let candidate = match find_own_offer(&offers, seller_id, &listing) {
            Some(own) if own.is_buy_box_winner => {
                self.up_price_with_buy_box(&listing, &own, &offers, seller_id)?
            }
            Some(own) => change_to_get_buy_box(&listing, &own, &offers),
            None => {
                warn!(
                    "[PRICING] {} ({}): own offer not among {} current offers",
                    listing.sku,
                    listing.marketplace_id,
                    offers.len()
                );
                None
            }
        };

        match candidate.or_else(|| clamp_to_margin_bounds(&listing)) {
            Some((price, reason)) => self.commit(&listing, price, reason),
            None => Ok(PricingDecision::Unchanged),
        }
    }

    /// Raise price while holding the Buy Box. Never lowers.
    fn up_price_with_buy_box(
        &self,
        listing: &Listing,
        own: &Offer,
        offers: &[Offer],
        seller_id: Option<&str>,
    ) -> EngineResult<Candidate> {
        let ship = listing.current_shipping_price;
        let (cost, fee) = (listing.cost_price, listing.fee_percent);

        if offers.len() == 1 {
            return Ok(listing
                .margin_max
                .and_then(|max| price_for_margin(max, ship, cost, fee))
                .map(|p| (p, PriceReason::SoleOffer)));
        }

        let snapshots = self.history.latest_n(listing.id, 2)?;
        let Some(previous) = snapshots.get(1) else {
            debug!("[PRICING] {}: no previous snapshot", listing.sku);
            return Ok(None);
        };
        let Some(last_own) = find_own_offer(&previous.offers, seller_id, listing) else {
            return Ok(None);
        };
        if last_own.total() > own.total() {
            return Ok(None);
        }

        let current_floor = lowest_competitor_total(offers, seller_id);
        let last_floor = previous.lowest_competitor_total(seller_id);
        let (Some(current_floor), Some(last_floor)) = (current_floor, last_floor) else {
            return Ok(None);
        };
        let raised = current_floor - last_floor;
        if raised <= 0.0 {
            return Ok(None);
        }

        let try_price = listing.current_price + raised - (own.total() - last_own.total());
        if try_price <= listing.current_price {
            return Ok(None);
        }
        Ok(margin_percent(try_price, ship, cost, fee)
            .filter(|m| within_bounds(*m, listing.margin_min, listing.margin_max))
            .map(|_| (try_price, PriceReason::CompetitorsRaised)))
    }

    /// Re-read own price and fee when the stored values are older than the
    /// refresh interval.
    async fn refresh_own_price(&self, mut listing: Listing) -> EngineResult<Listing> {
        let now = self.clock.now();
        let stale = listing
            .last_price_refresh_at
            .map_or(true, |at| now - at > self.price_refresh);
        if !stale {
            return Ok(listing);
        }

        let own = self.client.get_own_price(&listing).await?;
        let differs = !same_price(own.price, listing.current_price)
            || !same_price(own.shipping_price, listing.current_shipping_price)
            || (own.fee_percent - listing.fee_percent).abs() > f64::EPSILON;

        if differs {
            info!(
                "[PRICING] {}: refreshed own price {:.2}+{:.2} fee {:.1}%",
                listing.sku, own.price, own.shipping_price, own.fee_percent
            );
            self.store.write_listing_refresh(
                listing.id,
                own.price,
                own.shipping_price,
                own.fee_percent,
                now,
            )?;
            listing.current_price = own.price;
            listing.current_shipping_price = own.shipping_price;
            listing.fee_percent = own.fee_percent;
        } else {
            self.store.touch_listing_refresh(listing.id, now)?;
        }
        listing.last_price_refresh_at = Some(now);
        Ok(listing)
    }

    /// Newest snapshot if fresh enough, else a remote fetch recorded as a
    /// new snapshot.
    async fn current_offers(&self, listing: &Listing) -> EngineResult<Vec<Offer>> {
        let now = self.clock.now();
        if let Some(newest) = self.history.latest_n(listing.id, 1)?.into_iter().next() {
            if now - newest.captured_at < self.offer_cache {
                return Ok(newest.offers);
            }
        }

        let offers = self.client.get_current_offers(listing).await?;
        if !offers.is_empty() {
            self.history
                .record(&OfferSnapshot::new(listing.id, now, offers.clone(), None))?;
        }
        Ok(offers)
    }

    fn commit(&self, listing: &Listing, price: f64, reason: PriceReason) -> EngineResult<PricingDecision> {
        let price = round_cents(price);
        if price <= 0.0 || same_price(price, listing.current_price) {
            debug!("[PRICING] {}: {} leaves price at {:.2}", listing.sku, reason.as_str(), listing.current_price);
            return Ok(PricingDecision::Unchanged);
        }

        self.store
            .write_listing_price(listing.id, price, listing.current_shipping_price)?;
        self.enqueue_feed(listing, price)?;

        let now = self.clock.now();
        self.audit.record_price_change(PriceChangeRecord {
            listing_id: listing.id,
            sku: listing.sku.clone(),
            marketplace_id: listing.marketplace_id.clone(),
            old_price: listing.current_price,
            new_price: price,
            shipping_price: listing.current_shipping_price,
            reason: reason.as_str().to_string(),
            changed_at_ms: to_millis(now),
        });

        info!(
            "[PRICING] {} ({}): {:.2} -> {:.2} [{}]",
            listing.sku,
            listing.marketplace_id,
            listing.current_price,
            price,
            reason.as_str()
        );
        Ok(PricingDecision::Changed { price, reason })
    }

    /// Queue the price feed item for a committed change.
    pub fn enqueue_feed(&self, listing: &Listing, price: f64) -> EngineResult<i64> {
        let payload = json!({
            "sku": listing.sku,
            "price": price,
            "shipping_price": listing.current_shipping_price,
            "currency": listing.currency,
        });
        self.store.insert_feed_item(
            &listing.marketplace_id,
            &listing.sku,
            FeedOperation::Price,
            &payload,
            self.clock.now(),
        )
    }
}
