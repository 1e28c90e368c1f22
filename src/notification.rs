//! "Any offer changed" notification payload.
//!
//! The body follows the marketplace notification shape:
//!
//! ```json
//! {
//!   "NotificationType": "ANY_OFFER_CHANGED",
//!   "Payload": { "AnyOfferChangedNotification": {
//!     "SellerId": "...",
//!     "OfferChangeTrigger": { "MarketplaceId", "ASIN", "ItemCondition", "TimeOfOfferChange" },
//!     "Summary": { "LowestPrices": [...] },
//!     "Offers": [...]
//!   } }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::{EngineError, EngineResult};
use crate::types::{same_price, Offer};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    #[serde(default)]
    notification_type: Option<String>,
    payload: Payload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Payload {
    any_offer_changed_notification: AnyOfferChanged,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AnyOfferChanged {
    #[serde(default)]
    seller_id: Option<String>,
    offer_change_trigger: OfferChangeTrigger,
    #[serde(default)]
    summary: Summary,
    #[serde(default)]
    offers: Vec<RawOffer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OfferChangeTrigger {
    marketplace_id: String,
    #[serde(rename = "ASIN")]
    asin: String,
    #[serde(default)]
    item_condition: Option<String>,
    time_of_offer_change: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Summary {
    #[serde(default)]
    lowest_prices: Vec<LowestPrice>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LowestPrice {
    condition: String,
    #[serde(default)]
    fulfillment_channel: Option<String>,
    #[serde(default)]
    landed_price: Option<Money>,
    listing_price: Money,
    #[serde(default)]
    shipping: Option<Money>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Money {
    amount: f64,
    currency_code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOffer {
    seller_id: String,
    #[serde(default)]
    sub_condition: Option<String>,
    #[serde(default)]
    seller_feedback_rating: Option<FeedbackRating>,
    listing_price: Money,
    #[serde(default)]
    shipping: Option<Money>,
    #[serde(default)]
    ships_from: Option<ShipsFrom>,
    #[serde(default)]
    is_fulfilled_by_amazon: bool,
    #[serde(default)]
    is_buy_box_winner: bool,
    #[serde(default)]
    prime_information: Option<PrimeInformation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FeedbackRating {
    #[serde(default)]
    seller_positive_feedback_rating: Option<f64>,
    #[serde(default)]
    feedback_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShipsFrom {
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PrimeInformation {
    #[serde(default)]
    is_prime: bool,
}

/// Lowest landed price per condition, from the notification summary.
#[derive(Debug, Clone, PartialEq)]
pub struct LowestLanded {
    pub condition: String,
    pub fulfillment_channel: Option<String>,
    pub landed_price: f64,
}

/// One offer as it appeared in the notification, before ownership and
/// lowest-price flags are known.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferEntry {
    pub seller_id: String,
    pub condition: String,
    pub price: f64,
    pub shipping_price: f64,
    pub currency: String,
    pub is_buy_box_winner: bool,
    pub is_fulfilled_by_remote: bool,
    pub feedback_rating: Option<f64>,
    pub feedback_count: Option<u64>,
    pub ship_country: Option<String>,
    pub is_prime: bool,
}

/// Structured content of an offer-change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNotification {
    /// Seller the notification was delivered to
    pub seller_id: Option<String>,
    pub marketplace_id: String,
    pub asin: String,
    pub item_condition: Option<String>,
    pub change_time: DateTime<Utc>,
    pub offers: Vec<OfferEntry>,
    pub lowest_landed: Vec<LowestLanded>,
}

/// Parse a notification body. Anything that does not decode is a
/// `MalformedMessage`.
pub fn parse(body: &str) -> EngineResult<ParsedNotification> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| EngineError::MalformedMessage(e.to_string()))?;

    if let Some(kind) = envelope.notification_type.as_deref() {
        if !kind.eq_ignore_ascii_case("ANY_OFFER_CHANGED") {
            return Err(EngineError::MalformedMessage(format!(
                "unexpected notification type '{}'",
                kind
            )));
        }
    }

    let notification = envelope.payload.any_offer_changed_notification;
    let trigger = notification.offer_change_trigger;
    if trigger.asin.trim().is_empty() || trigger.marketplace_id.trim().is_empty() {
        return Err(EngineError::MalformedMessage(
            "offer change trigger without ASIN or marketplace".into(),
        ));
    }

    let lowest_landed = notification
        .summary
        .lowest_prices
        .iter()
        .map(|lp| LowestLanded {
            condition: lp.condition.to_lowercase(),
            fulfillment_channel: lp.fulfillment_channel.clone(),
            landed_price: lp.landed_price.as_ref().map_or_else(
                || lp.listing_price.amount + lp.shipping.as_ref().map_or(0.0, |s| s.amount),
                |m| m.amount,
            ),
        })
        .collect();

    let item_condition = trigger.item_condition.as_ref().map(|c| c.to_lowercase());

    let offers = notification
        .offers
        .into_iter()
        .map(|raw| OfferEntry {
            condition: item_condition
                .clone()
                .or_else(|| raw.sub_condition.as_ref().map(|c| c.to_lowercase()))
                .unwrap_or_else(|| "new".to_string()),
            seller_id: raw.seller_id,
            price: raw.listing_price.amount,
            shipping_price: raw.shipping.as_ref().map_or(0.0, |s| s.amount),
            currency: raw.listing_price.currency_code,
            is_buy_box_winner: raw.is_buy_box_winner,
            is_fulfilled_by_remote: raw.is_fulfilled_by_amazon,
            feedback_rating: raw
                .seller_feedback_rating
                .as_ref()
                .and_then(|r| r.seller_positive_feedback_rating),
            feedback_count: raw.seller_feedback_rating.as_ref().and_then(|r| r.feedback_count),
            ship_country: raw.ships_from.and_then(|s| s.country),
            is_prime: raw.prime_information.map_or(false, |p| p.is_prime),
        })
        .collect();

    Ok(ParsedNotification {
        seller_id: notification.seller_id,
        marketplace_id: trigger.marketplace_id,
        asin: trigger.asin,
        item_condition,
        change_time: trigger.time_of_offer_change,
        offers,
        lowest_landed,
    })
}

impl ParsedNotification {
    /// Lowest landed price for `condition`, or across all conditions when
    /// the summary has no entry for it.
    pub fn lowest_landed_price(&self, condition: &str) -> Option<f64> {
        let matching = self
            .lowest_landed
            .iter()
            .filter(|lp| lp.condition.eq_ignore_ascii_case(condition))
            .map(|lp| lp.landed_price)
            .reduce(f64::min);

        matching.or_else(|| self.lowest_landed.iter().map(|lp| lp.landed_price).reduce(f64::min))
    }

    /// Build snapshot offers, flagging those that belong to `own_seller_id`
    /// and those at the summary's lowest landed price.
    pub fn to_offers(&self, own_seller_id: &str) -> Vec<Offer> {
        self.offers
            .iter()
            .map(|entry| {
                let total = entry.price + entry.shipping_price;
                let is_lowest_price = self
                    .lowest_landed_price(&entry.condition)
                    .map_or(false, |lowest| same_price(total, lowest));
                Offer {
                    seller_id: entry.seller_id.clone(),
                    is_own_offer: entry.seller_id == own_seller_id,
                    condition: entry.condition.clone(),
                    price: entry.price,
                    shipping_price: entry.shipping_price,
                    currency: entry.currency.clone(),
                    is_buy_box_winner: entry.is_buy_box_winner,
                    is_fulfilled_by_remote: entry.is_fulfilled_by_remote,
                    is_lowest_price,
                    feedback_rating: entry.feedback_rating,
                    feedback_count: entry.feedback_count,
                    ship_country: entry.ship_country.clone(),
                    is_prime: entry.is_prime,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "NotificationType": "ANY_OFFER_CHANGED",
        "Payload": {
            "AnyOfferChangedNotification": {
                "SellerId": "ME",
                "OfferChangeTrigger": {
                    "MarketplaceId": "A1PA6795UKMFR9",
                    "ASIN": "B000TEST01",
                    "ItemCondition": "New",
                    "TimeOfOfferChange": "2024-01-01T10:00:00Z"
                },
                "Summary": {
                    "LowestPrices": [
                        {"Condition": "new", "FulfillmentChannel": "Merchant",
                         "LandedPrice": {"Amount": 93.0, "CurrencyCode": "EUR"},
                         "ListingPrice": {"Amount": 90.0, "CurrencyCode": "EUR"},
                         "Shipping": {"Amount": 3.0, "CurrencyCode": "EUR"}}
                    ],
                    "BuyBoxPrices": [
                        {"Condition": "New", "LandedPrice": {"Amount": 93.0, "CurrencyCode": "EUR"}}
                    ]
                },
                "Offers": [
                    {"SellerId": "ME", "SubCondition": "new",
                     "ListingPrice": {"Amount": 100.0, "CurrencyCode": "EUR"},
                     "Shipping": {"Amount": 5.0, "CurrencyCode": "EUR"},
                     "IsFulfilledByAmazon": false, "IsBuyBoxWinner": false},
                    {"SellerId": "RIVAL", "SubCondition": "new",
                     "SellerFeedbackRating": {"SellerPositiveFeedbackRating": 98.0, "FeedbackCount": 1200},
                     "ListingPrice": {"Amount": 90.0, "CurrencyCode": "EUR"},
                     "Shipping": {"Amount": 3.0, "CurrencyCode": "EUR"},
                     "ShipsFrom": {"Country": "DE"},
                     "IsFulfilledByAmazon": true, "IsBuyBoxWinner": true,
                     "PrimeInformation": {"IsPrime": true}}
                ]
            }
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let parsed = parse(SAMPLE).unwrap();
        assert_eq!(parsed.asin, "B000TEST01");
        assert_eq!(parsed.marketplace_id, "A1PA6795UKMFR9");
        assert_eq!(parsed.offers.len(), 2);
        assert_eq!(parsed.lowest_landed_price("new"), Some(93.0));
        // No summary entry for "used": fall back to any condition
        assert_eq!(parsed.lowest_landed_price("used"), Some(93.0));
    }

    #[test]
    fn test_to_offers_flags() {
        let offers = parse(SAMPLE).unwrap().to_offers("ME");
        let own = offers.iter().find(|o| o.seller_id == "ME").unwrap();
        let rival = offers.iter().find(|o| o.seller_id == "RIVAL").unwrap();

        assert!(own.is_own_offer);
        assert!(!own.is_lowest_price);
        assert!(!rival.is_own_offer);
        assert!(rival.is_lowest_price);
        assert!(rival.is_buy_box_winner);
        assert!(rival.is_prime);
        assert_eq!(rival.feedback_count, Some(1200));
        assert_eq!(rival.ship_country.as_deref(), Some("DE"));
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(parse("not json"), Err(EngineError::MalformedMessage(_))));
        assert!(matches!(parse(r#"{"Payload": {}}"#), Err(EngineError::MalformedMessage(_))));

        let wrong_type = SAMPLE.replace("ANY_OFFER_CHANGED", "FEED_PROCESSING_FINISHED");
        assert!(matches!(parse(&wrong_type), Err(EngineError::MalformedMessage(_))));
    }
}
