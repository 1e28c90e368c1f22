//! Marketplace client boundary.
//!
//! `RemoteOfferClient` is the narrow interface the engine needs from the
//! marketplace API. The engine never calls it directly: every call goes
//! through `GatedClient`, which takes a quota slot first, applies the
//! request timeout, and turns a remote throttle into a forced cooldown.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::{to_millis, SharedClock};
use crate::errors::{EngineError, EngineResult, RemoteError};
use crate::quota::{
    QuotaController, POLICY_FEED_RESULT, POLICY_GET_MY_PRICE, POLICY_GET_OFFERS, POLICY_SUBMIT_FEED,
};
use crate::storage::Store;
use crate::types::{FeedDocument, Listing, Offer, OwnPrice, ReportStatus, SubmissionReport};

#[async_trait]
pub trait RemoteOfferClient: Send + Sync {
    /// Current offers on the listing's catalog item, own offer included.
    async fn get_current_offers(&self, listing: &Listing) -> Result<Vec<Offer>, RemoteError>;

    /// Own price, shipping and fee as the marketplace currently sees them.
    async fn get_own_price(&self, listing: &Listing) -> Result<OwnPrice, RemoteError>;

    /// Submit a bulk feed. Returns the marketplace's submission id.
    async fn submit_feed(&self, document: &FeedDocument) -> Result<String, RemoteError>;

    async fn get_submission_report(&self, submission_id: &str) -> Result<SubmissionReport, RemoteError>;
}

/// Quota account for listing-level calls: the owning backend.
pub fn listing_account(listing: &Listing) -> String {
    listing.backend_id.to_string()
}

/// Quota-gated, time-bounded wrapper around a `RemoteOfferClient`.
pub struct GatedClient {
    inner: Arc<dyn RemoteOfferClient>,
    quota: Arc<QuotaController>,
    timeout: Duration,
}

impl GatedClient {
    pub fn new(inner: Arc<dyn RemoteOfferClient>, quota: Arc<QuotaController>, timeout: Duration) -> Self {
        Self { inner, quota, timeout }
    }

    pub fn quota(&self) -> &Arc<QuotaController> {
        &self.quota
    }

    async fn call<T, F, Fut>(&self, policy: &str, account: &str, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.quota.acquire(policy, account)?;

        match tokio::time::timeout(self.timeout, f()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RemoteError::Throttled)) => {
                let retry_after = self.quota.force_throttle_window(policy, account)?;
                Err(EngineError::Throttled { retry_after })
            }
            Ok(Err(RemoteError::Transient(msg))) => {
                warn!("[REMOTE] {} failed for account {}: {}", policy, account, msg);
                Err(EngineError::TransientRemote(msg))
            }
            Ok(Err(RemoteError::Rejected(msg))) => {
                warn!("[REMOTE] {} rejected for account {}: {}", policy, account, msg);
                Err(EngineError::RemoteRejected(msg))
            }
            Err(_) => Err(EngineError::TransientRemote(format!(
                "{} timed out after {}s",
                policy,
                self.timeout.as_secs()
            ))),
        }
    }

    pub async fn get_current_offers(&self, listing: &Listing) -> EngineResult<Vec<Offer>> {
        let account = listing_account(listing);
        self.call(POLICY_GET_OFFERS, &account, || self.inner.get_current_offers(listing))
            .await
    }

    pub async fn get_own_price(&self, listing: &Listing) -> EngineResult<OwnPrice> {
        let account = listing_account(listing);
        self.call(POLICY_GET_MY_PRICE, &account, || self.inner.get_own_price(listing))
            .await
    }

    /// Feed quotas are tracked per marketplace.
    pub async fn submit_feed(&self, document: &FeedDocument) -> EngineResult<String> {
        self.call(POLICY_SUBMIT_FEED, &document.marketplace_id, || {
            self.inner.submit_feed(document)
        })
        .await
    }

    pub async fn get_submission_report(
        &self,
        marketplace_id: &str,
        submission_id: &str,
    ) -> EngineResult<SubmissionReport> {
        self.call(POLICY_FEED_RESULT, marketplace_id, || {
            self.inner.get_submission_report(submission_id)
        })
        .await
    }
}

/// Client used when no live marketplace connection is configured.
///
/// Offers come from stored history, the own price from the stored listing,
/// and feeds are logged and acknowledged with a local id.
pub struct DryRunClient {
    store: Store,
    clock: SharedClock,
    submissions: AtomicU64,
}

impl DryRunClient {
    pub fn new(store: Store, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            submissions: AtomicU64::new(0),
        }
    }
}

fn storage_failure(e: EngineError) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

#[async_trait]
impl RemoteOfferClient for DryRunClient {
    async fn get_current_offers(&self, listing: &Listing) -> Result<Vec<Offer>, RemoteError> {
        let latest = self
            .store
            .latest_snapshots(listing.id, 1)
            .map_err(storage_failure)?;
        Ok(latest.into_iter().next().map(|s| s.offers).unwrap_or_default())
    }

    async fn get_own_price(&self, listing: &Listing) -> Result<OwnPrice, RemoteError> {
        Ok(OwnPrice {
            price: listing.current_price,
            shipping_price: listing.current_shipping_price,
            fee_percent: listing.fee_percent,
        })
    }

    async fn submit_feed(&self, document: &FeedDocument) -> Result<String, RemoteError> {
        let seq = self.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        let submission_id = format!("DRY-{}-{}", to_millis(self.clock.now()), seq);
        info!(
            "[REMOTE] DRY RUN {} feed for {}: {} entries -> {}",
            document.operation,
            document.marketplace_id,
            document.entries.len(),
            submission_id
        );
        Ok(submission_id)
    }

    async fn get_submission_report(&self, submission_id: &str) -> Result<SubmissionReport, RemoteError> {
        let items = self
            .store
            .submission(submission_id)
            .map_err(storage_failure)?
            .map_or(0, |s| s.item_count);
        Ok(SubmissionReport {
            submission_id: submission_id.to_string(),
            status: ReportStatus::Done,
            messages_processed: items,
            messages_successful: items,
            messages_with_error: 0,
            raw: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::QuotaPolicyRegistry;
    use crate::types::{PriceFlag, QuotaPolicy};
    use std::sync::Mutex;

    struct ScriptedClient {
        own_price: Mutex<Vec<Result<OwnPrice, RemoteError>>>,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteOfferClient for ScriptedClient {
        async fn get_current_offers(&self, _listing: &Listing) -> Result<Vec<Offer>, RemoteError> {
            Ok(vec![])
        }

        async fn get_own_price(&self, _listing: &Listing) -> Result<OwnPrice, RemoteError> {
            tokio::time::sleep(self.delay).await;
            self.own_price.lock().unwrap().remove(0)
        }

        async fn submit_feed(&self, _document: &FeedDocument) -> Result<String, RemoteError> {
            Ok("S-1".into())
        }

        async fn get_submission_report(&self, _id: &str) -> Result<SubmissionReport, RemoteError> {
            Err(RemoteError::Rejected("unknown".into()))
        }
    }

    fn listing() -> Listing {
        Listing {
            id: 1,
            backend_id: 7,
            product_id: None,
            marketplace_id: "M1".into(),
            sku: "SKU".into(),
            asin: "B0".into(),
            currency: "EUR".into(),
            current_price: 10.0,
            current_shipping_price: 0.0,
            cost_price: 5.0,
            margin_min: None,
            margin_max: None,
            min_absolute_profit: None,
            undercut_step_percent: 1.0,
            fee_percent: 15.0,
            last_price_refresh_at: None,
            change_prices: PriceFlag::Inherit,
        }
    }

    fn gated(script: Vec<Result<OwnPrice, RemoteError>>, delay: Duration) -> GatedClient {
        let mut registry = QuotaPolicyRegistry::defaults();
        registry.insert(QuotaPolicy::new(POLICY_GET_MY_PRICE, 10, 3.0));
        let quota = QuotaController::new(
            Store::open_in_memory().unwrap(),
            registry,
            Arc::new(ManualClock::at_epoch()),
        );
        let inner = ScriptedClient {
            own_price: Mutex::new(script),
            delay,
        };
        GatedClient::new(Arc::new(inner), Arc::new(quota), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_remote_throttle_forces_cooldown() {
        let own = OwnPrice { price: 1.0, shipping_price: 0.0, fee_percent: 15.0 };
        let client = gated(vec![Err(RemoteError::Throttled), Ok(own)], Duration::ZERO);

        let err = client.get_own_price(&listing()).await.unwrap_err();
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(4)));

        // The window is now full: the second call never reaches the remote
        let err = client.get_own_price(&listing()).await.unwrap_err();
        assert!(matches!(err, EngineError::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let own = OwnPrice { price: 1.0, shipping_price: 0.0, fee_percent: 15.0 };
        let client = gated(vec![Ok(own)], Duration::from_millis(500));
        let err = client.get_own_price(&listing()).await.unwrap_err();
        assert!(matches!(err, EngineError::TransientRemote(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let client = gated(vec![], Duration::ZERO);
        let err = client.get_submission_report("M1", "S-404").await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteRejected(_)));
        assert!(!err.is_retryable());
    }
}
