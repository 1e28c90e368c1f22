//! Quota controller for marketplace API calls.
//!
//! Every remote call is gated by a named policy and the account it is made
//! for. The controller is an approximate dual sliding window over the
//! persisted request log:
//!
//! 1. Short window: look at the `max_quota - ceil(max_quota / 3)` most recent
//!    requests; if the oldest of them is younger than `restore_rate` seconds,
//!    the window is exhausted.
//! 2. Long window (optional): same check against `max_requests` records over
//!    `size * unit` seconds.
//! 3. Otherwise the request is logged and admitted.
//!
//! `try_acquire` never blocks. A refused caller gets the delay back and is
//! responsible for rescheduling itself.

use std::path::Path;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::errors::{EngineError, EngineResult};
use crate::storage::requests::{append_requests, recent_requests};
use crate::storage::Store;
use crate::types::{QuotaPolicy, WindowUnit};

/// Own price and fee lookup
pub const POLICY_GET_MY_PRICE: &str = "GetMyPriceForSKU";
/// Competitor offers lookup
pub const POLICY_GET_OFFERS: &str = "GetLowestPricedOffersForSKU";
pub const POLICY_SUBMIT_FEED: &str = "SubmitFeed";
pub const POLICY_FEED_RESULT: &str = "GetFeedSubmissionResult";

/// Set of configured quota policies, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct QuotaPolicyRegistry {
    policies: FxHashMap<String, QuotaPolicy>,
}

impl QuotaPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policies for every remote operation the engine issues.
    pub fn defaults() -> Self {
        let mut registry = Self::new();
        registry.insert(
            QuotaPolicy::new(POLICY_GET_MY_PRICE, 20, 1.0)
                .with_long_window(36_000, 1, WindowUnit::Hour),
        );
        registry.insert(
            QuotaPolicy::new(POLICY_GET_OFFERS, 10, 1.0)
                .with_long_window(200, 1, WindowUnit::Hour),
        );
        registry.insert(QuotaPolicy::new(POLICY_SUBMIT_FEED, 15, 120.0));
        registry.insert(QuotaPolicy::new(POLICY_FEED_RESULT, 15, 60.0));
        registry
    }

    /// Built-in defaults overlaid with the policies of a JSON file
    /// (an array of `QuotaPolicy` objects).
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read quota policies {}: {}", path.display(), e))
        })?;
        let overrides: Vec<QuotaPolicy> = serde_json::from_str(&raw)?;

        let mut registry = Self::defaults();
        for policy in overrides {
            info!(
                "[QUOTA] Policy override {}: max_quota={} restore_rate={}s",
                policy.name, policy.max_quota, policy.restore_rate
            );
            registry.insert(policy);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, policy: QuotaPolicy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    /// Look up a policy. An unknown name is a configuration error.
    pub fn get(&self, name: &str) -> EngineResult<&QuotaPolicy> {
        self.policies
            .get(name)
            .ok_or_else(|| EngineError::Configuration(format!("no quota policy named '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted,
    Throttled { retry_after: Duration },
}

impl QuotaDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, QuotaDecision::Granted)
    }
}

/// Delay suggested after window exhaustion: `ceil(restore_rate * 1.2)`.
fn exhausted_retry_after(policy: &QuotaPolicy) -> Duration {
    Duration::from_secs((policy.restore_rate * 1.2).ceil().max(0.0) as u64)
}

/// Delay suggested after a forced cooldown: `ceil(restore_rate) + 1`.
fn forced_retry_after(policy: &QuotaPolicy) -> Duration {
    Duration::from_secs(policy.restore_rate.ceil().max(0.0) as u64 + 1)
}

pub struct QuotaController {
    store: Store,
    policies: QuotaPolicyRegistry,
    clock: SharedClock,
}

impl QuotaController {
    pub fn new(store: Store, policies: QuotaPolicyRegistry, clock: SharedClock) -> Self {
        info!("[QUOTA] Quota controller initialized with {} policies", policies.len());
        Self {
            store,
            policies,
            clock,
        }
    }

    pub fn policies(&self) -> &QuotaPolicyRegistry {
        &self.policies
    }

    /// Check both windows and, if neither is exhausted, log the request.
    ///
    /// The check and the append run in one transaction so concurrent
    /// callers cannot both take the last slot.
    pub fn try_acquire(&self, policy_name: &str, account_id: &str) -> EngineResult<QuotaDecision> {
        let policy = self.policies.get(policy_name)?;
        let now = self.clock.now();

        let decision = self.store.with_transaction(|conn| {
            // Short window
            let short_n = policy.short_window_len() as usize;
            let recent = recent_requests(conn, &policy.name, account_id, short_n)?;
            if recent.len() >= short_n {
                if let Some(oldest) = recent.last() {
                    let age_ms = (now - *oldest).num_milliseconds();
                    if (age_ms as f64) < policy.restore_rate * 1_000.0 {
                        return Ok(QuotaDecision::Throttled {
                            retry_after: exhausted_retry_after(policy),
                        });
                    }
                }
            }

            // Long window
            if let Some(long) = &policy.long_window {
                let n = long.max_requests.max(1) as usize;
                let recent = recent_requests(conn, &policy.name, account_id, n)?;
                if recent.len() >= n {
                    if let Some(oldest) = recent.last() {
                        if (now - *oldest).num_milliseconds() < long.length_secs() * 1_000 {
                            return Ok(QuotaDecision::Throttled {
                                retry_after: exhausted_retry_after(policy),
                            });
                        }
                    }
                }
            }

            append_requests(conn, &policy.name, account_id, now, 1)?;
            Ok(QuotaDecision::Granted)
        })?;

        match decision {
            QuotaDecision::Granted => {
                debug!("[QUOTA] {} granted for account {}", policy.name, account_id);
            }
            QuotaDecision::Throttled { retry_after } => {
                info!(
                    "[QUOTA] {} throttled for account {} (retry in {}s)",
                    policy.name,
                    account_id,
                    retry_after.as_secs()
                );
            }
        }
        Ok(decision)
    }

    /// Like `try_acquire`, but a refusal becomes `EngineError::Throttled`.
    pub fn acquire(&self, policy_name: &str, account_id: &str) -> EngineResult<()> {
        match self.try_acquire(policy_name, account_id)? {
            QuotaDecision::Granted => Ok(()),
            QuotaDecision::Throttled { retry_after } => Err(EngineError::Throttled { retry_after }),
        }
    }

    /// Fill the window with `max_quota` synthetic requests stamped now.
    ///
    /// Used when the remote reports throttling out of band: the next
    /// `try_acquire` for this policy and account is refused. Returns the
    /// suggested retry delay.
    pub fn force_throttle_window(&self, policy_name: &str, account_id: &str) -> EngineResult<Duration> {
        let policy = self.policies.get(policy_name)?;
        let now = self.clock.now();

        self.store.with_transaction(|conn| {
            append_requests(conn, &policy.name, account_id, now, policy.max_quota.max(1))?;
            Ok(())
        })?;

        let retry_after = forced_retry_after(policy);
        warn!(
            "[QUOTA] {} forced into cooldown for account {} (retry in {}s)",
            policy.name,
            account_id,
            retry_after.as_secs()
        );
        Ok(retry_after)
    }

    /// Sweep request records older than `older_than`. Returns rows removed.
    pub fn prune(&self, older_than: chrono::Duration) -> EngineResult<usize> {
        let removed = self.store.prune_requests(self.clock.now() - older_than)?;
        if removed > 0 {
            debug!("[QUOTA] Pruned {} request records", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn controller(policy: QuotaPolicy) -> (QuotaController, ManualClock) {
        let clock = ManualClock::at_epoch();
        let mut registry = QuotaPolicyRegistry::new();
        registry.insert(policy);
        let store = Store::open_in_memory().unwrap();
        (QuotaController::new(store, registry, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_short_window_exhaustion_and_recovery() {
        let (quota, clock) = controller(QuotaPolicy::new("P", 10, 60.0));

        for _ in 0..6 {
            assert!(quota.try_acquire("P", "acct").unwrap().is_granted());
            clock.advance_secs(1);
        }
        assert_eq!(
            quota.try_acquire("P", "acct").unwrap(),
            QuotaDecision::Throttled { retry_after: Duration::from_secs(72) }
        );

        // Oldest of the last six was stamped at t=0
        clock.advance_secs(55);
        assert!(quota.try_acquire("P", "acct").unwrap().is_granted());
    }

    #[test]
    fn test_accounts_are_independent() {
        let (quota, _clock) = controller(QuotaPolicy::new("P", 3, 10.0));
        assert!(quota.try_acquire("P", "a").unwrap().is_granted());
        assert!(quota.try_acquire("P", "a").unwrap().is_granted());
        assert!(!quota.try_acquire("P", "a").unwrap().is_granted());
        assert!(quota.try_acquire("P", "b").unwrap().is_granted());
    }

    #[test]
    fn test_long_window() {
        let policy = QuotaPolicy::new("P", 10, 1.0).with_long_window(5, 1, WindowUnit::Minute);
        let (quota, clock) = controller(policy);

        for _ in 0..5 {
            assert!(quota.try_acquire("P", "acct").unwrap().is_granted());
            clock.advance_secs(2);
        }
        // Short window is clear, long window holds 5 requests in the last minute
        assert!(!quota.try_acquire("P", "acct").unwrap().is_granted());

        clock.advance_secs(51);
        assert!(quota.try_acquire("P", "acct").unwrap().is_granted());
    }

    #[test]
    fn test_force_throttle_window() {
        let (quota, _clock) = controller(QuotaPolicy::new("P", 10, 4.5));
        let retry = quota.force_throttle_window("P", "acct").unwrap();
        assert_eq!(retry, Duration::from_secs(6));
        assert!(!quota.try_acquire("P", "acct").unwrap().is_granted());
    }

    #[test]
    fn test_unknown_policy_is_configuration_error() {
        let (quota, _clock) = controller(QuotaPolicy::new("P", 10, 1.0));
        assert!(matches!(
            quota.try_acquire("Nope", "acct"),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(quota.acquire("Nope", "acct"), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_registry_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"[{"name": "SubmitFeed", "max_quota": 5, "restore_rate": 30.0},
                {"name": "Custom", "max_quota": 2, "restore_rate": 1.0,
                 "long_window": {"max_requests": 100, "size": 1, "unit": "day"}}]"#,
        )
        .unwrap();

        let registry = QuotaPolicyRegistry::from_json_file(&path).unwrap();
        assert_eq!(registry.get(POLICY_SUBMIT_FEED).unwrap().max_quota, 5);
        assert_eq!(registry.get("Custom").unwrap().long_window.as_ref().unwrap().length_secs(), 86_400);
        assert!(registry.get(POLICY_GET_OFFERS).is_ok());
    }
}
