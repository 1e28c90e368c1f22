//! Engine configuration and tuning constants.
//!
//! Every knob has a compiled-in default and can be overridden from the
//! environment (see `EngineConfig::from_env`).

use std::path::PathBuf;
use std::time::Duration;

/// Snapshots kept per listing
pub const DEFAULT_RETENTION: usize = 3;

/// Extra snapshots fetched per trim pass beyond the retention bound
pub const DEFAULT_TRIM_EXTRA: usize = 10;

/// Own price / fee is re-read from the marketplace after this many hours
pub const DEFAULT_PRICE_REFRESH_HOURS: i64 = 24;

/// A stored offer snapshot younger than this is used instead of a remote fetch
pub const DEFAULT_OFFER_CACHE_SECS: i64 = 3_600;

/// Per-call timeout on marketplace requests
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;

/// Consumed feed items are marked in pages of this size
pub const DEFAULT_FEED_PAGE_SIZE: usize = 1_000;

/// Delay before the processing report of a submitted feed is fetched
pub const DEFAULT_REPORT_DELAY_MINS: i64 = 15;

/// Marketplaces submitted in parallel during one flush
pub const DEFAULT_FEED_CONCURRENCY: usize = 4;

/// Inbound queue poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;

/// Seconds a delivered spool message stays hidden before redelivery
pub const DEFAULT_SPOOL_VISIBILITY_SECS: u64 = 300;

/// Price feed flush interval (seconds)
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 300;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Engine configuration from environment
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database path
    pub db_path: PathBuf,

    /// Offer snapshots retained per listing
    pub retention: usize,

    /// Extra rows read per trim pass (`retention + trim_extra` per batch)
    pub trim_extra: usize,

    /// Hours after which own price and fee are refreshed from the remote
    pub price_refresh_hours: i64,

    /// Maximum age of a stored snapshot that still counts as "current offers"
    pub offer_cache_secs: i64,

    /// Timeout applied to every remote call
    pub remote_timeout: Duration,

    /// Page size when marking consumed feed items
    pub feed_page_size: usize,

    /// Minutes until a submission report is fetched
    pub report_delay_mins: i64,

    /// Parallel marketplace submissions per flush
    pub feed_concurrency: usize,

    pub poll_interval: Duration,
    pub flush_interval: Duration,

    /// Directory polled by the spool inbound source
    pub spool_dir: PathBuf,

    pub spool_visibility: Duration,

    /// Optional JSON file overriding the built-in quota policies
    pub quota_policy_file: Option<PathBuf>,

    /// Log feed submissions instead of sending them
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("repricer.db"),
            retention: DEFAULT_RETENTION,
            trim_extra: DEFAULT_TRIM_EXTRA,
            price_refresh_hours: DEFAULT_PRICE_REFRESH_HOURS,
            offer_cache_secs: DEFAULT_OFFER_CACHE_SECS,
            remote_timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            feed_page_size: DEFAULT_FEED_PAGE_SIZE,
            report_delay_mins: DEFAULT_REPORT_DELAY_MINS,
            feed_concurrency: DEFAULT_FEED_CONCURRENCY,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            spool_dir: PathBuf::from("inbound"),
            spool_visibility: Duration::from_secs(DEFAULT_SPOOL_VISIBILITY_SECS),
            quota_policy_file: None,
            dry_run: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("REPRICER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),

            retention: env_or("REPRICER_RETENTION", DEFAULT_RETENTION).max(1),

            trim_extra: env_or("REPRICER_TRIM_EXTRA", DEFAULT_TRIM_EXTRA).max(1),

            price_refresh_hours: env_or("REPRICER_PRICE_REFRESH_HOURS", DEFAULT_PRICE_REFRESH_HOURS),

            offer_cache_secs: env_or("REPRICER_OFFER_CACHE_SECS", DEFAULT_OFFER_CACHE_SECS),

            remote_timeout: Duration::from_secs(env_or(
                "REPRICER_REMOTE_TIMEOUT_SECS",
                DEFAULT_REMOTE_TIMEOUT_SECS,
            )),

            feed_page_size: env_or("REPRICER_FEED_PAGE_SIZE", DEFAULT_FEED_PAGE_SIZE).max(1),

            report_delay_mins: env_or("REPRICER_REPORT_DELAY_MINS", DEFAULT_REPORT_DELAY_MINS),

            feed_concurrency: env_or("REPRICER_FEED_CONCURRENCY", DEFAULT_FEED_CONCURRENCY).max(1),

            poll_interval: Duration::from_secs(env_or(
                "REPRICER_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )),

            flush_interval: Duration::from_secs(env_or(
                "REPRICER_FLUSH_INTERVAL_SECS",
                DEFAULT_FLUSH_INTERVAL_SECS,
            )),

            spool_dir: std::env::var("REPRICER_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),

            spool_visibility: Duration::from_secs(env_or(
                "REPRICER_SPOOL_VISIBILITY_SECS",
                DEFAULT_SPOOL_VISIBILITY_SECS,
            )),

            quota_policy_file: std::env::var("REPRICER_QUOTA_POLICIES").ok().map(PathBuf::from),

            dry_run: env_flag("DRY_RUN", true), // Dry run unless explicitly disabled
        }
    }

    /// Snapshots fetched per trim pass.
    pub fn trim_batch(&self) -> usize {
        self.retention + self.trim_extra
    }
}
