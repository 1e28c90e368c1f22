//! Repricing engine service.
//!
//! Wires the store, quota controller, remote client, offer processor,
//! pricing engine and feed aggregator together, then runs three loops until
//! Ctrl-C: the task runner, the inbound poller, and the periodic feed flush.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use repricer::clock::{SharedClock, SystemClock};
use repricer::config::EngineConfig;
use repricer::feeds::{schedule_flushes, FeedAggregator};
use repricer::history::OfferHistoryStore;
use repricer::inbound::{self, InboundMessageSource, SpoolDirSource};
use repricer::locks::ListingLocks;
use repricer::pricing::PricingEngine;
use repricer::processor::OfferChangeProcessor;
use repricer::quota::{QuotaController, QuotaPolicyRegistry};
use repricer::remote::{DryRunClient, GatedClient, RemoteOfferClient};
use repricer::scheduler::{create_task_channel, TaskScheduler};
use repricer::storage::{create_audit_channel, Store};
use repricer::tasks::TaskRunner;

/// Request-log records older than this are swept on each flush tick
const REQUEST_LOG_RETENTION_HOURS: i64 = 48;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging with both stdout and file output
    let file_appender = tracing_appender::rolling::never(".", "repricer.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("repricer=info".parse().context("invalid log directive")?);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let config = EngineConfig::from_env();
    info!("Buy-Box repricing engine v{}", env!("CARGO_PKG_VERSION"));
    info!("   Database: {}", config.db_path.display());
    info!("   Offer history retention: {} snapshots", config.retention);
    info!("   Inbound spool: {}", config.spool_dir.display());
    if config.dry_run {
        info!("   Mode: DRY RUN (set DRY_RUN=0 to submit feeds)");
    } else {
        warn!("   Mode: LIVE (no marketplace client linked in this build, dry-run client used)");
    }

    let store = Store::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let audit = create_audit_channel(&config.db_path);
    let clock: SharedClock = Arc::new(SystemClock);

    let policies = match &config.quota_policy_file {
        Some(path) => QuotaPolicyRegistry::from_json_file(path)
            .with_context(|| format!("loading quota policies from {}", path.display()))?,
        None => QuotaPolicyRegistry::defaults(),
    };
    let quota = Arc::new(QuotaController::new(store.clone(), policies, clock.clone()));

    let (channel, rx) = create_task_channel();
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(channel);

    let remote: Arc<dyn RemoteOfferClient> = Arc::new(DryRunClient::new(store.clone(), clock.clone()));
    let client = Arc::new(GatedClient::new(remote, quota.clone(), config.remote_timeout));

    let locks = Arc::new(ListingLocks::new());
    let history = Arc::new(OfferHistoryStore::new(store.clone(), scheduler.clone(), &config));
    let pricing = Arc::new(PricingEngine::new(
        store.clone(),
        client.clone(),
        history.clone(),
        locks.clone(),
        audit.clone(),
        clock.clone(),
        &config,
    ));
    let processor = Arc::new(OfferChangeProcessor::new(
        store.clone(),
        history.clone(),
        pricing.clone(),
        locks.clone(),
        scheduler.clone(),
        clock.clone(),
    ));
    let feeds = Arc::new(FeedAggregator::new(
        store.clone(),
        client.clone(),
        scheduler.clone(),
        audit.clone(),
        clock.clone(),
        &config,
    ));
    let source: Arc<dyn InboundMessageSource> =
        Arc::new(SpoolDirSource::new(config.spool_dir.clone(), config.spool_visibility));

    let recovered = inbound::recover_unprocessed(&store, scheduler.as_ref())?;
    if recovered > 0 {
        info!("[INBOUND] Recovered {} unprocessed messages", recovered);
    }

    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        processor,
        pricing,
        history,
        feeds,
        source.clone(),
        scheduler.clone(),
        clock.clone(),
    ));
    let runner_handle = tokio::spawn(runner.run(rx));

    // Inbound poller
    let poll_handle = {
        let store = store.clone();
        let scheduler = scheduler.clone();
        let source = source.clone();
        let clock = clock.clone();
        let poll_interval = config.poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if let Err(e) = inbound::ingest(source.as_ref(), &store, scheduler.as_ref(), &clock).await {
                    error!("[INBOUND] Poll failed: {}", e);
                }
            }
        })
    };

    // Periodic feed flush and request-log sweep
    let flush_handle = {
        let scheduler = scheduler.clone();
        let quota = quota.clone();
        let flush_interval = config.flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = schedule_flushes(scheduler.as_ref()) {
                    error!("[FEED] Could not schedule flush: {}", e);
                }
                if let Err(e) = quota.prune(chrono::Duration::hours(REQUEST_LOG_RETENTION_HOURS)) {
                    warn!("[QUOTA] Request log sweep failed: {}", e);
                }
            }
        })
    };

    info!("Engine running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down...");

    poll_handle.abort();
    flush_handle.abort();
    runner_handle.abort();
    audit.shutdown();

    // Give the audit writer a moment to flush
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
