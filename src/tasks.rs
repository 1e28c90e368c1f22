//! Task execution loop.
//!
//! `TaskRunner::run` drains the scheduler channel into a timer queue and
//! spawns each task once its `not_before` has passed, highest priority
//! first among those due. Retryable failures are rescheduled after the
//! error's retry delay; fatal ones are logged and dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::errors::EngineResult;
use crate::feeds::FeedAggregator;
use crate::history::OfferHistoryStore;
use crate::inbound::{self, InboundMessageSource};
use crate::pricing::PricingEngine;
use crate::processor::OfferChangeProcessor;
use crate::scheduler::{Priority, ScheduleOptions, ScheduledTask, Task, TaskScheduler};
use crate::storage::Store;

/// A queued task waiting for its start time.
struct Pending {
    due: DateTime<Utc>,
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Max-heap: earliest due first, then higher priority, then FIFO
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(self.priority.cmp(&other.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

pub struct TaskRunner {
    store: Store,
    processor: Arc<OfferChangeProcessor>,
    pricing: Arc<PricingEngine>,
    history: Arc<OfferHistoryStore>,
    feeds: Arc<FeedAggregator>,
    source: Arc<dyn InboundMessageSource>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: SharedClock,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        processor: Arc<OfferChangeProcessor>,
        pricing: Arc<PricingEngine>,
        history: Arc<OfferHistoryStore>,
        feeds: Arc<FeedAggregator>,
        source: Arc<dyn InboundMessageSource>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            processor,
            pricing,
            history,
            feeds,
            source,
            scheduler,
            clock,
        }
    }

    /// Run one task to completion, including its follow-ups.
    pub async fn execute(&self, task: &Task) -> EngineResult<()> {
        match task {
            Task::HandleMessage { message_id } => {
                self.processor.handle(message_id).await?;
            }
            Task::EvaluatePricing { listing_id, force_change } => {
                self.pricing.evaluate(*listing_id, *force_change).await?;
            }
            Task::FlushFeeds { operation } => {
                self.feeds.flush(*operation).await?;
            }
            Task::TrimHistory { listing_id } => {
                if self.history.trim(*listing_id)?.backlog {
                    self.history.evict_old(*listing_id)?;
                }
            }
            Task::FetchSubmissionReport { submission_id } => {
                if !self.feeds.fetch_report(submission_id).await? {
                    debug!("[TASKS] Report {} still in progress", submission_id);
                    self.scheduler.schedule(
                        task.clone(),
                        ScheduleOptions::at(self.clock.now() + self.feeds.report_delay()),
                    )?;
                }
            }
            Task::DeleteMessage { message_id } => {
                inbound::delete_message(self.source.as_ref(), &self.store, message_id).await?;
            }
        }
        Ok(())
    }

    /// Execute a task and reschedule it if it failed with a retryable error.
    async fn execute_with_retry(&self, task: Task, priority: Priority) {
        let started = std::time::Instant::now();
        match self.execute(&task).await {
            Ok(()) => {
                debug!("[TASKS] {} done in {}ms", task.name(), started.elapsed().as_millis());
            }
            Err(e) => match e.retry_delay() {
                Some(delay) => {
                    warn!("[TASKS] {} failed, retrying in {}s: {}", task.name(), delay.as_secs(), e);
                    let not_before = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    let options = ScheduleOptions::at(not_before).with_priority(priority);
                    if let Err(e) = self.scheduler.schedule(task.clone(), options) {
                        error!("[TASKS] Could not reschedule {}: {}", task.name(), e);
                    }
                }
                None => {
                    error!("[TASKS] {} failed: {}", task.name(), e);
                }
            },
        }
    }

    /// Main loop. Runs until the task channel closes or the runner is aborted.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ScheduledTask>) {
        info!("[TASKS] Task runner started");

        let mut queue: BinaryHeap<Pending> = BinaryHeap::new();
        let mut seq: u64 = 0;

        loop {
            let delay = queue
                .peek()
                .map(|next| (next.due - self.clock.now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                received = rx.recv() => match received {
                    Some(ScheduledTask { task, options }) => {
                        seq += 1;
                        queue.push(Pending {
                            due: options.not_before.unwrap_or_else(|| self.clock.now()),
                            priority: options.priority,
                            seq,
                            task,
                        });
                    }
                    None => break,
                },
                _ = sleep_for(delay) => {
                    let now = self.clock.now();
                    let mut due = Vec::new();
                    while queue.peek().map_or(false, |next| next.due <= now) {
                        if let Some(next) = queue.pop() {
                            due.push(next);
                        }
                    }
                    due.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

                    for pending in due {
                        let runner = self.clone();
                        tokio::spawn(async move {
                            runner.execute_with_retry(pending.task, pending.priority).await;
                        });
                    }
                }
            }
        }

        info!("[TASKS] Task runner stopped ({} tasks not run)", queue.len());
    }
}
