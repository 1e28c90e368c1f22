//! Units of deferred work and the scheduler interface they are submitted to.
//!
//! Every piece of engine work (message handling, pricing, feed flushes,
//! history trims, report retrieval, upstream deletion) is a `Task`. Callers
//! hand tasks to a `TaskScheduler` together with a priority and an optional
//! earliest start time; `tasks::TaskRunner` drains them.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::{EngineError, EngineResult};
use crate::types::{FeedOperation, ListingId};

/// A schedulable unit of engine work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    HandleMessage { message_id: String },
    EvaluatePricing { listing_id: ListingId, force_change: bool },
    FlushFeeds { operation: FeedOperation },
    /// One bounded trim pass; resubmits itself while backlog remains
    TrimHistory { listing_id: ListingId },
    FetchSubmissionReport { submission_id: String },
    /// Delete a message upstream and drop every local copy
    DeleteMessage { message_id: String },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::HandleMessage { .. } => "handle_message",
            Task::EvaluatePricing { .. } => "evaluate_pricing",
            Task::FlushFeeds { .. } => "flush_feeds",
            Task::TrimHistory { .. } => "trim_history",
            Task::FetchSubmissionReport { .. } => "fetch_submission_report",
            Task::DeleteMessage { .. } => "delete_message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleOptions {
    pub priority: Priority,
    /// Earliest start; `None` means as soon as possible
    pub not_before: Option<DateTime<Utc>>,
}

impl ScheduleOptions {
    pub fn now() -> Self {
        Self::default()
    }

    pub fn at(not_before: DateTime<Utc>) -> Self {
        Self {
            priority: Priority::Normal,
            not_before: Some(not_before),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Sink for deferred work. Delivery is at-least-once.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: Task, options: ScheduleOptions) -> EngineResult<()>;
}

/// A task together with its scheduling options, as carried on the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub task: Task,
    pub options: ScheduleOptions,
}

/// In-process scheduler backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<ScheduledTask>,
}

impl TaskScheduler for ChannelScheduler {
    fn schedule(&self, task: Task, options: ScheduleOptions) -> EngineResult<()> {
        debug!("[TASKS] Scheduling {} ({:?})", task.name(), options.priority);
        self.tx
            .send(ScheduledTask { task, options })
            .map_err(|_| EngineError::Shutdown)
    }
}

/// Create the task channel: the scheduler half goes to producers, the
/// receiver to `TaskRunner::run`.
pub fn create_task_channel() -> (ChannelScheduler, mpsc::UnboundedReceiver<ScheduledTask>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelScheduler { tx }, rx)
}

/// Scheduler that only records what it was given.
#[derive(Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<ScheduledTask>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything scheduled so far, in submission order.
    pub fn scheduled(&self) -> Vec<ScheduledTask> {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.scheduled().into_iter().map(|s| s.task).collect()
    }

    /// Drain the recorded tasks.
    pub fn take(&self) -> Vec<ScheduledTask> {
        std::mem::take(&mut *self.scheduled.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl TaskScheduler for RecordingScheduler {
    fn schedule(&self, task: Task, options: ScheduleOptions) -> EngineResult<()> {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScheduledTask { task, options });
        Ok(())
    }
}
