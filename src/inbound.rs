//! Inbound notification queue.
//!
//! The source is polled, every received copy is stored (duplicates
//! included) and one `HandleMessage` task is scheduled per distinct message
//! id. Deletion upstream happens only after the message has been processed.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::errors::EngineResult;
use crate::scheduler::{ScheduleOptions, Task, TaskScheduler};
use crate::storage::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub body: String,
}

/// At-least-once queue of raw notifications with explicit deletion.
#[async_trait]
pub trait InboundMessageSource: Send + Sync {
    async fn poll(&self) -> EngineResult<Vec<RawMessage>>;
    async fn delete(&self, message_id: &str) -> EngineResult<()>;
}

/// Directory of `*.json` files used as a queue. The file stem is the
/// message id.
///
/// A delivered file is hidden from later polls until `visibility` has
/// passed, then redelivered unless it was deleted.
pub struct SpoolDirSource {
    dir: PathBuf,
    visibility: Duration,
    in_flight: Mutex<FxHashMap<String, Instant>>,
}

impl SpoolDirSource {
    pub fn new(dir: PathBuf, visibility: Duration) -> Self {
        Self {
            dir,
            visibility,
            in_flight: Mutex::new(FxHashMap::default()),
        }
    }

    fn path_for(&self, message_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", message_id))
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Instant>> {
        self.in_flight.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl InboundMessageSource for SpoolDirSource {
    async fn poll(&self) -> EngineResult<Vec<RawMessage>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                candidates.push((stem.to_string(), path));
            }
        }
        candidates.sort();

        let mut messages = Vec::new();
        for (message_id, path) in candidates {
            let visible = self
                .in_flight()
                .get(&message_id)
                .map_or(true, |delivered| delivered.elapsed() >= self.visibility);
            if !visible {
                continue;
            }

            let body = match tokio::fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            self.in_flight().insert(message_id.clone(), Instant::now());
            messages.push(RawMessage { message_id, body });
        }
        Ok(messages)
    }

    async fn delete(&self, message_id: &str) -> EngineResult<()> {
        match tokio::fs::remove_file(self.path_for(message_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[INBOUND] {} already removed", message_id);
            }
            Err(e) => return Err(e.into()),
        }
        self.in_flight().remove(message_id);
        Ok(())
    }
}

/// Poll the source once, store every copy and schedule handling.
/// Returns the number of copies stored.
pub async fn ingest(
    source: &dyn InboundMessageSource,
    store: &Store,
    scheduler: &dyn TaskScheduler,
    clock: &SharedClock,
) -> EngineResult<usize> {
    let messages = source.poll().await?;
    if messages.is_empty() {
        return Ok(0);
    }

    let now = clock.now();
    let mut seen = FxHashSet::default();
    for message in &messages {
        store.insert_message(&message.message_id, &message.body, now)?;
        if seen.insert(message.message_id.clone()) {
            scheduler.schedule(
                Task::HandleMessage { message_id: message.message_id.clone() },
                ScheduleOptions::now(),
            )?;
        }
    }

    info!(
        "[INBOUND] Stored {} messages ({} distinct)",
        messages.len(),
        seen.len()
    );
    Ok(messages.len())
}

/// Schedule handling for messages stored but never processed (startup).
pub fn recover_unprocessed(store: &Store, scheduler: &dyn TaskScheduler) -> EngineResult<usize> {
    let pending = store.unprocessed_message_ids()?;
    for message_id in &pending {
        scheduler.schedule(
            Task::HandleMessage { message_id: message_id.clone() },
            ScheduleOptions::now(),
        )?;
    }
    if !pending.is_empty() {
        info!("[INBOUND] Rescheduled {} unprocessed messages", pending.len());
    }
    Ok(pending.len())
}

/// Delete a processed message upstream, then drop every local copy.
pub async fn delete_message(
    source: &dyn InboundMessageSource,
    store: &Store,
    message_id: &str,
) -> EngineResult<()> {
    if let Err(e) = source.delete(message_id).await {
        warn!("[INBOUND] Upstream delete of {} failed: {}", message_id, e);
        return Err(e);
    }
    store.mark_deleted_upstream(message_id)?;
    let removed = store.delete_message_copies(message_id)?;
    debug!("[INBOUND] {} deleted ({} local copies)", message_id, removed);
    Ok(())
}
