//! Non-blocking audit writer using a dedicated thread and mpsc channel.
//!
//! Price changes and feed submissions are recorded for later analysis
//! without ever blocking (or failing) the pricing path.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{error, info, warn};

use super::schema::create_tables;
use super::types::{PriceChangeRecord, SubmissionAuditRecord};

/// Flush once this many records are buffered
const BATCH_SIZE: usize = 100;

/// Flush a partial batch after this much idle time
const BATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Messages sent to the audit writer thread.
pub enum AuditMessage {
    PriceChange(PriceChangeRecord),
    Submission(SubmissionAuditRecord),
    /// Graceful shutdown
    Shutdown,
}

/// Channel handle for sending audit records (non-blocking).
///
/// A disabled channel (tests, in-memory stores) silently drops records.
#[derive(Clone, Default)]
pub struct AuditChannel {
    tx: Option<Sender<AuditMessage>>,
}

impl AuditChannel {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn record_price_change(&self, record: PriceChangeRecord) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(AuditMessage::PriceChange(record));
        }
    }

    pub fn record_submission(&self, record: SubmissionAuditRecord) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(AuditMessage::Submission(record));
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(AuditMessage::Shutdown);
        }
    }
}

/// Create an audit channel and spawn the writer thread.
///
/// The writer opens its own connection to `db_path`.
pub fn create_audit_channel(db_path: &Path) -> AuditChannel {
    let (tx, rx) = mpsc::channel();
    let path = db_path.to_path_buf();

    // Dedicated writer thread, isolated from the async runtime
    thread::spawn(move || {
        audit_writer_loop(rx, path);
    });

    AuditChannel { tx: Some(tx) }
}

/// Main writer loop running in a dedicated thread.
fn audit_writer_loop(rx: Receiver<AuditMessage>, db_path: PathBuf) {
    let conn = match Connection::open(&db_path) {
        Ok(c) => c,
        Err(e) => {
            error!("[AUDIT] Failed to open database at {}: {}", db_path.display(), e);
            return;
        }
    };

    if let Err(e) = create_tables(&conn) {
        error!("[AUDIT] Failed to create tables: {}", e);
        return;
    }

    info!("[AUDIT] Writer started on {}", db_path.display());

    let mut batch: Vec<AuditMessage> = Vec::with_capacity(BATCH_SIZE);

    loop {
        match rx.recv_timeout(BATCH_TIMEOUT) {
            Ok(AuditMessage::Shutdown) => {
                flush_batch(&conn, &mut batch);
                info!("[AUDIT] Writer shutdown complete");
                break;
            }
            Ok(msg) => {
                batch.push(msg);
                if batch.len() >= BATCH_SIZE {
                    flush_batch(&conn, &mut batch);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush_batch(&conn, &mut batch);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                flush_batch(&conn, &mut batch);
                info!("[AUDIT] Channel disconnected, writer exiting");
                break;
            }
        }
    }
}

/// Flush a batch of records in a single transaction.
fn flush_batch(conn: &Connection, batch: &mut Vec<AuditMessage>) {
    if batch.is_empty() {
        return;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => {
            error!("[AUDIT] Failed to start transaction: {}", e);
            batch.clear();
            return;
        }
    };

    let mut price_count = 0;
    let mut submission_count = 0;

    for msg in batch.drain(..) {
        match msg {
            AuditMessage::PriceChange(r) => {
                if insert_price_change(&tx, &r) {
                    price_count += 1;
                }
            }
            AuditMessage::Submission(r) => {
                if insert_submission(&tx, &r) {
                    submission_count += 1;
                }
            }
            AuditMessage::Shutdown => {}
        }
    }

    if let Err(e) = tx.commit() {
        error!("[AUDIT] Failed to commit transaction: {}", e);
    } else if price_count > 0 || submission_count > 0 {
        info!(
            "[AUDIT] Flushed {} price changes, {} submissions",
            price_count, submission_count
        );
    }
}

fn insert_price_change(conn: &Connection, r: &PriceChangeRecord) -> bool {
    let result = conn.execute(
        "INSERT INTO price_changes (listing_id, sku, marketplace_id, old_price, new_price, shipping_price, reason, changed_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            r.listing_id,
            r.sku,
            r.marketplace_id,
            r.old_price,
            r.new_price,
            r.shipping_price,
            r.reason,
            r.changed_at_ms,
        ],
    );

    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("[AUDIT] Failed to insert price change for {}: {}", r.sku, e);
            false
        }
    }
}

fn insert_submission(conn: &Connection, r: &SubmissionAuditRecord) -> bool {
    let result = conn.execute(
        "INSERT INTO submission_audit (submission_id, marketplace_id, operation, submitted_items, consumed_items, submitted_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            r.submission_id,
            r.marketplace_id,
            r.operation,
            r.submitted_items,
            r.consumed_items,
            r.submitted_at_ms,
        ],
    );

    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("[AUDIT] Failed to insert submission {}: {}", r.submission_id, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let channel = create_audit_channel(&path);

        channel.record_price_change(PriceChangeRecord {
            listing_id: 1,
            sku: "SKU-1".into(),
            marketplace_id: "M1".into(),
            old_price: 10.0,
            new_price: 9.5,
            shipping_price: 0.0,
            reason: "undercut_buy_box".into(),
            changed_at_ms: 1,
        });
        channel.shutdown();

        // Writer thread owns the connection; poll until the row lands
        let conn = Connection::open(&path).unwrap();
        let mut rows = 0i64;
        for _ in 0..50 {
            rows = conn
                .query_row("SELECT COUNT(*) FROM price_changes", [], |r| r.get(0))
                .unwrap_or(0);
            if rows > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_disabled_channel_drops_silently() {
        let channel = AuditChannel::disabled();
        channel.record_submission(SubmissionAuditRecord {
            submission_id: "S1".into(),
            marketplace_id: "M1".into(),
            operation: "price".into(),
            submitted_items: 1,
            consumed_items: 2,
            submitted_at_ms: 0,
        });
        channel.shutdown();
    }
}
