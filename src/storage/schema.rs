//! Database schema creation.

use rusqlite::{Connection, Result};

/// Create all database tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Catalog: seller accounts, products, listings
    conn.execute(
        "CREATE TABLE IF NOT EXISTS backends (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            seller_id TEXT,
            change_prices TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            change_prices TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            backend_id INTEGER NOT NULL,
            product_id INTEGER,
            marketplace_id TEXT NOT NULL,
            sku TEXT NOT NULL,
            asin TEXT NOT NULL,
            currency TEXT NOT NULL,
            current_price REAL NOT NULL,
            current_shipping_price REAL NOT NULL DEFAULT 0,
            cost_price REAL NOT NULL DEFAULT 0,
            margin_min REAL,
            margin_max REAL,
            min_absolute_profit REAL,
            undercut_step_percent REAL NOT NULL DEFAULT 0,
            fee_percent REAL NOT NULL DEFAULT 0,
            last_price_refresh_at INTEGER,
            change_prices TEXT,
            UNIQUE (backend_id, marketplace_id, sku),
            FOREIGN KEY (backend_id) REFERENCES backends(id),
            FOREIGN KEY (product_id) REFERENCES products(id)
        )",
        [],
    )?;

    // Quota request log: append-only, pruned by an external sweep
    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            policy TEXT NOT NULL,
            account_id TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        )",
        [],
    )?;

    // Offer history: one row per (listing, instant)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS offer_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            listing_id INTEGER NOT NULL,
            captured_at_ms INTEGER NOT NULL,
            source_message_id TEXT,
            offers_json TEXT NOT NULL,
            UNIQUE (listing_id, captured_at_ms),
            FOREIGN KEY (listing_id) REFERENCES listings(id)
        )",
        [],
    )?;

    // Inbound notifications; duplicates of one message_id are separate rows
    conn.execute(
        "CREATE TABLE IF NOT EXISTS inbound_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            body TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            deleted_upstream INTEGER NOT NULL DEFAULT 0,
            marked_for_deletion INTEGER NOT NULL DEFAULT 0,
            received_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_feed_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            marketplace_id TEXT NOT NULL,
            sku TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            launched_at_ms INTEGER,
            submission_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feed_submissions (
            submission_id TEXT PRIMARY KEY,
            marketplace_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            item_count INTEGER NOT NULL,
            submitted_at_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            report TEXT,
            report_fetched_at_ms INTEGER
        )",
        [],
    )?;

    // Audit trail, written by the background writer thread
    conn.execute(
        "CREATE TABLE IF NOT EXISTS price_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            listing_id INTEGER NOT NULL,
            sku TEXT NOT NULL,
            marketplace_id TEXT NOT NULL,
            old_price REAL NOT NULL,
            new_price REAL NOT NULL,
            shipping_price REAL NOT NULL,
            reason TEXT NOT NULL,
            changed_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submission_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id TEXT NOT NULL,
            marketplace_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            submitted_items INTEGER NOT NULL,
            consumed_items INTEGER NOT NULL,
            submitted_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    // Indexes for the hot queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_listings_asin ON listings(asin, marketplace_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_log_policy ON request_log(policy, account_id, ts_ms DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_listing_time ON offer_snapshots(listing_id, captured_at_ms DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_message_id ON inbound_messages(message_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feed_items_pending ON pending_feed_items(operation, launched_at_ms, marketplace_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_price_changes_listing ON price_changes(listing_id, changed_at_ms DESC)",
        [],
    )?;

    Ok(())
}
