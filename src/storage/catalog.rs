//! Listing / product / backend configuration.
//!
//! The catalog is read-only for the engine with one exception: the price
//! columns of a listing, which only the pricing engine writes (the setters
//! are `pub(crate)`).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::Store;
use crate::clock::{from_millis, to_millis};
use crate::errors::EngineResult;
use crate::types::{Backend, Listing, ListingId, NewListing, PriceFlag, Product};

const LISTING_COLUMNS: &str = "id, backend_id, product_id, marketplace_id, sku, asin, currency,
    current_price, current_shipping_price, cost_price, margin_min, margin_max,
    min_absolute_profit, undercut_step_percent, fee_percent, last_price_refresh_at,
    change_prices";

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<Listing> {
    let refreshed: Option<i64> = row.get(15)?;
    let flag: Option<String> = row.get(16)?;
    Ok(Listing {
        id: row.get(0)?,
        backend_id: row.get(1)?,
        product_id: row.get(2)?,
        marketplace_id: row.get(3)?,
        sku: row.get(4)?,
        asin: row.get(5)?,
        currency: row.get(6)?,
        current_price: row.get(7)?,
        current_shipping_price: row.get(8)?,
        cost_price: row.get(9)?,
        margin_min: row.get(10)?,
        margin_max: row.get(11)?,
        min_absolute_profit: row.get(12)?,
        undercut_step_percent: row.get(13)?,
        fee_percent: row.get(14)?,
        last_price_refresh_at: refreshed.map(from_millis),
        change_prices: PriceFlag::from_db(flag.as_deref()),
    })
}

impl Store {
    pub fn insert_backend(
        &self,
        name: &str,
        seller_id: Option<&str>,
        change_prices: PriceFlag,
    ) -> EngineResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO backends (name, seller_id, change_prices) VALUES (?1, ?2, ?3)",
            params![name, seller_id, change_prices.as_db()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_product(&self, name: &str, change_prices: PriceFlag) -> EngineResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO products (name, change_prices) VALUES (?1, ?2)",
            params![name, change_prices.as_db()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_listing(&self, listing: &NewListing) -> EngineResult<ListingId> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO listings (backend_id, product_id, marketplace_id, sku, asin, currency,
                current_price, current_shipping_price, cost_price, margin_min, margin_max,
                min_absolute_profit, undercut_step_percent, fee_percent, change_prices)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                listing.backend_id,
                listing.product_id,
                listing.marketplace_id,
                listing.sku,
                listing.asin,
                listing.currency,
                listing.current_price,
                listing.current_shipping_price,
                listing.cost_price,
                listing.margin_min,
                listing.margin_max,
                listing.min_absolute_profit,
                listing.undercut_step_percent,
                listing.fee_percent,
                listing.change_prices.as_db(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn backend(&self, id: i64) -> EngineResult<Option<Backend>> {
        let conn = self.conn();
        let backend = conn
            .query_row(
                "SELECT id, name, seller_id, change_prices FROM backends WHERE id = ?1",
                [id],
                |row| {
                    let flag: Option<String> = row.get(3)?;
                    Ok(Backend {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        seller_id: row.get(2)?,
                        change_prices: PriceFlag::from_db(flag.as_deref()),
                    })
                },
            )
            .optional()?;
        Ok(backend)
    }

    pub fn product(&self, id: i64) -> EngineResult<Option<Product>> {
        let conn = self.conn();
        let product = conn
            .query_row(
                "SELECT id, name, change_prices FROM products WHERE id = ?1",
                [id],
                |row| {
                    let flag: Option<String> = row.get(2)?;
                    Ok(Product {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        change_prices: PriceFlag::from_db(flag.as_deref()),
                    })
                },
            )
            .optional()?;
        Ok(product)
    }

    pub fn listing(&self, id: ListingId) -> EngineResult<Option<Listing>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM listings WHERE id = ?1", LISTING_COLUMNS);
        let listing = conn.query_row(&sql, [id], listing_from_row).optional()?;
        Ok(listing)
    }

    /// All listings of one catalog item on one marketplace (across accounts).
    pub fn listings_for_asin(&self, asin: &str, marketplace_id: &str) -> EngineResult<Vec<Listing>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM listings WHERE asin = ?1 AND marketplace_id = ?2 ORDER BY id",
            LISTING_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![asin, marketplace_id], listing_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_listing_flag(&self, id: ListingId, flag: PriceFlag) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE listings SET change_prices = ?1 WHERE id = ?2",
            params![flag.as_db(), id],
        )?;
        Ok(())
    }

    pub fn set_product_flag(&self, id: i64, flag: PriceFlag) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE products SET change_prices = ?1 WHERE id = ?2",
            params![flag.as_db(), id],
        )?;
        Ok(())
    }

    pub fn set_backend_flag(&self, id: i64, flag: PriceFlag) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE backends SET change_prices = ?1 WHERE id = ?2",
            params![flag.as_db(), id],
        )?;
        Ok(())
    }

    /// Write a new listing price.
    pub(crate) fn write_listing_price(
        &self,
        id: ListingId,
        price: f64,
        shipping_price: f64,
    ) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE listings SET current_price = ?1, current_shipping_price = ?2 WHERE id = ?3",
            params![price, shipping_price, id],
        )?;
        Ok(())
    }

    /// Store the own price / fee just read from the marketplace.
    pub(crate) fn write_listing_refresh(
        &self,
        id: ListingId,
        price: f64,
        shipping_price: f64,
        fee_percent: f64,
        refreshed_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE listings SET current_price = ?1, current_shipping_price = ?2,
                fee_percent = ?3, last_price_refresh_at = ?4
             WHERE id = ?5",
            params![price, shipping_price, fee_percent, to_millis(refreshed_at), id],
        )?;
        Ok(())
    }

    /// Only bump the refresh timestamp (remote values matched the stored ones).
    pub(crate) fn touch_listing_refresh(
        &self,
        id: ListingId,
        refreshed_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn().execute(
            "UPDATE listings SET last_price_refresh_at = ?1 WHERE id = ?2",
            params![to_millis(refreshed_at), id],
        )?;
        Ok(())
    }
}
