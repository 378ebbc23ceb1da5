//! Derived stock.
//!
//! `products.stock` is a projection of the serial-unit table and is only ever
//! written here. Callers run `refresh` after an allocation or receipt has
//! been applied on the same connection (usually inside the same transaction).

use rusqlite::{params, Connection};
use tracing::debug;

use super::db::now_timestamp;

pub fn in_stock_count(conn: &Connection, product_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM serial_units WHERE product_id = ?1 AND status = 'in_stock'",
        params![product_id],
        |row| row.get(0),
    )
}

/// Recompute one product's stock from its unsold units. Returns the new count.
pub fn refresh(conn: &Connection, product_id: &str) -> rusqlite::Result<i64> {
    let count = in_stock_count(conn, product_id)?;
    conn.execute(
        "UPDATE products SET stock = ?1, updated_at = ?2 WHERE id = ?3",
        params![count, now_timestamp(), product_id],
    )?;
    debug!(product_id, stock = count, "stock refreshed");
    Ok(count)
}

/// Recompute every product. Returns `(product_id, stock)` pairs.
pub fn refresh_all(conn: &Connection) -> rusqlite::Result<Vec<(String, i64)>> {
    let ids: Vec<String> = conn
        .prepare("SELECT id FROM products ORDER BY id")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    ids.into_iter()
        .map(|id| refresh(conn, &id).map(|stock| (id, stock)))
        .collect()
}
