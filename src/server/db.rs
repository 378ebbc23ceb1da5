//! Backend SQLite store.
//!
//! Same connection setup and migration bookkeeping as the client database,
//! with the relational schema for catalog, serialized inventory, customers,
//! orders and the idempotency ledger.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::error::AppError;
use crate::db::{mark_applied, open_and_configure, schema_version};

const CURRENT_SCHEMA_VERSION: i32 = 2;

pub struct ServerDb {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl ServerDb {
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create database dir: {e}"))?;
        }
        info!("Opening backend database at {}", path.display());
        let conn = open_and_configure(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| format!("pragma setup: {e}"))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Lock the connection. A panic in an earlier request poisons the
    /// mutex, but any open transaction was rolled back when its guard
    /// dropped during unwind, so the connection is reused as is.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, AppError> {
        Ok(self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database mutex poisoned by a panicked request; recovering");
            self.conn.clear_poison();
            poisoned.into_inner()
        }))
    }
}

/// Millisecond RFC 3339 timestamp. Lexicographic order matches time order,
/// which the FIFO allocation relies on.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn run_migrations(conn: &Connection) -> Result<(), String> {
    let current = schema_version(conn)?;
    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating backend database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// Migration v1: catalog, serialized inventory, customers and orders.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sku TEXT UNIQUE,
            category_id TEXT REFERENCES categories(id),
            price INTEGER NOT NULL DEFAULT 0,
            stock INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            total_spent INTEGER NOT NULL DEFAULT 0,
            loyalty_points INTEGER NOT NULL DEFAULT 0,
            visit_count INTEGER NOT NULL DEFAULT 0,
            last_visit TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL UNIQUE,
            customer_id TEXT REFERENCES customers(id),
            subtotal INTEGER NOT NULL,
            discount INTEGER NOT NULL DEFAULT 0,
            tax INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL,
            payment_method TEXT NOT NULL DEFAULT 'cash',
            status TEXT NOT NULL DEFAULT 'completed',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_created ON orders(created_at);

        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id),
            line_no INTEGER NOT NULL,
            product_id TEXT NOT NULL REFERENCES products(id),
            quantity INTEGER NOT NULL,
            unit_price INTEGER NOT NULL,
            total_price INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id, line_no);

        CREATE TABLE IF NOT EXISTS serial_units (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL REFERENCES products(id),
            serial_number TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_stock' CHECK (status IN ('in_stock', 'sold')),
            created_at TEXT NOT NULL,
            sold_date TEXT,
            sold_to_customer_id TEXT,
            order_id TEXT REFERENCES orders(id),
            order_item_id TEXT REFERENCES order_items(id),
            UNIQUE (product_id, serial_number)
        );
        CREATE INDEX IF NOT EXISTS idx_serial_units_fifo
            ON serial_units(product_id, status, created_at);
        CREATE INDEX IF NOT EXISTS idx_serial_units_item ON serial_units(order_item_id);
        ",
    )
    .map_err(|e| format!("migrate v1: {e}"))?;
    mark_applied(conn, 1)
}

/// Migration v2: idempotency ledger for replayed client actions.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS processed_requests (
            idempotency_key TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            response TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (idempotency_key, endpoint)
        );
        ",
    )
    .map_err(|e| format!("migrate v2: {e}"))?;
    mark_applied(conn, 2)
}

// ---------------------------------------------------------------------------
// Idempotency ledger
// ---------------------------------------------------------------------------

/// Stored response body for a key that was already applied on `endpoint`.
pub fn lookup_processed(
    conn: &Connection,
    key: &str,
    endpoint: &str,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT response FROM processed_requests WHERE idempotency_key = ?1 AND endpoint = ?2",
        params![key, endpoint],
        |row| row.get(0),
    )
    .optional()
}

/// Must run inside the same transaction as the mutation it records.
pub fn record_processed(
    conn: &Connection,
    key: &str,
    endpoint: &str,
    status_code: u16,
    response: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO processed_requests (idempotency_key, endpoint, status_code, response)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, endpoint, status_code, response],
    )?;
    Ok(())
}
