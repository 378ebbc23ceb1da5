//! Local SQLite database layer for the cashier client.
//!
//! Uses rusqlite with WAL mode. Holds the durable key-value table that backs
//! the offline action queue and the reference-data cache refreshed by a full
//! sync.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared state holding the client database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open (or create) `{data_dir}/pos-client.db` and bring its schema up to
/// date. A file SQLite reports as corrupt or not a database is removed
/// along with its WAL sidecars and recreated once. Any other open error
/// (locked, unwritable) is returned and the file is left alone, since it
/// holds the unsynced actions.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir)
        .map_err(|e| format!("create data dir {}: {e}", data_dir.display()))?;

    let db_path = data_dir.join("pos-client.db");
    info!(path = %db_path.display(), "Opening client database");
    let conn = open_or_recreate(&db_path)?;
    run_migrations(&conn)?;
    info!(schema = CURRENT_SCHEMA_VERSION, "Client database ready");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_or_recreate(db_path: &Path) -> Result<Connection, String> {
    let first_err = match configure(db_path) {
        Ok(conn) => return Ok(conn),
        Err(e) if is_corruption(&e) => e,
        // Locked, unwritable and the like: keep the file and its queued actions.
        Err(e) => return Err(format!("open client database: {e}")),
    };
    warn!(error = %first_err, "Client database corrupt; recreating");
    for sidecar in ["db", "db-wal", "db-shm"] {
        let path = db_path.with_extension(sidecar);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Could not remove database file");
            }
        }
    }
    open_and_configure(db_path).map_err(|e| format!("reopen client database: {e}"))
}

fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Open a throwaway in-memory database with the full schema.
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open a database file and apply pragmas. Shared with the server store.
pub(crate) fn open_and_configure(path: &Path) -> Result<Connection, String> {
    configure(path).map_err(|e| format!("sqlite open: {e}"))
}

fn configure(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    // Before WAL: switching journal mode needs a write lock and must wait.
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Highest applied migration, creating the bookkeeping table on first use.
pub(crate) fn schema_version(conn: &Connection) -> Result<i32, String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("read schema_version: {e}"))
}

pub(crate) fn mark_applied(conn: &Connection, version: i32) -> Result<(), String> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![version],
    )
    .map_err(|e| format!("record schema v{version}: {e}"))?;
    Ok(())
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    let current = schema_version(conn)?;

    if current >= CURRENT_SCHEMA_VERSION {
        debug!(schema = current, "Schema up to date");
        return Ok(());
    }

    info!(from = current, to = CURRENT_SCHEMA_VERSION, "Migrating client database");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: durable key-value store.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        ",
    )
    .map_err(|e| format!("migrate v1: {e}"))?;
    mark_applied(conn, 1)
}

/// Migration v2: reference data cache (catalog, categories, customers).
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reference_cache (
            cache_key TEXT PRIMARY KEY,
            data TEXT NOT NULL DEFAULT '[]',
            version TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        ",
    )
    .map_err(|e| format!("migrate v2: {e}"))?;
    mark_applied(conn, 2)
}

// ---------------------------------------------------------------------------
// Key-value helpers
// ---------------------------------------------------------------------------

pub fn kv_get(conn: &Connection, key: &str) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT value FROM kv_store WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("kv get {key}: {e}"))
}

pub fn kv_set(conn: &Connection, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO kv_store (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value],
    )
    .map_err(|e| format!("kv set {key}: {e}"))?;
    Ok(())
}

pub fn kv_remove(conn: &Connection, key: &str) -> Result<(), String> {
    conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])
        .map_err(|e| format!("kv remove {key}: {e}"))?;
    Ok(())
}
