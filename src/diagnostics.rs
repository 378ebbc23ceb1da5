//! Diagnostics for the POS sync client and checkout server.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, queue backlog, last sync, cached
//!   reference sections
//! - **Logging setup**: console plus daily rolling files, with pruning of
//!   old log files at start

use crate::db::{self, DbState};
use crate::sync::SyncStats;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain per prefix.
pub const MAX_LOG_FILES: usize = 10;

const DEFAULT_LOG_FILTER: &str = "info,pos_sync_lib=debug";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("POS_BUILD_EPOCH"),
        "gitSha": env!("POS_BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Health snapshot for the terminal's status screen.
pub fn get_system_health(db: &DbState, stats: &SyncStats) -> Result<Value, String> {
    let (schema_version, cached_sections) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        (db::schema_version(&conn)?, get_cached_sections(&conn))
    };
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "syncBacklog": {
            "pending": stats.pending_count,
            "failed": stats.failed_count,
        },
        "lastSync": stats.last_sync.map(|t| t.to_rfc3339()),
        "isOnline": stats.is_online,
        "syncInProgress": stats.sync_in_progress,
        "referenceCache": cached_sections,
        "dbSizeBytes": db_size,
    }))
}

fn get_cached_sections(conn: &rusqlite::Connection) -> Value {
    let mut result = json!({});
    let Ok(mut stmt) = conn.prepare("SELECT cache_key, updated_at FROM reference_cache") else {
        return result;
    };
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .ok();
    if let (Some(rows), Some(map)) = (rows, result.as_object_mut()) {
        for (key, updated_at) in rows.flatten() {
            map.insert(key, json!({ "updatedAt": updated_at }));
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Per-user log directory. `POS_LOG_DIR` overrides the platform default.
pub fn get_log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("POS_LOG_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("pos-sync").join("logs")
}

/// Delete all but the newest `MAX_LOG_FILES` files named `<prefix>.*`.
/// Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, prefix: &str) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    let marker = format!("{prefix}.");

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&marker))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install the global subscriber: env filter, console layer and a daily
/// rolling file under [`get_log_dir`]. Keep the returned guard alive for
/// the life of the process; dropping it flushes and stops file logging.
pub fn init_logging(prefix: &str) -> Result<WorkerGuard, String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let log_dir = get_log_dir();
    fs::create_dir_all(&log_dir)
        .map_err(|e| format!("create log dir {}: {e}", log_dir.display()))?;
    prune_old_logs(&log_dir, prefix);

    let file_appender = tracing_appender::rolling::daily(&log_dir, prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("install tracing subscriber: {e}"))?;

    Ok(guard)
}
