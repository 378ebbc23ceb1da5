//! Durable key-value storage and secure credential storage.
//!
//! `KeyValueStore` is the boundary the offline queue persists through. The
//! SQLite implementation survives process restarts; the in-memory one is for
//! tests and ephemeral sessions.
//!
//! Backend credentials (URL, API key, terminal id) live in the OS credential
//! store via `keyring`: DPAPI on Windows, Keychain on macOS, and the kernel
//! keyring on Linux.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::db::{self, DbState};

const SERVICE_NAME: &str = "pos-sync";

pub const KEY_BACKEND_URL: &str = "backend_url";
pub const KEY_API_KEY: &str = "pos_api_key";
pub const KEY_TERMINAL_ID: &str = "terminal_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_TERMINAL_ID];

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

/// A durable string key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn remove(&self, key: &str) -> Result<(), String>;
}

/// `kv_store` table in the client database.
#[derive(Clone)]
pub struct SqliteKvStore {
    db: Arc<DbState>,
}

impl SqliteKvStore {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        db::kv_get(&conn, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        db::kv_set(&conn, key, value)
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        db::kv_remove(&conn, key)
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        let entries = self.entries.lock().map_err(|e| e.to_string())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        entries.remove(key);
        Ok(())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        (**self).remove(key)
    }
}

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

/// OS keyring entries under the `pos-sync` service, one per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<Entry, String> {
        Entry::new(SERVICE_NAME, key).map_err(|e| format!("keyring entry {key}: {e}"))
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                Err(format!("read credential {key}: {e}"))
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        Self::entry(key)?
            .set_password(value)
            .map_err(|e| format!("store credential {key}: {e}"))
    }

    /// Missing entries are not an error.
    fn remove(&self, key: &str) -> Result<(), String> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(format!("delete credential {key}: {e}")),
        }
    }
}

fn has_value(store: &dyn KeyValueStore, key: &str) -> bool {
    matches!(store.get(key), Ok(Some(v)) if !v.trim().is_empty())
}

/// The client is considered configured when backend URL and API key exist.
pub fn is_configured(store: &dyn KeyValueStore) -> bool {
    has_value(store, KEY_BACKEND_URL) && has_value(store, KEY_API_KEY)
}

/// Delete every stored credential.
pub fn clear_credentials(store: &dyn KeyValueStore) -> Result<(), String> {
    info!("clearing stored backend credentials");
    for key in ALL_KEYS {
        store.remove(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("queue").unwrap(), None);
        store.set("queue", "[]").unwrap();
        assert_eq!(store.get("queue").unwrap().as_deref(), Some("[]"));
        store.set("queue", "[1]").unwrap();
        assert_eq!(store.get("queue").unwrap().as_deref(), Some("[1]"));
        store.remove("queue").unwrap();
        assert_eq!(store.get("queue").unwrap(), None);
        // removing a missing key is not an error
        store.remove("queue").unwrap();
    }

    #[test]
    fn test_memory_store_roundtrip() {
        exercise(&MemoryKvStore::new());
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        let db = Arc::new(db::open_in_memory().unwrap());
        exercise(&SqliteKvStore::new(db));
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("pos_kv_test_{}", uuid::Uuid::new_v4()));
        {
            let store = SqliteKvStore::new(Arc::new(db::init(&dir).unwrap()));
            store.set("offline_queue:pending", "[\"a\"]").unwrap();
        }
        let reopened = SqliteKvStore::new(Arc::new(db::init(&dir).unwrap()));
        assert_eq!(
            reopened.get("offline_queue:pending").unwrap().as_deref(),
            Some("[\"a\"]")
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_credentials_configured_and_cleared() {
        let store = MemoryKvStore::new();
        assert!(!is_configured(&store));

        store.set(KEY_BACKEND_URL, "https://pos.example.com").unwrap();
        store.set(KEY_API_KEY, "  ").unwrap();
        assert!(!is_configured(&store), "blank key does not count");
        store.set(KEY_API_KEY, "k-1").unwrap();
        store.set(KEY_TERMINAL_ID, "till-1").unwrap();
        assert!(is_configured(&store));

        clear_credentials(&store).unwrap();
        for key in ALL_KEYS {
            assert_eq!(store.get(key).unwrap(), None);
        }
        assert!(!is_configured(&store));
    }
}
