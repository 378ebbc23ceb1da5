//! Reference data cache.
//!
//! Keeps local snapshots of the product catalog, categories and customers
//! in the `reference_cache` table so the cashier UI can keep selling while
//! offline. A full sync refreshes every section from the backend.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{error, info, warn};

use crate::api::{FailureClass, HttpExecutor};
use crate::db::DbState;
use crate::models::{Category, Customer, Product};

const SECTIONS: [(&str, &str); 3] = [
    ("products", "/pos/products"),
    ("categories", "/pos/categories"),
    ("customers", "/pos/customers"),
];

// ---------------------------------------------------------------------------
// Cache readers
// ---------------------------------------------------------------------------

/// Read a cached array by key. Returns an empty vector on miss or error.
fn read_cache<T: DeserializeOwned>(db: &DbState, cache_key: &str) -> Vec<T> {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(e) => {
            error!("reference cache lock failed: {e}");
            return vec![];
        }
    };

    let json_str: Option<String> = conn
        .query_row(
            "SELECT data FROM reference_cache WHERE cache_key = ?1",
            params![cache_key],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            error!("reference_cache[{cache_key}] read failed: {e}");
            None
        });

    match json_str {
        Some(s) => serde_json::from_str::<Vec<T>>(&s).unwrap_or_else(|e| {
            error!("reference_cache[{cache_key}] JSON parse error: {e}");
            vec![]
        }),
        None => vec![],
    }
}

pub fn cached_products(db: &DbState) -> Vec<Product> {
    read_cache(db, "products")
}

pub fn cached_categories(db: &DbState) -> Vec<Category> {
    read_cache(db, "categories")
}

pub fn cached_customers(db: &DbState) -> Vec<Customer> {
    read_cache(db, "customers")
}

/// Stable digest of a section's content, used to skip unchanged writes.
fn digest(serialized: &str) -> String {
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    format!("digest:{:016x}", hasher.finish())
}

/// Accept `{ success, data: [...] }` envelopes as well as bare arrays.
fn extract_rows(resp: &Value) -> Option<&Vec<Value>> {
    resp.get("data")
        .and_then(Value::as_array)
        .or_else(|| resp.as_array())
}

// ---------------------------------------------------------------------------
// Refresh from backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionResult {
    pub section: String,
    pub count: usize,
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub sections: Vec<SectionResult>,
}

impl RefreshSummary {
    pub fn all_ok(&self) -> bool {
        self.sections.iter().all(|s| s.error.is_none())
    }

    pub fn section(&self, name: &str) -> Option<&SectionResult> {
        self.sections.iter().find(|s| s.section == name)
    }
}

/// Upsert one section, skipping the write when the digest is unchanged.
/// Returns whether the stored snapshot changed.
fn store_section(db: &DbState, section: &str, rows: &[Value]) -> Result<bool, String> {
    let json_str = serde_json::to_string(rows).map_err(|e| format!("serialize {section}: {e}"))?;
    let version = digest(&json_str);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let cached_version: Option<String> = conn
        .query_row(
            "SELECT version FROM reference_cache WHERE cache_key = ?1",
            params![section],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("read reference_cache[{section}]: {e}"))?
        .flatten();

    if cached_version.as_deref() == Some(version.as_str()) {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO reference_cache (cache_key, data, version, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(cache_key) DO UPDATE SET
            data = excluded.data,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![section, json_str, version],
    )
    .map_err(|e| format!("upsert reference_cache[{section}]: {e}"))?;
    Ok(true)
}

async fn refresh_section(
    executor: &dyn HttpExecutor,
    db: &DbState,
    section: &str,
    endpoint: &str,
) -> SectionResult {
    let mut result = SectionResult {
        section: section.to_string(),
        ..SectionResult::default()
    };

    let resp = match executor
        .execute(reqwest::Method::GET, endpoint, None, None)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            if e.class() != FailureClass::Connectivity {
                warn!(section, error = %e, "reference refresh request failed");
            }
            result.error = Some(e.to_string());
            return result;
        }
    };

    let Some(rows) = extract_rows(&resp) else {
        result.error = Some(format!("{section} response is missing a data array"));
        return result;
    };
    result.count = rows.len();

    match store_section(db, section, rows) {
        Ok(updated) => result.updated = updated,
        Err(e) => {
            error!(section, error = %e, "reference cache write failed");
            result.error = Some(e);
        }
    }
    result
}

/// Fetch products, categories and customers and update the local cache.
/// A failing section does not discard the others.
pub async fn refresh_reference_data(executor: &dyn HttpExecutor, db: &DbState) -> RefreshSummary {
    let mut summary = RefreshSummary::default();
    for (section, endpoint) in SECTIONS {
        summary
            .sections
            .push(refresh_section(executor, db, section, endpoint).await);
    }

    info!(
        products = summary.section("products").map_or(0, |s| s.count),
        categories = summary.section("categories").map_or(0, |s| s.count),
        customers = summary.section("customers").map_or(0, |s| s.count),
        ok = summary.all_ok(),
        "Reference data refreshed"
    );
    summary
}
