//! Customer records and the per-sale ledger update.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use super::db::{lookup_processed, now_timestamp, record_processed};
use super::error::AppError;
use super::Outcome;
use crate::models::{Customer, NewCustomer};

pub const CUSTOMERS_ENDPOINT: &str = "/pos/customers";

/// One loyalty point per this many minor units spent.
const POINTS_DIVISOR: i64 = 1000;

const CUSTOMER_COLUMNS: &str =
    "id, name, phone, email, total_spent, loyalty_points, visit_count, last_visit";

fn map_customer(row: &Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        total_spent: row.get(4)?,
        loyalty_points: row.get(5)?,
        visit_count: row.get(6)?,
        last_visit: row.get(7)?,
    })
}

pub fn get_customer(conn: &Connection, id: &str) -> rusqlite::Result<Option<Customer>> {
    conn.query_row(
        &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
        params![id],
        map_customer,
    )
    .optional()
}

pub fn list_customers(conn: &Connection) -> rusqlite::Result<Vec<Customer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CUSTOMER_COLUMNS} FROM customers ORDER BY name COLLATE NOCASE, id"
    ))?;
    let customers = stmt
        .query_map([], map_customer)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(customers)
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Create a customer. A device-generated `id` that already exists returns
/// the stored record as a replay rather than failing.
pub fn create_customer(
    conn: &mut Connection,
    new: &NewCustomer,
    idempotency_key: Option<&str>,
) -> Result<Outcome<Customer>, AppError> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("Customer name is required"));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(key) = idempotency_key {
        if let Some(stored) = lookup_processed(&tx, key, CUSTOMERS_ENDPOINT)? {
            let customer: Customer = serde_json::from_str(&stored)
                .map_err(|e| AppError::internal(format!("stored customer response: {e}")))?;
            info!(idempotency_key = key, customer_id = %customer.id, "customer create replayed");
            return Ok(Outcome::Replayed(customer));
        }
    }

    let id = clean(new.id.as_deref()).unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Some(existing) = get_customer(&tx, &id)? {
        info!(customer_id = %id, "customer already exists; returning stored record");
        return Ok(Outcome::Replayed(existing));
    }

    tx.execute(
        "INSERT INTO customers (id, name, phone, email, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            name,
            clean(new.phone.as_deref()),
            clean(new.email.as_deref()),
            now_timestamp()
        ],
    )?;
    let customer = get_customer(&tx, &id)?
        .ok_or_else(|| AppError::internal("customer vanished after insert"))?;

    if let Some(key) = idempotency_key {
        let body = serde_json::to_string(&customer)
            .map_err(|e| AppError::internal(format!("serialize customer: {e}")))?;
        record_processed(&tx, key, CUSTOMERS_ENDPOINT, 201, &body)?;
    }
    tx.commit()?;

    info!(customer_id = %customer.id, "customer created");
    Ok(Outcome::Created(customer))
}

/// Ledger update for a completed sale. Runs inside the checkout transaction.
/// A spend total that would leave the `i64` range is rejected so the row
/// never degrades to a REAL column value.
pub fn apply_sale(
    conn: &Connection,
    customer_id: &str,
    total: i64,
    at: &str,
) -> Result<(), AppError> {
    let spent: Option<i64> = conn
        .query_row(
            "SELECT total_spent FROM customers WHERE id = ?1",
            params![customer_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(spent) = spent else {
        return Err(AppError::bad_request(format!("Unknown customer: {customer_id}")));
    };
    let new_spent = spent
        .checked_add(total)
        .ok_or_else(|| AppError::bad_request("Customer spend total overflows"))?;
    let points = total.max(0) / POINTS_DIVISOR;

    conn.execute(
        "UPDATE customers
         SET total_spent = ?1,
             visit_count = visit_count + 1,
             loyalty_points = loyalty_points + ?2,
             last_visit = ?3
         WHERE id = ?4",
        params![new_spent, points, at, customer_id],
    )?;
    Ok(())
}
