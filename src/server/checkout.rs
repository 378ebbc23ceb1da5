//! Checkout allocator.
//!
//! Turns a submitted cart into an order. Everything a sale touches (order
//! row, line items, serial claims, derived stock, customer ledger and the
//! idempotency record) is written in one `BEGIN IMMEDIATE` transaction, so a
//! checkout is either fully applied or not at all and concurrent checkouts
//! for the same product are serialized by SQLite's write lock.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::customers;
use super::db::{lookup_processed, now_timestamp, record_processed};
use super::error::AppError;
use super::serials::{self, SaleContext};
use super::stock;
use super::Outcome;
use crate::models::{CartItem, CheckoutRequest, Order, OrderData, OrderItem, OrderPage, Pagination};

pub const ORDERS_ENDPOINT: &str = "/pos/orders";

const DEFAULT_PAYMENT_METHOD: &str = "cash";
const DEFAULT_STATUS: &str = "completed";
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
}

/// `total = subtotal - discount + round((subtotal - discount) * tax_rate)`.
/// Subtotal falls back to the sum of line totals.
pub fn compute_totals(
    order: &OrderData,
    items: &[CartItem],
    default_tax_rate: f64,
) -> Result<Totals, AppError> {
    let subtotal = match order.subtotal {
        Some(subtotal) => subtotal,
        None => items
            .iter()
            .try_fold(0i64, |acc, item| acc.checked_add(item.line_total()?))
            .ok_or_else(|| AppError::bad_request("Order subtotal overflows"))?,
    };
    if subtotal < 0 {
        return Err(AppError::bad_request("Subtotal must not be negative"));
    }
    if order.discount < 0 {
        return Err(AppError::bad_request("Discount must not be negative"));
    }
    if order.discount > subtotal {
        return Err(AppError::bad_request("Discount exceeds subtotal"));
    }

    let tax_rate = order.tax_rate.unwrap_or(default_tax_rate);
    if !tax_rate.is_finite() || !(0.0..=1.0).contains(&tax_rate) {
        return Err(AppError::bad_request(format!(
            "Tax rate must be between 0 and 1, got {tax_rate}"
        )));
    }

    // 0 <= discount <= subtotal, so this cannot underflow.
    let taxable = subtotal - order.discount;
    // `as` saturates; an out-of-range tax then fails the checked add below.
    let tax = (taxable as f64 * tax_rate).round() as i64;
    let total = taxable
        .checked_add(tax)
        .ok_or_else(|| AppError::bad_request("Order total overflows"))?;
    Ok(Totals {
        subtotal,
        discount: order.discount,
        tax,
        total,
    })
}

fn new_order_number() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("POS-{}", hex[..12].to_uppercase())
}

fn validate(conn: &Connection, request: &CheckoutRequest) -> Result<(), AppError> {
    if request.items.is_empty() {
        return Err(AppError::bad_request("Order must contain at least one item"));
    }
    for (idx, item) in request.items.iter().enumerate() {
        if item.quantity <= 0 {
            return Err(AppError::bad_request(format!(
                "Item {idx}: quantity must be positive"
            )));
        }
        if item.unit_price < 0 {
            return Err(AppError::bad_request(format!(
                "Item {idx}: unit price must not be negative"
            )));
        }
        if item.line_total().is_none() {
            return Err(AppError::bad_request(format!(
                "Item {idx}: line total overflows"
            )));
        }
        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM products WHERE id = ?1",
                params![item.product_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(AppError::bad_request(format!(
                "Unknown product: {}",
                item.product_id
            )));
        }
    }
    if let Some(customer_id) = request.order_data.customer_id.as_deref() {
        if customers::get_customer(conn, customer_id)?.is_none() {
            return Err(AppError::bad_request(format!("Unknown customer: {customer_id}")));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

pub fn create_order(
    conn: &mut Connection,
    request: &CheckoutRequest,
    default_tax_rate: f64,
    idempotency_key: Option<&str>,
) -> Result<Outcome<Order>, AppError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(key) = idempotency_key {
        if let Some(stored) = lookup_processed(&tx, key, ORDERS_ENDPOINT)? {
            let order: Order = serde_json::from_str(&stored)
                .map_err(|e| AppError::internal(format!("stored order response: {e}")))?;
            info!(
                idempotency_key = key,
                order_id = %order.id,
                "checkout replayed; returning original order"
            );
            return Ok(Outcome::Replayed(order));
        }
    }

    validate(&tx, request)?;
    let totals = compute_totals(&request.order_data, &request.items, default_tax_rate)?;

    let data = &request.order_data;
    let customer_id = data.customer_id.as_deref();
    let payment_method = data
        .payment_method
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_PAYMENT_METHOD);
    let now = now_timestamp();
    let order_id = Uuid::new_v4().to_string();
    let order_number = new_order_number();

    tx.execute(
        "INSERT INTO orders (id, order_number, customer_id, subtotal, discount, tax, total,
                             payment_method, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            order_id,
            order_number,
            customer_id,
            totals.subtotal,
            totals.discount,
            totals.tax,
            totals.total,
            payment_method,
            DEFAULT_STATUS,
            now
        ],
    )?;

    let mut items = Vec::with_capacity(request.items.len());
    for (line_no, item) in request.items.iter().enumerate() {
        let item_id = Uuid::new_v4().to_string();
        let total_price = item
            .line_total()
            .ok_or_else(|| AppError::bad_request(format!("Item {line_no}: line total overflows")))?;
        tx.execute(
            "INSERT INTO order_items (id, order_id, line_no, product_id, quantity, unit_price, total_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item_id,
                order_id,
                line_no as i64,
                item.product_id,
                item.quantity,
                item.unit_price,
                total_price
            ],
        )?;

        let sale = SaleContext {
            order_id: &order_id,
            order_item_id: &item_id,
            customer_id,
            sold_at: &now,
        };
        let units = serials::allocate(
            &tx,
            &item.product_id,
            item.quantity,
            item.explicit_serials(),
            &sale,
        )?;
        stock::refresh(&tx, &item.product_id)?;

        items.push(OrderItem {
            id: item_id,
            order_id: order_id.clone(),
            product_id: item.product_id.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            total_price,
            serial_numbers: units.into_iter().map(|u| u.serial_number).collect(),
        });
    }

    if let Some(cid) = customer_id {
        customers::apply_sale(&tx, cid, totals.total, &now)?;
    }

    let order = Order {
        id: order_id,
        order_number,
        customer_id: customer_id.map(str::to_string),
        subtotal: totals.subtotal,
        discount: totals.discount,
        tax: totals.tax,
        total: totals.total,
        payment_method: payment_method.to_string(),
        status: DEFAULT_STATUS.to_string(),
        created_at: now,
        items,
    };

    if let Some(key) = idempotency_key {
        let body = serde_json::to_string(&order)
            .map_err(|e| AppError::internal(format!("serialize order: {e}")))?;
        record_processed(&tx, key, ORDERS_ENDPOINT, 201, &body)?;
    }
    tx.commit()?;

    info!(
        order_id = %order.id,
        order_number = %order.order_number,
        total = order.total,
        lines = order.items.len(),
        "order created"
    );
    Ok(Outcome::Created(order))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, order_number, customer_id, subtotal, discount, tax, total, \
                             payment_method, status, created_at";

fn map_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        customer_id: row.get(2)?,
        subtotal: row.get(3)?,
        discount: row.get(4)?,
        tax: row.get(5)?,
        total: row.get(6)?,
        payment_method: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        items: Vec::new(),
    })
}

fn load_items(conn: &Connection, order_id: &str) -> rusqlite::Result<Vec<OrderItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, quantity, unit_price, total_price
         FROM order_items WHERE order_id = ?1 ORDER BY line_no",
    )?;
    let mut items = stmt
        .query_map(params![order_id], |row| {
            Ok(OrderItem {
                id: row.get(0)?,
                order_id: row.get(1)?,
                product_id: row.get(2)?,
                quantity: row.get(3)?,
                unit_price: row.get(4)?,
                total_price: row.get(5)?,
                serial_numbers: Vec::new(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for item in &mut items {
        item.serial_numbers = serials::serials_for_item(conn, &item.id)?;
    }
    Ok(items)
}

pub fn get_order(conn: &Connection, id: &str) -> Result<Order, AppError> {
    let mut order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
            params![id],
            map_order,
        )
        .optional()?
        .ok_or_else(|| AppError::not_found(format!("Order {id}")))?;
    order.items = load_items(conn, &order.id)?;
    Ok(order)
}

/// Newest first. `page` starts at 1; `limit` is clamped to `1..=100`.
pub fn list_orders(
    conn: &Connection,
    page: Option<u32>,
    limit: Option<u32>,
) -> Result<OrderPage, AppError> {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = i64::from(page - 1) * i64::from(limit);

    let total: i64 = conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?1 OFFSET ?2"
    ))?;
    let mut orders = stmt
        .query_map(params![limit, offset], map_order)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for order in &mut orders {
        order.items = load_items(conn, &order.id)?;
    }
    debug!(page, limit, total, returned = orders.len(), "orders listed");

    let limit_i64 = i64::from(limit);
    Ok(OrderPage {
        success: true,
        data: orders,
        pagination: Pagination {
            page,
            limit,
            total,
            total_pages: (total + limit_i64 - 1) / limit_i64,
        },
    })
}
