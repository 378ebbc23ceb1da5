//! Serialized inventory allocation.
//!
//! Each claim is a single conditional `UPDATE ... WHERE status = 'in_stock'
//! RETURNING ...`, so two allocators can never both mark the same unit sold:
//! whichever statement runs second simply does not match the row.

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::db::now_timestamp;
use crate::models::{SerialStatus, SerialUnit};

const UNIT_COLUMNS: &str = "id, product_id, serial_number, status, created_at, sold_date, \
                            sold_to_customer_id, order_id, order_item_id";

fn map_unit(row: &Row<'_>) -> rusqlite::Result<SerialUnit> {
    let status: String = row.get(3)?;
    Ok(SerialUnit {
        id: row.get(0)?,
        product_id: row.get(1)?,
        serial_number: row.get(2)?,
        status: SerialStatus::parse(&status)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(3, "status".into(), Type::Text))?,
        created_at: row.get(4)?,
        sold_date: row.get(5)?,
        sold_to_customer_id: row.get(6)?,
        order_id: row.get(7)?,
        order_item_id: row.get(8)?,
    })
}

/// Who the claimed units are sold to.
#[derive(Debug, Clone, Copy)]
pub struct SaleContext<'a> {
    pub order_id: &'a str,
    pub order_item_id: &'a str,
    pub customer_id: Option<&'a str>,
    pub sold_at: &'a str,
}

/// Mark units of `product_id` as sold for one order line.
///
/// With `explicit_serials`, exactly those units are claimed; entries that are
/// unknown or already sold are skipped with a warning. Otherwise the
/// `quantity` oldest in-stock units are claimed. Claiming fewer units than
/// requested is logged, never an error.
pub fn allocate(
    conn: &Connection,
    product_id: &str,
    quantity: i64,
    explicit_serials: Option<&[String]>,
    sale: &SaleContext<'_>,
) -> rusqlite::Result<Vec<SerialUnit>> {
    let claimed = match explicit_serials {
        Some(serials) => claim_explicit(conn, product_id, serials, sale)?,
        None => claim_fifo(conn, product_id, quantity, sale)?,
    };

    let allocated = claimed.len() as i64;
    if explicit_serials.is_none() && allocated < quantity {
        warn!(
            product_id,
            order_id = sale.order_id,
            requested = quantity,
            allocated,
            "serial shortfall: fewer in-stock units than requested"
        );
    } else if explicit_serials.is_some() && allocated != quantity {
        debug!(
            product_id,
            requested = quantity,
            allocated,
            "explicit serial count differs from line quantity"
        );
    }
    Ok(claimed)
}

fn claim_fifo(
    conn: &Connection,
    product_id: &str,
    quantity: i64,
    sale: &SaleContext<'_>,
) -> rusqlite::Result<Vec<SerialUnit>> {
    if quantity <= 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "UPDATE serial_units
         SET status = 'sold', sold_date = ?1, sold_to_customer_id = ?2,
             order_id = ?3, order_item_id = ?4
         WHERE id IN (
             SELECT id FROM serial_units
             WHERE product_id = ?5 AND status = 'in_stock'
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?6
         )
         AND status = 'in_stock'
         RETURNING rowid, {UNIT_COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut claimed: Vec<(i64, SerialUnit)> = stmt
        .query_map(
            params![
                sale.sold_at,
                sale.customer_id,
                sale.order_id,
                sale.order_item_id,
                product_id,
                quantity
            ],
            |row| {
                let rowid: i64 = row.get(0)?;
                let unit = SerialUnit {
                    id: row.get(1)?,
                    product_id: row.get(2)?,
                    serial_number: row.get(3)?,
                    status: SerialStatus::Sold,
                    created_at: row.get(5)?,
                    sold_date: row.get(6)?,
                    sold_to_customer_id: row.get(7)?,
                    order_id: row.get(8)?,
                    order_item_id: row.get(9)?,
                };
                Ok((rowid, unit))
            },
        )?
        .collect::<rusqlite::Result<_>>()?;

    // RETURNING order is unspecified; report oldest first.
    claimed.sort_by(|(ra, a), (rb, b)| a.created_at.cmp(&b.created_at).then(ra.cmp(rb)));
    Ok(claimed.into_iter().map(|(_, unit)| unit).collect())
}

fn claim_explicit(
    conn: &Connection,
    product_id: &str,
    serials: &[String],
    sale: &SaleContext<'_>,
) -> rusqlite::Result<Vec<SerialUnit>> {
    let sql = format!(
        "UPDATE serial_units
         SET status = 'sold', sold_date = ?1, sold_to_customer_id = ?2,
             order_id = ?3, order_item_id = ?4
         WHERE product_id = ?5 AND serial_number = ?6 AND status = 'in_stock'
         RETURNING {UNIT_COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut seen = HashSet::new();
    let mut claimed = Vec::with_capacity(serials.len());

    for serial in serials {
        let serial = serial.trim();
        if serial.is_empty() || !seen.insert(serial) {
            continue;
        }
        let mut rows = stmt.query_map(
            params![
                sale.sold_at,
                sale.customer_id,
                sale.order_id,
                sale.order_item_id,
                product_id,
                serial
            ],
            map_unit,
        )?;
        match rows.next().transpose()? {
            Some(unit) => claimed.push(unit),
            None => warn!(
                product_id,
                serial_number = serial,
                order_id = sale.order_id,
                "explicit serial skipped: unknown or already sold"
            ),
        }
    }
    Ok(claimed)
}

// ---------------------------------------------------------------------------
// Receiving and lookups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub added: Vec<String>,
    pub duplicates: Vec<String>,
}

/// Add `in_stock` units. Serial numbers already known for the product are
/// reported as duplicates and left untouched.
pub fn receive_units(
    conn: &Connection,
    product_id: &str,
    serials: &[String],
) -> rusqlite::Result<ReceiveOutcome> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO serial_units (id, product_id, serial_number, status, created_at)
         VALUES (?1, ?2, ?3, 'in_stock', ?4)",
    )?;
    let mut outcome = ReceiveOutcome::default();

    for serial in serials {
        let serial = serial.trim();
        if serial.is_empty() {
            continue;
        }
        let inserted = stmt.execute(params![
            Uuid::new_v4().to_string(),
            product_id,
            serial,
            now_timestamp()
        ])?;
        if inserted == 1 {
            outcome.added.push(serial.to_string());
        } else {
            outcome.duplicates.push(serial.to_string());
        }
    }
    Ok(outcome)
}

/// Serial numbers allocated to an order line, oldest first.
pub fn serials_for_item(conn: &Connection, order_item_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT serial_number FROM serial_units
         WHERE order_item_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let serials = stmt
        .query_map(params![order_item_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(serials)
}

pub fn list_units(conn: &Connection, product_id: &str) -> rusqlite::Result<Vec<SerialUnit>> {
    let sql = format!(
        "SELECT {UNIT_COLUMNS} FROM serial_units
         WHERE product_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let units = stmt
        .query_map(params![product_id], map_unit)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::db::ServerDb;
    use crate::server::stock;

    /// Product p-1 with units S1..Sn created one day apart, plus an order
    /// and line to attach sales to.
    fn seed(conn: &Connection, units: usize) {
        conn.execute_batch(
            "INSERT INTO products (id, name, price) VALUES ('p-1', 'Phone', 100);
             INSERT INTO orders (id, order_number, subtotal, total, created_at)
                VALUES ('o-1', 'POS-TEST', 0, 0, '2024-02-01T00:00:00.000Z');
             INSERT INTO order_items (id, order_id, line_no, product_id, quantity, unit_price, total_price)
                VALUES ('i-1', 'o-1', 0, 'p-1', 1, 100, 100);",
        )
        .unwrap();
        // insert newest first so creation time, not insertion order, drives FIFO
        for n in (1..=units).rev() {
            conn.execute(
                "INSERT INTO serial_units (id, product_id, serial_number, status, created_at)
                 VALUES (?1, 'p-1', ?2, 'in_stock', ?3)",
                params![
                    format!("u-{n}"),
                    format!("S{n}"),
                    format!("2024-01-{n:02}T00:00:00.000Z")
                ],
            )
            .unwrap();
        }
        stock::refresh(conn, "p-1").unwrap();
    }

    fn sale() -> SaleContext<'static> {
        SaleContext {
            order_id: "o-1",
            order_item_id: "i-1",
            customer_id: None,
            sold_at: "2024-02-01T00:00:00.000Z",
        }
    }

    fn statuses(conn: &Connection) -> Vec<(String, SerialStatus)> {
        list_units(conn, "p-1")
            .unwrap()
            .into_iter()
            .map(|u| (u.serial_number, u.status))
            .collect()
    }

    #[test]
    fn test_fifo_claims_oldest_units() {
        let db = ServerDb::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn, 3);

        let claimed = allocate(&conn, "p-1", 2, None, &sale()).unwrap();
        let serials: Vec<&str> = claimed.iter().map(|u| u.serial_number.as_str()).collect();
        assert_eq!(serials, vec!["S1", "S2"]);
        assert!(claimed.iter().all(|u| u.order_id.as_deref() == Some("o-1")));
        assert!(claimed.iter().all(|u| u.order_item_id.as_deref() == Some("i-1")));

        assert_eq!(
            statuses(&conn),
            vec![
                ("S1".to_string(), SerialStatus::Sold),
                ("S2".to_string(), SerialStatus::Sold),
                ("S3".to_string(), SerialStatus::InStock),
            ]
        );
        assert_eq!(stock::refresh(&conn, "p-1").unwrap(), 1);
        assert_eq!(serials_for_item(&conn, "i-1").unwrap(), vec!["S1", "S2"]);
    }

    #[test]
    fn test_shortfall_claims_what_exists() {
        let db = ServerDb::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn, 2);

        let claimed = allocate(&conn, "p-1", 5, None, &sale()).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(stock::in_stock_count(&conn, "p-1").unwrap(), 0);

        // nothing left: still not an error
        assert!(allocate(&conn, "p-1", 1, None, &sale()).unwrap().is_empty());
    }

    #[test]
    fn test_explicit_serials_skip_unknown_and_sold() {
        let db = ServerDb::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn, 3);

        allocate(&conn, "p-1", 1, Some(&["S2".to_string()][..]), &sale()).unwrap();
        let picks = vec![
            "S3".to_string(),
            "S2".to_string(),
            "NOPE".to_string(),
            "S3".to_string(),
        ];
        let claimed = allocate(&conn, "p-1", 1, Some(picks.as_slice()), &sale()).unwrap();
        let serials: Vec<&str> = claimed.iter().map(|u| u.serial_number.as_str()).collect();
        assert_eq!(serials, vec!["S3"]);
        assert_eq!(stock::in_stock_count(&conn, "p-1").unwrap(), 1);
    }

    #[test]
    fn test_sold_unit_is_never_claimed_twice() {
        let db = ServerDb::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn, 1);

        let first = allocate(&conn, "p-1", 1, None, &sale()).unwrap();
        let second = allocate(&conn, "p-1", 1, Some(&["S1".to_string()][..]), &sale()).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_receive_reports_duplicates() {
        let db = ServerDb::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        seed(&conn, 1);

        let outcome = receive_units(
            &conn,
            "p-1",
            &["S1".to_string(), "S9".to_string(), " ".to_string()],
        )
        .unwrap();
        assert_eq!(outcome.added, vec!["S9"]);
        assert_eq!(outcome.duplicates, vec!["S1"]);
        assert_eq!(stock::in_stock_count(&conn, "p-1").unwrap(), 2);
    }
}
