//! Catalog reads, stock receiving and recounts.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::info;

use super::error::AppError;
use super::{serials, stock};
use crate::models::{Category, Product};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub product_id: String,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiveSummary {
    pub product_id: String,
    pub added: Vec<String>,
    pub duplicates: Vec<String>,
    pub stock: i64,
}

fn map_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        sku: row.get(2)?,
        category_id: row.get(3)?,
        price: row.get(4)?,
        stock: row.get(5)?,
    })
}

pub fn list_products(conn: &Connection) -> rusqlite::Result<Vec<Product>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, sku, category_id, price, stock FROM products ORDER BY name, id",
    )?;
    let products = stmt
        .query_map([], map_product)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(products)
}

pub fn list_categories(conn: &Connection) -> rusqlite::Result<Vec<Category>> {
    let mut stmt = conn.prepare("SELECT id, name FROM categories ORDER BY name, id")?;
    let categories = stmt
        .query_map([], |row| {
            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(categories)
}

fn product_exists(conn: &Connection, product_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM products WHERE id = ?1",
        params![product_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

pub fn upsert_category(conn: &Connection, category: &Category) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO categories (id, name) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        params![category.id, category.name],
    )?;
    Ok(())
}

/// Insert or update a catalog entry. The incoming `stock` is ignored; stock
/// is always re-derived from serial units.
pub fn upsert_product(conn: &Connection, product: &Product) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO products (id, name, sku, category_id, price)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            sku = excluded.sku,
            category_id = excluded.category_id,
            price = excluded.price",
        params![
            product.id,
            product.name,
            product.sku,
            product.category_id,
            product.price
        ],
    )?;
    stock::refresh(conn, &product.id)?;
    Ok(())
}

/// Add serialized units for a product and refresh its stock.
pub fn receive_stock(
    conn: &mut Connection,
    product_id: &str,
    serial_numbers: &[String],
) -> Result<ReceiveSummary, AppError> {
    if serial_numbers.iter().all(|s| s.trim().is_empty()) {
        return Err(AppError::bad_request("At least one serial number is required"));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !product_exists(&tx, product_id)? {
        return Err(AppError::not_found(format!("Product {product_id}")));
    }
    let outcome = serials::receive_units(&tx, product_id, serial_numbers)?;
    let stock = stock::refresh(&tx, product_id)?;
    tx.commit()?;

    info!(
        product_id,
        added = outcome.added.len(),
        duplicates = outcome.duplicates.len(),
        stock,
        "stock received"
    );
    Ok(ReceiveSummary {
        product_id: product_id.to_string(),
        added: outcome.added,
        duplicates: outcome.duplicates,
        stock,
    })
}

/// Re-derive stock for the given products, or for every product when empty.
pub fn recount(conn: &mut Connection, product_ids: &[String]) -> Result<Vec<StockLevel>, AppError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let levels = if product_ids.is_empty() {
        stock::refresh_all(&tx)?
    } else {
        let mut levels = Vec::with_capacity(product_ids.len());
        for id in product_ids {
            if !product_exists(&tx, id)? {
                return Err(AppError::not_found(format!("Product {id}")));
            }
            levels.push((id.clone(), stock::refresh(&tx, id)?));
        }
        levels
    };
    tx.commit()?;

    info!(products = levels.len(), "stock recounted");
    Ok(levels
        .into_iter()
        .map(|(product_id, stock)| StockLevel { product_id, stock })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::db::ServerDb;

    fn phone() -> Product {
        Product {
            id: "p-1".into(),
            name: "Phone".into(),
            sku: Some("PH-1".into()),
            category_id: Some("c-1".into()),
            price: 49_900,
            stock: 99,
        }
    }

    #[test]
    fn test_upsert_ignores_client_stock() {
        let db = ServerDb::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        upsert_category(
            &conn,
            &Category {
                id: "c-1".into(),
                name: "Phones".into(),
            },
        )
        .unwrap();
        upsert_product(&conn, &phone()).unwrap();

        let products = list_products(&conn).unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].stock, 0);
        assert_eq!(list_categories(&conn).unwrap()[0].name, "Phones");
    }

    #[test]
    fn test_receive_and_recount() {
        let db = ServerDb::open_in_memory().unwrap();
        let mut conn = db.conn.lock().unwrap();
        conn.execute("INSERT INTO categories (id, name) VALUES ('c-1', 'Phones')", [])
            .unwrap();
        upsert_product(&conn, &phone()).unwrap();

        let serials = vec!["A".to_string(), "B".to_string(), "A".to_string()];
        let summary = receive_stock(&mut conn, "p-1", &serials).unwrap();
        assert_eq!(summary.added, vec!["A", "B"]);
        assert_eq!(summary.duplicates, vec!["A"]);
        assert_eq!(summary.stock, 2);

        conn.execute("UPDATE products SET stock = 40 WHERE id = 'p-1'", [])
            .unwrap();
        let levels = recount(&mut conn, &[]).unwrap();
        assert_eq!(
            levels,
            vec![StockLevel {
                product_id: "p-1".into(),
                stock: 2
            }]
        );

        assert!(matches!(
            receive_stock(&mut conn, "ghost", &["Z".to_string()]),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            recount(&mut conn, &["ghost".to_string()]),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            receive_stock(&mut conn, "p-1", &[]),
            Err(AppError::BadRequest(_))
        ));
    }
}
