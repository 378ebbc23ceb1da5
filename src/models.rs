//! Wire and row types shared by the cashier client and the checkout backend.
//!
//! Monetary amounts are integer minor units. Field names are snake_case on
//! the wire; camelCase aliases are accepted because older UI builds send
//! them that way.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// Body of `POST /pos/orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    #[serde(rename = "orderData", alias = "order_data")]
    pub order_data: OrderData,
    pub items: Vec<CartItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderData {
    #[serde(default, alias = "customerId", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Falls back to the sum of the line totals when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<i64>,
    #[serde(default)]
    pub discount: i64,
    #[serde(default, alias = "taxRate", skip_serializing_if = "Option::is_none")]
    pub tax_rate: Option<f64>,
    #[serde(default, alias = "paymentMethod", skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    #[serde(alias = "productId")]
    pub product_id: String,
    pub quantity: i64,
    #[serde(alias = "unitPrice")]
    pub unit_price: i64,
    /// Units hand-picked by the cashier. Empty or missing means FIFO.
    #[serde(default, alias = "serialNumbers", skip_serializing_if = "Option::is_none")]
    pub serial_numbers: Option<Vec<String>>,
}

impl CartItem {
    /// `quantity * unit_price`, or `None` when it does not fit in an `i64`.
    pub fn line_total(&self) -> Option<i64> {
        self.quantity.checked_mul(self.unit_price)
    }

    pub fn explicit_serials(&self) -> Option<&[String]> {
        self.serial_numbers
            .as_deref()
            .filter(|serials| !serials.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub customer_id: Option<String>,
    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
    pub payment_method: String,
    pub status: String,
    pub created_at: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    pub quantity: i64,
    pub unit_price: i64,
    pub total_price: i64,
    /// Serial numbers allocated to this line, oldest first.
    #[serde(default)]
    pub serial_numbers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialStatus {
    InStock,
    Sold,
}

impl SerialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SerialStatus::InStock => "in_stock",
            SerialStatus::Sold => "sold",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_stock" => Some(SerialStatus::InStock),
            "sold" => Some(SerialStatus::Sold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialUnit {
    pub id: String,
    pub product_id: String,
    pub serial_number: String,
    pub status: SerialStatus,
    pub created_at: String,
    pub sold_date: Option<String>,
    pub sold_to_customer_id: Option<String>,
    pub order_id: Option<String>,
    pub order_item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    pub price: i64,
    /// Derived from the number of `in_stock` serial units.
    #[serde(default)]
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// Body of `POST /pos/inventory/receive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveStockRequest {
    #[serde(alias = "productId")]
    pub product_id: String,
    #[serde(alias = "serialNumbers")]
    pub serial_numbers: Vec<String>,
}

/// Body of `POST /pos/inventory/recount`. An empty list recounts every product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockRecountRequest {
    #[serde(default, alias = "productIds")]
    pub product_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub total_spent: i64,
    pub loyalty_points: i64,
    pub visit_count: i64,
    pub last_visit: Option<String>,
}

/// Body of `POST /pos/customers`.
///
/// `id` may be generated on the device so that a sale queued offline can
/// reference a customer that the server has not seen yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCustomer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: T,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            replayed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPage {
    pub success: bool,
    pub data: Vec<Order>,
    pub pagination: Pagination,
}
