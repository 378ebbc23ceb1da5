//! HTTP surface of the checkout backend.
//!
//! Handlers are thin: they pull the idempotency key and body out of the
//! request and hand a closure to [`with_db`], which runs it on the blocking
//! pool against the shared connection.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::db::{now_timestamp, ServerDb};
use super::error::AppError;
use super::inventory::{ReceiveSummary, StockLevel};
use super::{checkout, customers, inventory, Outcome};
use crate::api::IDEMPOTENCY_HEADER;
use crate::models::{
    ApiEnvelope, Category, CheckoutRequest, Customer, NewCustomer, Order, OrderPage, Product,
    ReceiveStockRequest, StockRecountRequest,
};

#[derive(Clone)]
pub struct AppState {
    db: Arc<ServerDb>,
    tax_rate: f64,
}

impl AppState {
    pub fn new(db: Arc<ServerDb>, tax_rate: f64) -> Self {
        Self { db, tax_rate }
    }
}

pub fn app_router(state: AppState) -> Router {
    let pos_routes = Router::new()
        .route("/products", get(list_products))
        .route("/categories", get(list_categories))
        .route("/customers", get(list_customers).post(create_customer))
        .route("/inventory/receive", post(receive_stock))
        .route("/inventory/recount", post(recount_stock))
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/{id}", get(get_order));

    Router::new()
        .route("/health", get(health))
        .nest("/pos", pos_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run blocking SQLite work off the async executor.
async fn with_db<T, F>(state: &AppState, work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = db.lock()?;
        work(&mut conn)
    })
    .await
    .map_err(|e| AppError::internal(format!("database task failed: {e}")))?
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn created<T>(outcome: Outcome<T>) -> (StatusCode, Json<ApiEnvelope<T>>) {
    let replayed = outcome.is_replay();
    let mut envelope = ApiEnvelope::ok(outcome.into_inner());
    envelope.replayed = replayed;
    (StatusCode::CREATED, Json(envelope))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_timestamp(),
    })
}

async fn list_products(
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<Vec<Product>>>, AppError> {
    let products = with_db(&state, |conn| Ok(inventory::list_products(conn)?)).await?;
    Ok(Json(ApiEnvelope::ok(products)))
}

async fn list_categories(
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<Vec<Category>>>, AppError> {
    let categories = with_db(&state, |conn| Ok(inventory::list_categories(conn)?)).await?;
    Ok(Json(ApiEnvelope::ok(categories)))
}

async fn list_customers(
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<Vec<Customer>>>, AppError> {
    let customers = with_db(&state, |conn| Ok(customers::list_customers(conn)?)).await?;
    Ok(Json(ApiEnvelope::ok(customers)))
}

async fn create_customer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewCustomer>,
) -> Result<(StatusCode, Json<ApiEnvelope<Customer>>), AppError> {
    let key = idempotency_key(&headers);
    let outcome = with_db(&state, move |conn| {
        customers::create_customer(conn, &body, key.as_deref())
    })
    .await?;
    Ok(created(outcome))
}

async fn receive_stock(
    State(state): State<AppState>,
    Json(body): Json<ReceiveStockRequest>,
) -> Result<Json<ApiEnvelope<ReceiveSummary>>, AppError> {
    let summary = with_db(&state, move |conn| {
        inventory::receive_stock(conn, &body.product_id, &body.serial_numbers)
    })
    .await?;
    Ok(Json(ApiEnvelope::ok(summary)))
}

async fn recount_stock(
    State(state): State<AppState>,
    Json(body): Json<StockRecountRequest>,
) -> Result<Json<ApiEnvelope<Vec<StockLevel>>>, AppError> {
    let levels = with_db(&state, move |conn| inventory::recount(conn, &body.product_ids)).await?;
    Ok(Json(ApiEnvelope::ok(levels)))
}

async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<Order>>), AppError> {
    let key = idempotency_key(&headers);
    let tax_rate = state.tax_rate;
    let outcome = with_db(&state, move |conn| {
        checkout::create_order(conn, &body, tax_rate, key.as_deref())
    })
    .await?;
    Ok(created(outcome))
}

#[derive(Debug, Deserialize)]
struct OrderListQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<OrderPage>, AppError> {
    let page = with_db(&state, move |conn| {
        checkout::list_orders(conn, query.page, query.limit)
    })
    .await?;
    Ok(Json(page))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiEnvelope<Order>>, AppError> {
    let order = with_db(&state, move |conn| checkout::get_order(conn, &id)).await?;
    Ok(Json(ApiEnvelope::ok(order)))
}
