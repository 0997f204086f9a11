//! Minimall - self-hosted mini-mall commerce service.
//!
//! HTTP/persistence shell around the domain core: carts and orders live in
//! PostgreSQL, cart mutations run in a transaction with the user's lines
//! locked (`SELECT ... FOR UPDATE`) so concurrent read-modify-writes on the
//! same line cannot lose updates, and order lifecycle events are published
//! to NATS when configured.

use anyhow::Result;
use axum::{extract::{Path, Query, State}, http::StatusCode, routing::{get, post, put}, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use validator::Validate;

use minimall::{
    Address, BatchUpdate, Cart, CartError, CartLine, CheckoutItem, LineKey, Money, Order,
    OrderAssembler, OrderLine, OrderNumber, OrderRecord, OrderStatus, PricingRules,
    ProductSnapshot, ProductStatus, ShippingMethod, VariantSelection,
};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub nats: Option<async_nats::Client>,
    pub assembler: Arc<OrderAssembler>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db = PgPoolOptions::new().max_connections(10).connect(&std::env::var("DATABASE_URL")?).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    let nats = match std::env::var("NATS_URL") {
        Ok(url) => async_nats::connect(&url).await.ok(),
        Err(_) => None,
    };
    let state = AppState { db, nats, assembler: Arc::new(OrderAssembler::new(pricing_rules_from_env())) };

    let app = Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "minimall"})) }))
        .route("/api/v1/cart/:user", get(get_cart).delete(clear_cart))
        .route("/api/v1/cart/:user/items", post(add_cart_item))
        .route("/api/v1/cart/:user/items/:key", put(set_cart_quantity).delete(remove_cart_item))
        .route("/api/v1/cart/:user/items/:key/toggle", post(toggle_cart_item))
        .route("/api/v1/cart/:user/toggle-all", post(toggle_all_cart))
        .route("/api/v1/cart/:user/batch", post(batch_update_cart))
        .route("/api/v1/orders/calculate", post(calculate_order))
        .route("/api/v1/orders", get(list_orders).post(create_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/ship", post(ship_order))
        .route("/api/v1/orders/:id/deliver", post(deliver_order))
        .route("/api/v1/payments/callback", post(payment_callback))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8083".to_string());
    tracing::info!("minimall listening on 0.0.0.0:{}", port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?, app).await?;
    Ok(())
}

fn pricing_rules_from_env() -> PricingRules {
    let mut rules = PricingRules::default();
    if let Ok(v) = std::env::var("FREE_SHIPPING_THRESHOLD") {
        if let Ok(minor) = v.parse() {
            rules.free_shipping_threshold = Money::from_minor(minor);
        }
    }
    if let Ok(v) = std::env::var("FLAT_SHIPPING_FEE") {
        if let Ok(minor) = v.parse() {
            rules.flat_shipping_fee = Money::from_minor(minor);
        }
    }
    rules
}

type ApiError = (StatusCode, String);

fn db_err(e: sqlx::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn cart_err(e: CartError) -> ApiError {
    let status = match e {
        CartError::LineNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

/// Deliberately collapses "no such order" and "not yours / wrong status" so
/// cross-user order existence never leaks.
fn not_cancellable() -> ApiError {
    (StatusCode::NOT_FOUND, "order not found or not cancellable".to_string())
}

async fn publish_events(state: &AppState, order: &mut Order) {
    let events = order.take_events();
    let Some(nats) = &state.nats else { return };
    for event in events {
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = nats.publish(event.subject().to_string(), payload.into()).await {
                    tracing::warn!("failed to publish domain event: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to serialize domain event: {e}"),
        }
    }
}

// =============================================================================
// Cart
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct CartLineRow {
    line_key: String,
    product_id: String,
    spec_id: Option<String>,
    quantity: i32,
    selected: bool,
    variants: serde_json::Value,
    name: String,
    image: String,
    price: i64,
    price_adjustment: i64,
    stock: i32,
}

impl CartLineRow {
    fn into_line(self) -> CartLine {
        CartLine {
            key: LineKey::from(self.line_key),
            product_id: self.product_id,
            spec_id: self.spec_id,
            name: self.name,
            image: self.image,
            unit_price: Money::from_minor(self.price),
            price_adjustment: Money::from_minor(self.price_adjustment),
            variants: serde_json::from_value(self.variants).unwrap_or_default(),
            quantity: self.quantity.max(0) as u32,
            stock_ceiling: self.stock.max(0) as u32,
            selected: self.selected,
        }
    }
}

const CART_SELECT: &str = "SELECT c.line_key, c.product_id, c.spec_id, c.quantity, c.selected, c.variants, \
     p.name, p.image, p.price, COALESCE(s.price_adjustment, 0) AS price_adjustment, COALESCE(s.stock, p.stock) AS stock \
     FROM cart_items c \
     JOIN products p ON p.id = c.product_id \
     LEFT JOIN product_specs s ON s.id = c.spec_id \
     WHERE c.user_id = $1 ORDER BY c.created_at DESC";

async fn load_cart<'a, E>(exec: E, user: &str, lock: bool) -> Result<Cart, sqlx::Error>
where
    E: sqlx::PgExecutor<'a>,
{
    let sql = if lock { format!("{CART_SELECT} FOR UPDATE OF c") } else { CART_SELECT.to_string() };
    let rows = sqlx::query_as::<_, CartLineRow>(&sql).bind(user).fetch_all(exec).await?;
    Ok(Cart::from_lines(user, rows.into_iter().map(CartLineRow::into_line).collect()))
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    name: String,
    image: String,
    price: i64,
    stock: i32,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SpecRow {
    id: String,
    name: String,
    value: String,
    price_adjustment: i64,
    stock: i32,
}

/// Resolve the current product snapshot (price, stock, status) for an
/// optional chosen spec. The spec also determines the variant selection.
async fn load_snapshot(
    db: &PgPool,
    product_id: &str,
    spec_id: Option<&str>,
) -> Result<(ProductSnapshot, VariantSelection), ApiError> {
    let product = sqlx::query_as::<_, ProductRow>("SELECT id, name, image, price, stock, status FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(db)
        .await
        .map_err(db_err)?
        .ok_or((StatusCode::NOT_FOUND, "Product not found".to_string()))?;

    let status = ProductStatus::from_str(&product.status).unwrap_or_default();
    let mut snapshot = ProductSnapshot {
        product_id: product.id,
        spec_id: None,
        name: product.name,
        image: product.image,
        unit_price: Money::from_minor(product.price),
        price_adjustment: Money::ZERO,
        stock: product.stock.max(0) as u32,
        status,
    };
    let mut variants = VariantSelection::new();

    if let Some(spec_id) = spec_id {
        let spec = sqlx::query_as::<_, SpecRow>("SELECT id, name, value, price_adjustment, stock FROM product_specs WHERE id = $1 AND product_id = $2")
            .bind(spec_id)
            .bind(&snapshot.product_id)
            .fetch_optional(db)
            .await
            .map_err(db_err)?
            .ok_or((StatusCode::NOT_FOUND, "Product specification not found".to_string()))?;
        snapshot.spec_id = Some(spec.id);
        snapshot.price_adjustment = Money::from_minor(spec.price_adjustment);
        snapshot.stock = spec.stock.max(0) as u32;
        variants.insert(spec.name, spec.value);
    }

    Ok((snapshot, variants))
}

#[derive(Debug, Serialize)]
pub struct CartLineResponse {
    pub id: String,
    pub product_id: String,
    pub spec_id: Option<String>,
    pub name: String,
    pub image: String,
    /// Effective unit price (base + variant adjustment), minor units.
    pub price: i64,
    pub quantity: u32,
    pub stock: u32,
    pub selected: bool,
    pub variants: VariantSelection,
}

impl From<&CartLine> for CartLineResponse {
    fn from(l: &CartLine) -> Self {
        Self {
            id: l.key.to_string(),
            product_id: l.product_id.clone(),
            spec_id: l.spec_id.clone(),
            name: l.name.clone(),
            image: l.image.clone(),
            price: l.effective_price().minor(),
            quantity: l.quantity,
            stock: l.stock_ceiling,
            selected: l.selected,
            variants: l.variants.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CartResponse {
    pub items: Vec<CartLineResponse>,
    pub total_quantity: u32,
    pub total_price: i64,
    pub selected_quantity: u32,
    pub selected_price: i64,
}

fn cart_response(cart: &Cart) -> CartResponse {
    CartResponse {
        items: cart.lines().iter().map(CartLineResponse::from).collect(),
        total_quantity: cart.total_quantity(),
        total_price: cart.total_price().minor(),
        selected_quantity: cart.selected_quantity(),
        selected_price: cart.selected_price().minor(),
    }
}

async fn get_cart(State(s): State<AppState>, Path(user): Path<String>) -> Result<Json<CartResponse>, ApiError> {
    let cart = load_cart(&s.db, &user, false).await.map_err(db_err)?;
    Ok(Json(cart_response(&cart)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddCartItemRequest {
    pub product_id: String,
    #[validate(range(min = 1))]
    pub quantity: u32,
    pub spec_id: Option<String>,
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

async fn add_cart_item(
    State(s): State<AppState>,
    Path(user): Path<String>,
    Json(r): Json<AddCartItemRequest>,
) -> Result<(StatusCode, Json<CartLineResponse>), ApiError> {
    r.validate().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let (snapshot, spec_variants) = load_snapshot(&s.db, &r.product_id, r.spec_id.as_deref()).await?;
    let variants = if spec_variants.is_empty() { r.variants.into_iter().collect() } else { spec_variants };

    let mut tx = s.db.begin().await.map_err(db_err)?;
    let mut cart = load_cart(&mut *tx, &user, true).await.map_err(db_err)?;
    let mut line = cart.add_line(r.quantity, variants, &snapshot).map_err(cart_err)?.clone();
    // FOR UPDATE cannot lock a row that does not exist yet, so two
    // first-time additions of the same key can both read an empty cart. The
    // conflict arm therefore merges additively against whichever row won,
    // with the same stock clamp the aggregate applies, instead of writing
    // an absolute quantity computed from a stale read.
    let (quantity,): (i32,) = sqlx::query_as(
        "INSERT INTO cart_items (user_id, line_key, product_id, spec_id, quantity, selected, variants, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW()) \
         ON CONFLICT (user_id, line_key) DO UPDATE \
         SET quantity = LEAST(cart_items.quantity + $8, $9), updated_at = NOW() \
         RETURNING quantity",
    )
    .bind(&user)
    .bind(line.key.as_str())
    .bind(&line.product_id)
    .bind(&line.spec_id)
    .bind(line.quantity as i32)
    .bind(line.selected)
    .bind(serde_json::to_value(&line.variants).unwrap_or_else(|_| serde_json::json!({})))
    .bind(r.quantity as i32)
    .bind(line.stock_ceiling as i32)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err)?;
    line.quantity = quantity.max(0) as u32;
    tx.commit().await.map_err(db_err)?;

    Ok((StatusCode::CREATED, Json(CartLineResponse::from(&line))))
}

#[derive(Debug, Deserialize)]
pub struct SetQuantityRequest {
    pub quantity: i32,
}

async fn set_cart_quantity(
    State(s): State<AppState>,
    Path((user, key)): Path<(String, String)>,
    Json(r): Json<SetQuantityRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    let key = LineKey::from(key);
    let mut tx = s.db.begin().await.map_err(db_err)?;
    let mut cart = load_cart(&mut *tx, &user, true).await.map_err(db_err)?;
    cart.set_quantity(&key, r.quantity).map_err(cart_err)?;
    if let Some(line) = cart.line(&key) {
        sqlx::query("UPDATE cart_items SET quantity = $3, updated_at = NOW() WHERE user_id = $1 AND line_key = $2")
            .bind(&user)
            .bind(key.as_str())
            .bind(line.quantity as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    } else {
        sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND line_key = $2")
            .bind(&user)
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)?;
    Ok(Json(cart_response(&cart)))
}

async fn remove_cart_item(
    State(s): State<AppState>,
    Path((user, key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND line_key = $2")
        .bind(&user)
        .bind(&key)
        .execute(&s.db)
        .await
        .map_err(db_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_cart(State(s): State<AppState>, Path(user): Path<String>) -> Result<StatusCode, ApiError> {
    sqlx::query("DELETE FROM cart_items WHERE user_id = $1").bind(&user).execute(&s.db).await.map_err(db_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_cart_item(
    State(s): State<AppState>,
    Path((user, key)): Path<(String, String)>,
) -> Result<Json<CartResponse>, ApiError> {
    let key = LineKey::from(key);
    let mut tx = s.db.begin().await.map_err(db_err)?;
    let mut cart = load_cart(&mut *tx, &user, true).await.map_err(db_err)?;
    cart.toggle_selected(&key).map_err(cart_err)?;
    let selected = cart.line(&key).map(|l| l.selected).unwrap_or(false);
    sqlx::query("UPDATE cart_items SET selected = $3, updated_at = NOW() WHERE user_id = $1 AND line_key = $2")
        .bind(&user)
        .bind(key.as_str())
        .bind(selected)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;
    Ok(Json(cart_response(&cart)))
}

async fn toggle_all_cart(State(s): State<AppState>, Path(user): Path<String>) -> Result<Json<CartResponse>, ApiError> {
    let mut tx = s.db.begin().await.map_err(db_err)?;
    let mut cart = load_cart(&mut *tx, &user, true).await.map_err(db_err)?;
    cart.toggle_all();
    // toggle_all leaves every line with the same flag
    if let Some(selected) = cart.lines().first().map(|l| l.selected) {
        sqlx::query("UPDATE cart_items SET selected = $2, updated_at = NOW() WHERE user_id = $1")
            .bind(&user)
            .bind(selected)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)?;
    Ok(Json(cart_response(&cart)))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BatchEntry {
    pub line_key: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BatchUpdateRequest {
    #[validate(length(min = 1))]
    pub updates: Vec<BatchEntry>,
}

async fn batch_update_cart(
    State(s): State<AppState>,
    Path(user): Path<String>,
    Json(r): Json<BatchUpdateRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    r.validate().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let updates: Vec<BatchUpdate> = r
        .updates
        .into_iter()
        .map(|u| BatchUpdate { key: LineKey::from(u.line_key), quantity: u.quantity })
        .collect();

    let mut tx = s.db.begin().await.map_err(db_err)?;
    let mut cart = load_cart(&mut *tx, &user, true).await.map_err(db_err)?;
    // All-or-nothing: the aggregate validates the whole batch before any
    // line changes, and the transaction makes the writes atomic.
    cart.batch_update(&updates).map_err(cart_err)?;
    for update in &updates {
        sqlx::query("UPDATE cart_items SET quantity = $3, updated_at = NOW() WHERE user_id = $1 AND line_key = $2")
            .bind(&user)
            .bind(update.key.as_str())
            .bind(update.quantity as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)?;
    Ok(Json(cart_response(&cart)))
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct CalculateItem {
    pub product_id: String,
    pub quantity: u32,
    /// Unit price in minor units, as shown to the client.
    pub price: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CalculateRequest {
    #[validate(length(min = 1))]
    pub items: Vec<CalculateItem>,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CalculationResponse {
    pub subtotal: i64,
    pub shipping: i64,
    pub coupon_discount: i64,
    pub discount: i64,
    pub total: i64,
    pub shipping_method: &'static str,
}

async fn calculate_order(
    State(s): State<AppState>,
    Json(r): Json<CalculateRequest>,
) -> Result<Json<CalculationResponse>, ApiError> {
    r.validate().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let items: Vec<CheckoutItem> = r
        .items
        .iter()
        .map(|i| CheckoutItem {
            product_id: i.product_id.clone(),
            name: String::new(),
            image: String::new(),
            quantity: i.quantity,
            unit_price: Money::from_minor(i.price),
            variants: VariantSelection::new(),
        })
        .collect();
    let calc = s.assembler.preview(&items, r.coupon_code.as_deref());
    Ok(Json(CalculationResponse {
        subtotal: calc.subtotal.minor(),
        shipping: calc.shipping.minor(),
        coupon_discount: calc.coupon_discount.minor(),
        discount: calc.discount.minor(),
        total: calc.total.minor(),
        shipping_method: calc.shipping_method.label(),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddressRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub phone: String,
    #[validate(length(min = 1))]
    pub province: String,
    #[validate(length(min = 1))]
    pub city: String,
    #[validate(length(min = 1))]
    pub district: String,
    #[validate(length(min = 1))]
    pub detail: String,
}

impl From<AddressRequest> for Address {
    fn from(a: AddressRequest) -> Self {
        Self { name: a.name, phone: a.phone, province: a.province, city: a.city, district: a.district, detail: a.detail }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateOrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub spec_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(length(min = 1))]
    pub items: Vec<CreateOrderItem>,
    #[validate]
    pub address: AddressRequest,
    pub coupon_code: Option<String>,
    pub remark: Option<String>,
}

async fn create_order(
    State(s): State<AppState>,
    Json(r): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    r.validate().map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    // Prices come from the catalog at this instant, not from the client;
    // the order then freezes them into its snapshot.
    let mut items = Vec::with_capacity(r.items.len());
    for item in &r.items {
        let (snapshot, variants) = load_snapshot(&s.db, &item.product_id, item.spec_id.as_deref()).await?;
        if !snapshot.status.is_purchasable() {
            return Err((StatusCode::BAD_REQUEST, "Product is not available for purchase".to_string()));
        }
        items.push(CheckoutItem {
            product_id: snapshot.product_id.clone(),
            name: snapshot.name.clone(),
            image: snapshot.image.clone(),
            quantity: item.quantity,
            unit_price: snapshot.effective_price(),
            variants,
        });
    }

    let mut order = s
        .assembler
        .create_order(&r.user_id, items, r.address.into(), r.coupon_code.as_deref(), r.remark)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let record = order.record().clone();
    let address_json = serde_json::to_value(&record.shipping_address)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let mut tx = s.db.begin().await.map_err(db_err)?;
    sqlx::query("INSERT INTO orders (id, order_number, buyer_id, status, subtotal, shipping_amount, discount_amount, payment_amount, \
         shipping_method, payment_method, remark, shipping_address, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)")
        .bind(&record.id)
        .bind(record.order_number.as_str())
        .bind(&record.buyer_id)
        .bind(record.status.to_string())
        .bind(record.subtotal.minor())
        .bind(record.shipping_amount.minor())
        .bind(record.discount_amount.minor())
        .bind(record.payment_amount.minor())
        .bind(record.shipping_method.as_str())
        .bind(&record.payment_method)
        .bind(&record.remark)
        .bind(&address_json)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    for line in &record.items {
        sqlx::query("INSERT INTO order_items (id, order_id, product_id, name, image, quantity, unit_price, variant_description) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
            .bind(Uuid::new_v4().to_string())
            .bind(&record.id)
            .bind(&line.product_id)
            .bind(&line.name)
            .bind(&line.image)
            .bind(line.quantity as i32)
            .bind(line.unit_price.minor())
            .bind(&line.variant_description)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)?;

    publish_events(&s, &mut order).await;
    Ok((StatusCode::CREATED, Json(order_response(&record))))
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: String,
    order_number: String,
    buyer_id: String,
    status: String,
    subtotal: i64,
    shipping_amount: i64,
    discount_amount: i64,
    payment_amount: i64,
    shipping_method: String,
    payment_method: String,
    transaction_id: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    tracking_number: Option<String>,
    remark: Option<String>,
    shipping_address: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    product_id: String,
    name: String,
    image: String,
    quantity: i32,
    unit_price: i64,
    variant_description: String,
}

fn record_from_rows(row: OrderRow, items: Vec<OrderItemRow>) -> Result<OrderRecord, ApiError> {
    let status = OrderStatus::from_str(&row.status).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let shipping_method =
        ShippingMethod::from_str(&row.shipping_method).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let shipping_address: Address = serde_json::from_value(row.shipping_address)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(OrderRecord {
        id: row.id,
        order_number: OrderNumber::from(row.order_number),
        buyer_id: row.buyer_id,
        status,
        items: items
            .into_iter()
            .map(|i| OrderLine {
                product_id: i.product_id,
                name: i.name,
                image: i.image,
                quantity: i.quantity.max(0) as u32,
                unit_price: Money::from_minor(i.unit_price),
                variant_description: i.variant_description,
            })
            .collect(),
        shipping_address,
        subtotal: Money::from_minor(row.subtotal),
        shipping_amount: Money::from_minor(row.shipping_amount),
        discount_amount: Money::from_minor(row.discount_amount),
        payment_amount: Money::from_minor(row.payment_amount),
        shipping_method,
        payment_method: row.payment_method,
        transaction_id: row.transaction_id,
        paid_at: row.paid_at,
        tracking_number: row.tracking_number,
        remark: row.remark,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

async fn load_record(
    conn: &mut PgConnection,
    id: &str,
    buyer: Option<&str>,
    lock: bool,
) -> Result<Option<OrderRecord>, ApiError> {
    let sql = match (buyer.is_some(), lock) {
        (true, true) => "SELECT * FROM orders WHERE id = $1 AND buyer_id = $2 FOR UPDATE",
        (true, false) => "SELECT * FROM orders WHERE id = $1 AND buyer_id = $2",
        (false, true) => "SELECT * FROM orders WHERE id = $1 FOR UPDATE",
        (false, false) => "SELECT * FROM orders WHERE id = $1",
    };
    let mut query = sqlx::query_as::<_, OrderRow>(sql).bind(id);
    if let Some(buyer) = buyer {
        query = query.bind(buyer);
    }
    let Some(row) = query.fetch_optional(&mut *conn).await.map_err(db_err)? else {
        return Ok(None);
    };
    let items = sqlx::query_as::<_, OrderItemRow>(
        "SELECT product_id, name, image, quantity, unit_price, variant_description FROM order_items WHERE order_id = $1",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    record_from_rows(row, items).map(Some)
}

async fn persist_transition(conn: &mut PgConnection, record: &OrderRecord) -> Result<(), ApiError> {
    sqlx::query("UPDATE orders SET status = $2, transaction_id = $3, paid_at = $4, tracking_number = $5, updated_at = $6 WHERE id = $1")
        .bind(&record.id)
        .bind(record.status.to_string())
        .bind(&record.transaction_id)
        .bind(record.paid_at)
        .bind(&record.tracking_number)
        .bind(record.updated_at)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub name: String,
    pub image: String,
    pub quantity: u32,
    pub price: i64,
    pub variant_description: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentInfo {
    pub method: String,
    pub amount: i64,
    pub paid_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ShippingInfo {
    pub method: &'static str,
    pub fee: i64,
    pub tracking_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub order_number: String,
    pub status: String,
    pub items: Vec<OrderItemResponse>,
    pub address: Address,
    pub payment: PaymentInfo,
    pub shipping: ShippingInfo,
    pub subtotal: i64,
    pub discount: i64,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn order_response(record: &OrderRecord) -> OrderResponse {
    OrderResponse {
        id: record.id.clone(),
        order_number: record.order_number.to_string(),
        status: record.status.to_string(),
        items: record
            .items
            .iter()
            .map(|i| OrderItemResponse {
                product_id: i.product_id.clone(),
                name: i.name.clone(),
                image: i.image.clone(),
                quantity: i.quantity,
                price: i.unit_price.minor(),
                variant_description: i.variant_description.clone(),
            })
            .collect(),
        address: record.shipping_address.clone(),
        payment: PaymentInfo {
            method: record.payment_method.clone(),
            amount: record.payment_amount.minor(),
            paid_at: record.paid_at,
            transaction_id: record.transaction_id.clone(),
        },
        shipping: ShippingInfo {
            method: record.shipping_method.label(),
            fee: record.shipping_amount.minor(),
            tracking_number: record.tracking_number.clone(),
        },
        subtotal: record.subtotal.minor(),
        discount: record.discount_amount.minor(),
        remark: record.remark.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub user: String,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
}

async fn list_orders(
    State(s): State<AppState>,
    Query(p): Query<ListParams>,
) -> Result<Json<PaginatedResponse<OrderResponse>>, ApiError> {
    let page = p.page.unwrap_or(1).max(1);
    let per_page = p.per_page.unwrap_or(10).clamp(1, 100);
    let offset = (page as i64 - 1) * per_page as i64;

    let (rows, total) = if let Some(status) = &p.status {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE buyer_id = $1 AND status = $2 ORDER BY created_at DESC LIMIT $3 OFFSET $4",
        )
        .bind(&p.user)
        .bind(status)
        .bind(per_page as i64)
        .bind(offset)
        .fetch_all(&s.db)
        .await
        .map_err(db_err)?;
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE buyer_id = $1 AND status = $2")
            .bind(&p.user)
            .bind(status)
            .fetch_one(&s.db)
            .await
            .map_err(db_err)?;
        (rows, total.0)
    } else {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE buyer_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(&p.user)
        .bind(per_page as i64)
        .bind(offset)
        .fetch_all(&s.db)
        .await
        .map_err(db_err)?;
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE buyer_id = $1")
            .bind(&p.user)
            .fetch_one(&s.db)
            .await
            .map_err(db_err)?;
        (rows, total.0)
    };

    let mut data = Vec::with_capacity(rows.len());
    for row in rows {
        let items = sqlx::query_as::<_, OrderItemRow>(
            "SELECT product_id, name, image, quantity, unit_price, variant_description FROM order_items WHERE order_id = $1",
        )
        .bind(&row.id)
        .fetch_all(&s.db)
        .await
        .map_err(db_err)?;
        data.push(order_response(&record_from_rows(row, items)?));
    }

    Ok(Json(PaginatedResponse { data, total, page }))
}

/// Buyer-facing detail reads are always scoped: an id that exists but
/// belongs to someone else answers the same 404 as an unknown id.
#[derive(Debug, Deserialize)]
pub struct GetOrderParams {
    pub user: String,
}

async fn get_order(
    State(s): State<AppState>,
    Path(id): Path<String>,
    Query(p): Query<GetOrderParams>,
) -> Result<Json<OrderResponse>, ApiError> {
    let mut conn = s.db.acquire().await.map_err(db_err)?;
    let record = load_record(&mut conn, &id, Some(&p.user), false)
        .await?
        .ok_or((StatusCode::NOT_FOUND, "Order not found".to_string()))?;
    Ok(Json(order_response(&record)))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
}

async fn cancel_order(
    State(s): State<AppState>,
    Path(id): Path<String>,
    Json(r): Json<CancelRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let mut tx = s.db.begin().await.map_err(db_err)?;
    let record = load_record(&mut tx, &id, Some(&r.user_id), true).await?.ok_or_else(not_cancellable)?;
    let mut order = Order::from_record(record);
    order.cancel().map_err(|_| not_cancellable())?;
    persist_transition(&mut tx, order.record()).await?;
    tx.commit().await.map_err(db_err)?;
    publish_events(&s, &mut order).await;
    Ok(Json(order_response(order.record())))
}

#[derive(Debug, Deserialize)]
pub struct ShipRequest {
    pub tracking_number: Option<String>,
}

async fn ship_order(
    State(s): State<AppState>,
    Path(id): Path<String>,
    Json(r): Json<ShipRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let mut tx = s.db.begin().await.map_err(db_err)?;
    let record = load_record(&mut tx, &id, None, true)
        .await?
        .ok_or((StatusCode::NOT_FOUND, "Order not found".to_string()))?;
    let mut order = Order::from_record(record);
    order.ship(r.tracking_number).map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    persist_transition(&mut tx, order.record()).await?;
    tx.commit().await.map_err(db_err)?;
    publish_events(&s, &mut order).await;
    Ok(Json(order_response(order.record())))
}

async fn deliver_order(State(s): State<AppState>, Path(id): Path<String>) -> Result<Json<OrderResponse>, ApiError> {
    let mut tx = s.db.begin().await.map_err(db_err)?;
    let record = load_record(&mut tx, &id, None, true)
        .await?
        .ok_or((StatusCode::NOT_FOUND, "Order not found".to_string()))?;
    let mut order = Order::from_record(record);
    order.deliver().map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    persist_transition(&mut tx, order.record()).await?;
    tx.commit().await.map_err(db_err)?;
    publish_events(&s, &mut order).await;
    Ok(Json(order_response(order.record())))
}

// =============================================================================
// Payments (mock collaborator)
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PaymentCallbackRequest {
    pub order_id: String,
    pub success: bool,
    pub transaction_id: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentCallbackResponse {
    pub received: bool,
    pub applied: bool,
    pub status: Option<String>,
}

/// Mock payment confirmation. Idempotent: redelivering the confirmation that
/// paid the order answers success without transitioning again; a conflicting
/// confirmation is rejected.
async fn payment_callback(
    State(s): State<AppState>,
    Json(r): Json<PaymentCallbackRequest>,
) -> Result<Json<PaymentCallbackResponse>, ApiError> {
    if !r.success {
        tracing::info!(order_id = %r.order_id, "payment failed, order stays pending");
        return Ok(Json(PaymentCallbackResponse { received: true, applied: false, status: None }));
    }

    let mut tx = s.db.begin().await.map_err(db_err)?;
    let record = load_record(&mut tx, &r.order_id, None, true)
        .await?
        .ok_or((StatusCode::NOT_FOUND, "Order not found".to_string()))?;
    let mut order = Order::from_record(record);
    let applied = order
        .confirm_payment(&r.transaction_id)
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;
    if applied {
        persist_transition(&mut tx, order.record()).await?;
    }
    tx.commit().await.map_err(db_err)?;
    publish_events(&s, &mut order).await;

    Ok(Json(PaymentCallbackResponse {
        received: true,
        applied,
        status: Some(order.status().to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_detail_requires_buyer_scope() {
        // Omitting the buyer must fail deserialization, not fall through to
        // an unscoped lookup of someone else's order.
        assert!(serde_json::from_value::<GetOrderParams>(serde_json::json!({})).is_err());
        let p: GetOrderParams = serde_json::from_value(serde_json::json!({"user": "u1"})).unwrap();
        assert_eq!(p.user, "u1");
    }
}
