use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use diesel_async::{
    pooled_connection::bb8::{Pool, PooledConnection},
    AsyncPgConnection,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::checkout::{self, Address};
use crate::engine::{self, Policy};
use crate::{catalog, orders};
use shared::{
    CancelOutcome, CheckoutStage, ClaimHolder, ClaimOutcome, ClaimSummaryEntry, DeliveryMethod,
    EngineError, Money, OrderStatus, OrderView, QuantitySpec, RevokeOutcome,
};

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub admin_id: i64,
    pub tracked_fee: Money,
    pub policy: Policy,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<ServiceConfig>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(err: EngineError) -> ApiError {
    let (status, code) = match &err {
        EngineError::NotTracked => (StatusCode::NOT_FOUND, "not_tracked"),
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        EngineError::InvalidQuantity => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_quantity"),
        EngineError::NothingAvailable => (StatusCode::UNPROCESSABLE_ENTITY, "nothing_available"),
        EngineError::InsufficientStock { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_stock")
        }
        EngineError::InvalidAddress => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_address"),
        EngineError::InvalidTracking => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_tracking"),
        EngineError::DuplicateActiveClaim => (StatusCode::CONFLICT, "duplicate_active_claim"),
        EngineError::NoActiveClaims => (StatusCode::CONFLICT, "no_active_claims"),
        EngineError::CancelWindowExpired { .. } => (StatusCode::CONFLICT, "cancel_window_expired"),
        EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        EngineError::InvariantViolation(_) | EngineError::Database(_) | EngineError::Pool(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {err}");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code,
        }),
    )
}

/// One retry for transient transaction failures; the engine's claim
/// revival keeps the repeated call idempotent-safe.
async fn with_retry<T, F, Fut>(op: F) -> Result<T, EngineError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    match op().await {
        Err(err) if err.is_retryable() => {
            warn!("retrying after transient database error: {err}");
            op().await
        }
        other => other,
    }
}

async fn get_conn(
    state: &AppState,
) -> Result<PooledConnection<'_, AsyncPgConnection>, EngineError> {
    state
        .pool
        .get()
        .await
        .map_err(|e| EngineError::Pool(e.to_string()))
}

fn require_admin(state: &AppState, admin_id: i64) -> Result<(), ApiError> {
    if admin_id == state.config.admin_id {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "not the administrator".to_string(),
                code: "forbidden",
            }),
        ))
    }
}

fn parse_quantity(raw: Option<&str>) -> Result<QuantitySpec, ApiError> {
    match raw {
        None => Ok(QuantitySpec::default()),
        Some(s) => s.parse().map_err(error_response),
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/catalog", get(list_catalog))
        .route("/catalog/import", post(import_catalog))
        .route("/claims", post(claim))
        .route("/claims/cancel", post(cancel))
        .route("/claims/summary/:actor_id", get(claim_summary))
        .route("/checkout/start", post(checkout_start))
        .route("/checkout/delivery", post(checkout_delivery))
        .route("/checkout/confirm", post(checkout_confirm))
        .route("/checkout/payment-proof", post(checkout_payment_proof))
        .route("/checkout/address", post(checkout_address))
        .route("/checkout/address/confirm", post(checkout_address_confirm))
        .route("/checkout/address/reenter", post(checkout_address_reenter))
        .route("/orders/:actor_id", get(buyer_orders))
        .route("/orders/invoice/:invoice_no", get(order_by_invoice))
        .route("/admin/claim-holders", post(admin_claim_holders))
        .route("/admin/revoke", post(admin_revoke))
        .route("/admin/payment-review", post(admin_payment_review))
        .route("/admin/orders", post(admin_orders_by_status))
        .route("/admin/pack", post(admin_mark_packed))
        .route("/admin/ship/start", post(admin_ship_start))
        .route("/admin/ship/tracking", post(admin_ship_tracking))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

async fn list_catalog(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::models::CatalogItem>>, ApiError> {
    let items = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        catalog::list(&mut conn).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub admin_id: i64,
    pub csv: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub items_listed: usize,
}

async fn import_catalog(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let mut conn = get_conn(&state).await.map_err(error_response)?;
    let items_listed = catalog::import_catalog(&mut conn, &req.csv)
        .await
        .map_err(|e| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse {
                    error: format!("{e:#}"),
                    code: "invalid_catalog",
                }),
            )
        })?;
    Ok(Json(ImportResponse { items_listed }))
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub resource_id: i64,
    pub actor_id: i64,
    pub display_name: Option<String>,
    /// `"2"`, `"all"`, or absent for a single unit.
    pub quantity: Option<String>,
}

async fn claim(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimOutcome>, ApiError> {
    let quantity = parse_quantity(req.quantity.as_deref())?;
    let outcome = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        engine::claim(
            &mut conn,
            req.resource_id,
            req.actor_id,
            req.display_name.clone(),
            quantity,
        )
        .await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub resource_id: i64,
    pub actor_id: i64,
}

async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelOutcome>, ApiError> {
    let is_admin = req.actor_id == state.config.admin_id;
    let outcome = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        engine::cancel(
            &mut conn,
            req.resource_id,
            req.actor_id,
            is_admin,
            state.config.policy,
        )
        .await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(outcome))
}

async fn claim_summary(
    State(state): State<AppState>,
    Path(actor_id): Path<i64>,
) -> Result<Json<Vec<ClaimSummaryEntry>>, ApiError> {
    let summary = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        engine::summarize_claims(&mut conn, actor_id).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub actor_id: i64,
}

async fn checkout_start(
    State(state): State<AppState>,
    Json(req): Json<ActorRequest>,
) -> Result<Json<checkout::StartSessionResult>, ApiError> {
    let result = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::start_session(&mut conn, req.actor_id, state.config.policy).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct DeliveryRequest {
    pub actor_id: i64,
    pub method: DeliveryMethod,
}

async fn checkout_delivery(
    State(state): State<AppState>,
    Json(req): Json<DeliveryRequest>,
) -> Result<Json<checkout::DeliveryResult>, ApiError> {
    let result = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::choose_delivery(
            &mut conn,
            req.actor_id,
            req.method,
            state.config.tracked_fee.clone(),
        )
        .await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub actor_id: i64,
    pub display_name: Option<String>,
}

async fn checkout_confirm(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<OrderView>, ApiError> {
    let view = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::confirm_checkout(&mut conn, req.actor_id, req.display_name.clone()).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct PaymentProofRequest {
    pub actor_id: i64,
    pub proof_ref: String,
    pub proof_kind: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentProofResponse {
    pub invoice_no: String,
    pub stage: CheckoutStage,
}

async fn checkout_payment_proof(
    State(state): State<AppState>,
    Json(req): Json<PaymentProofRequest>,
) -> Result<Json<PaymentProofResponse>, ApiError> {
    let (invoice_no, stage) = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::submit_payment_proof(
            &mut conn,
            req.actor_id,
            req.proof_ref.clone(),
            req.proof_kind.clone(),
        )
        .await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(PaymentProofResponse { invoice_no, stage }))
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub actor_id: i64,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AddressResponse {
    pub address: Address,
    pub stage: CheckoutStage,
}

async fn checkout_address(
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<AddressResponse>, ApiError> {
    let (address, stage) = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::submit_address(&mut conn, req.actor_id, &req.text).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(AddressResponse { address, stage }))
}

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub stage: CheckoutStage,
    pub invoice_no: Option<String>,
}

async fn checkout_address_confirm(
    State(state): State<AppState>,
    Json(req): Json<ActorRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let (invoice_no, stage) = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::confirm_address(&mut conn, req.actor_id).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(StageResponse {
        stage,
        invoice_no: Some(invoice_no),
    }))
}

async fn checkout_address_reenter(
    State(state): State<AppState>,
    Json(req): Json<ActorRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    let stage = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::reenter_address(&mut conn, req.actor_id).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(StageResponse {
        stage,
        invoice_no: None,
    }))
}

async fn buyer_orders(
    State(state): State<AppState>,
    Path(actor_id): Path<i64>,
) -> Result<Json<Vec<OrderView>>, ApiError> {
    let views = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        orders::orders_for_buyer(&mut conn, actor_id).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub actor_id: i64,
}

async fn order_by_invoice(
    State(state): State<AppState>,
    Path(invoice_no): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<OrderView>, ApiError> {
    let view = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        orders::view_by_invoice(&mut conn, &invoice_no).await
    })
    .await
    .map_err(error_response)?;
    if view.buyer_id != owner.actor_id && owner.actor_id != state.config.admin_id {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "that invoice does not belong to you".to_string(),
                code: "forbidden",
            }),
        ));
    }
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    pub admin_id: i64,
}

async fn admin_claim_holders(
    State(state): State<AppState>,
    Json(req): Json<AdminRequest>,
) -> Result<Json<Vec<ClaimHolder>>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let holders = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        engine::list_claim_holders(&mut conn).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(holders))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub admin_id: i64,
    pub actor_id: i64,
    pub resource_id: i64,
}

async fn admin_revoke(
    State(state): State<AppState>,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<RevokeOutcome>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let outcome = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        engine::admin_revoke(
            &mut conn,
            req.admin_id,
            req.actor_id,
            req.resource_id,
            state.config.policy,
        )
        .await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct PaymentReviewRequest {
    pub admin_id: i64,
    pub invoice_no: String,
    pub approve: bool,
}

#[derive(Debug, Serialize)]
pub struct PaymentReviewResponse {
    pub invoice_no: String,
    pub status: OrderStatus,
    pub needs_address: bool,
}

async fn admin_payment_review(
    State(state): State<AppState>,
    Json(req): Json<PaymentReviewRequest>,
) -> Result<Json<PaymentReviewResponse>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let result = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::review_payment(&mut conn, req.invoice_no.clone(), req.approve).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(PaymentReviewResponse {
        invoice_no: req.invoice_no,
        status: result.status,
        needs_address: result.needs_address,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OrdersByStatusRequest {
    pub admin_id: i64,
    pub status: OrderStatus,
}

async fn admin_orders_by_status(
    State(state): State<AppState>,
    Json(req): Json<OrdersByStatusRequest>,
) -> Result<Json<Vec<OrderView>>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let views = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        orders::orders_by_status(&mut conn, req.status).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct InvoiceRequest {
    pub admin_id: i64,
    pub invoice_no: String,
}

#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub invoice_no: String,
    pub status: OrderStatus,
}

async fn admin_mark_packed(
    State(state): State<AppState>,
    Json(req): Json<InvoiceRequest>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let (_, status) = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        orders::mark_packed(&mut conn, req.invoice_no.clone()).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(OrderStatusResponse {
        invoice_no: req.invoice_no,
        status,
    }))
}

async fn admin_ship_start(
    State(state): State<AppState>,
    Json(req): Json<InvoiceRequest>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    require_admin(&state, req.admin_id)?;
    with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::start_shipping(&mut conn, req.admin_id, req.invoice_no.clone()).await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(OrderStatusResponse {
        invoice_no: req.invoice_no,
        status: OrderStatus::Packed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TrackingRequest {
    pub admin_id: i64,
    /// Label text from the OCR collaborator, or typed by hand.
    pub text: String,
    pub shipping_proof_ref: Option<String>,
}

async fn admin_ship_tracking(
    State(state): State<AppState>,
    Json(req): Json<TrackingRequest>,
) -> Result<Json<checkout::ShipResult>, ApiError> {
    require_admin(&state, req.admin_id)?;
    let result = with_retry(|| async {
        let mut conn = get_conn(&state).await?;
        checkout::submit_tracking(
            &mut conn,
            req.admin_id,
            &req.text,
            req.shipping_proof_ref.clone(),
        )
        .await
    })
    .await
    .map_err(error_response)?;
    Ok(Json(result))
}
