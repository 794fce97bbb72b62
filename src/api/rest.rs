// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// `GET /health` requires no authentication. Every other route is gated by the
// `AuthBearer` extractor. CORS is configured permissively for development;
// tighten `allowed_origins` before exposing this beyond a local network.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::control::Engine;
use crate::router::PlaceResult;
use crate::types::{AccountMode, Order, OrderKind, Side};

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/switch_mode", post(switch_mode))
        .route("/orders/place", post(place_order))
        .route("/orders/:id", delete(cancel_order))
        .route("/positions", get(positions))
        .route("/stats", get(stats))
        .route("/risk/limits", post(update_risk_limits))
        .route("/risk/reset_kill_switch", post(reset_kill_switch))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.health())
}

// =============================================================================
// Trading mode / account mode
// =============================================================================

#[derive(Deserialize)]
struct SwitchModeRequest {
    mode: String,
}

#[derive(Serialize)]
struct SwitchModeResponse {
    accepted: bool,
    reason: Option<String>,
    trading_mode: String,
    account_mode: String,
}

/// `mode` names either a trading-state transition (`live`/`paused`/`killed`)
/// or an account-mode transition (`paper`/`live-trading`) — the two
/// dimensions the engine tracks independently.
async fn switch_mode(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SwitchModeRequest>,
) -> impl IntoResponse {
    let (accepted, reason) = match req.mode.to_lowercase().as_str() {
        "live" => {
            engine.set_trading_mode(crate::types::TradingMode::Live);
            warn!("trading mode switched to live via API");
            (true, None)
        }
        "paused" => {
            engine.set_trading_mode(crate::types::TradingMode::Paused);
            (true, None)
        }
        "killed" => {
            engine.set_trading_mode(crate::types::TradingMode::Killed);
            warn!("trading mode switched to killed via API");
            (true, None)
        }
        "paper" => {
            engine.switch_account_mode(AccountMode::Paper).ok();
            (true, None)
        }
        "live-trading" => match engine.switch_account_mode(AccountMode::Live) {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        },
        other => (false, Some(format!("unknown mode '{other}'"))),
    };

    let health = engine.health();
    Json(SwitchModeResponse { accepted, reason, trading_mode: health.trading_mode, account_mode: health.account_mode })
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct PlaceOrderRequest {
    symbol: String,
    side: String,
    #[serde(default)]
    kind: Option<String>,
    quantity: Decimal,
    #[serde(default)]
    limit_price: Option<Decimal>,
}

async fn place_order(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let side = match req.side.to_lowercase().as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => {
            return Err((StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": format!("unknown side '{other}'") }))))
        }
    };
    let kind = match req.kind.as_deref().unwrap_or("market").to_lowercase().as_str() {
        "market" => OrderKind::Market,
        "limit" => OrderKind::Limit,
        other => {
            return Err((StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": format!("unknown order kind '{other}'") }))))
        }
    };

    let order = Order::pending(req.symbol, side, kind, req.quantity, req.limit_price);
    match engine.place_order(order) {
        PlaceResult::Accepted { order_id } => Ok(Json(serde_json::json!({ "order_id": order_id, "status": "accepted" }))),
        PlaceResult::Rejected { reason } => Err((StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({ "error": reason })))),
    }
}

async fn cancel_order(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    if engine.cancel_order(id) {
        (StatusCode::OK, Json(serde_json::json!({ "cancelled": true })))
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({ "cancelled": false })))
    }
}

// =============================================================================
// Positions / stats
// =============================================================================

async fn positions(_auth: AuthBearer, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.positions())
}

async fn stats(_auth: AuthBearer, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.stats())
}

// =============================================================================
// Risk controls
// =============================================================================

#[derive(Deserialize)]
struct RiskLimitsRequest {
    #[serde(default)]
    daily_loss_limit_pct: Option<Decimal>,
    #[serde(default)]
    position_limit: Option<u32>,
    #[serde(default)]
    max_position_size_pct: Option<Decimal>,
    #[serde(default)]
    notional_cap: Option<Decimal>,
    #[serde(default)]
    total_exposure_pct: Option<Decimal>,
}

async fn update_risk_limits(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<RiskLimitsRequest>,
) -> impl IntoResponse {
    let mut limits = engine.risk_limits();
    if let Some(v) = req.daily_loss_limit_pct {
        limits.daily_loss_limit_pct = v;
    }
    if let Some(v) = req.position_limit {
        limits.position_limit = v;
    }
    if let Some(v) = req.max_position_size_pct {
        limits.max_position_size_pct = v;
    }
    if let Some(v) = req.notional_cap {
        limits.notional_cap = v;
    }
    if let Some(v) = req.total_exposure_pct {
        limits.total_exposure_pct = v;
    }
    engine.update_risk_limits(limits);
    info!("risk limits updated via API");
    Json(serde_json::json!({
        "daily_loss_limit_pct": limits.daily_loss_limit_pct,
        "position_limit": limits.position_limit,
        "max_position_size_pct": limits.max_position_size_pct,
        "notional_cap": limits.notional_cap,
        "total_exposure_pct": limits.total_exposure_pct,
    }))
}

async fn reset_kill_switch(_auth: AuthBearer, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.reset_kill_switch();
    warn!("kill switch reset via API");
    Json(serde_json::json!({ "killed": false }))
}
