use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::entitlement::{GuardDecision, GuardReason};

/// 200 on pass, 503 when tenant state could not be read, 403 otherwise
fn respond(decision: GuardDecision) -> (StatusCode, Json<GuardDecision>) {
    let status = match decision.reason {
        GuardReason::Ok => StatusCode::OK,
        GuardReason::StateUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::FORBIDDEN,
    };
    (status, Json(decision))
}

/// GET /guards/strategy-creation/:tenant_id
pub async fn guard_strategy_creation(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> (StatusCode, Json<GuardDecision>) {
    respond(state.guards.guard_strategy_creation(tenant_id).await)
}

/// POST /guards/trade-execution/:tenant_id
///
/// Consumes one unit of the daily trade allowance when allowed.
pub async fn guard_trade_execution(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> (StatusCode, Json<GuardDecision>) {
    respond(state.guards.guard_trade_execution(tenant_id).await)
}

/// GET /guards/priority-access/:tenant_id
pub async fn guard_priority_access(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> (StatusCode, Json<GuardDecision>) {
    respond(state.guards.guard_priority_access(tenant_id).await)
}
