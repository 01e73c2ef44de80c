use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Billing provider events
        .route("/webhooks/billing", post(handlers::billing_webhook))
        // Entitlement guards
        .route(
            "/guards/strategy-creation/:tenant_id",
            get(handlers::guard_strategy_creation),
        )
        .route(
            "/guards/trade-execution/:tenant_id",
            post(handlers::guard_trade_execution),
        )
        .route(
            "/guards/priority-access/:tenant_id",
            get(handlers::guard_priority_access),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
