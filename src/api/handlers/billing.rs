use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::api::state::AppState;
use crate::entitlement::WebhookAck;
use crate::error::OrraError;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn status_for(err: &OrraError) -> StatusCode {
    match err {
        OrraError::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
        OrraError::Validation(_) | OrraError::Json(_) => StatusCode::BAD_REQUEST,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /webhooks/billing
///
/// The raw body is verified before it is parsed.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<WebhookAck>, (StatusCode, Json<ErrorBody>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.billing.handle(&body, signature).await {
        Ok(ack) => Ok(Json(ack)),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(error = %e, "Billing webhook failed");
            } else {
                warn!(error = %e, "Billing webhook rejected");
            }
            Err((
                status,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            ))
        }
    }
}
