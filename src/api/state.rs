use std::sync::Arc;

use crate::entitlement::{BillingWebhookHandler, GuardEngine};

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub guards: Arc<GuardEngine>,
    pub billing: Arc<BillingWebhookHandler>,
}

impl AppState {
    pub fn new(guards: Arc<GuardEngine>, billing: Arc<BillingWebhookHandler>) -> Self {
        Self { guards, billing }
    }
}
