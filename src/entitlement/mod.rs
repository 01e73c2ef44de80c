//! Entitlement and guard engine
//!
//! Tier rules, the three pre-action guards, the billing webhook cascade and
//! the reconciliation sweep that heals runtime flags the cascade failed to
//! propagate.

pub mod guard;
pub mod reconcile;
pub mod webhook;

pub use guard::{GuardDecision, GuardEngine, GuardReason};
pub use reconcile::{ReconcileReport, Reconciler};
pub use webhook::{sign_payload, verify_signature, BillingWebhookHandler, WebhookAck};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::domain::{CascadeSummary, StrategyInstance, SubscriptionTier, Tenant};
use crate::error::Result;

/// System of record for tenants and their strategy instances
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>>;

    async fn tenant_by_org(&self, org_id: &str) -> Result<Option<Tenant>>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    async fn count_active_strategies(&self, tenant_id: Uuid) -> Result<u64>;

    async fn strategies_for(&self, tenant_id: Uuid) -> Result<Vec<StrategyInstance>>;

    /// Mark the tenant active and optionally change its tier.
    /// Returns whether anything changed.
    async fn apply_billing_activation(
        &self,
        tenant_id: Uuid,
        tier: Option<SubscriptionTier>,
    ) -> Result<bool>;

    /// Deactivate the tenant and every strategy it owns in one transaction
    async fn deactivate_cascade(&self, tenant_id: Uuid) -> Result<CascadeSummary>;
}

/// Limits derived from a tier. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierEntitlements {
    pub tier: SubscriptionTier,
    pub max_active_strategies: Option<u64>,
    pub daily_trade_limit: Option<u64>,
    pub priority_access: bool,
}

/// Basic-tier limits, configurable per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitlementPolicy {
    pub basic_strategy_limit: u64,
    pub basic_daily_trade_limit: u64,
}

impl Default for EntitlementPolicy {
    fn default() -> Self {
        Self {
            basic_strategy_limit: 1,
            basic_daily_trade_limit: 5,
        }
    }
}

impl From<&BillingConfig> for EntitlementPolicy {
    fn from(cfg: &BillingConfig) -> Self {
        Self {
            basic_strategy_limit: cfg.basic_strategy_limit,
            basic_daily_trade_limit: cfg.basic_daily_trade_limit,
        }
    }
}

impl EntitlementPolicy {
    pub fn entitlements(&self, tier: SubscriptionTier) -> TierEntitlements {
        match tier {
            SubscriptionTier::Basic => TierEntitlements {
                tier,
                max_active_strategies: Some(self.basic_strategy_limit),
                daily_trade_limit: Some(self.basic_daily_trade_limit),
                priority_access: false,
            },
            SubscriptionTier::Pro => TierEntitlements {
                tier,
                max_active_strategies: None,
                daily_trade_limit: None,
                priority_access: true,
            },
        }
    }
}
