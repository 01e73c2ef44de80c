use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EntitlementPolicy, TenantDirectory, TierEntitlements};
use crate::domain::{SubscriptionTier, Tenant};
use crate::runtime::{trade_count_key_at, trade_counter_ttl_at, RuntimeStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    Ok,
    TenantInactive,
    LimitExceeded,
    ProTierRequired,
    TenantNotFound,
    StateUnavailable,
}

impl GuardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardReason::Ok => "ok",
            GuardReason::TenantInactive => "tenant_inactive",
            GuardReason::LimitExceeded => "limit_exceeded",
            GuardReason::ProTierRequired => "pro_tier_required",
            GuardReason::TenantNotFound => "tenant_not_found",
            GuardReason::StateUnavailable => "state_unavailable",
        }
    }
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a guard. Guards never error; failures deny with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: GuardReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<TierEntitlements>,
    /// Trades used today after this decision (Basic tier only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_today: Option<u64>,
}

impl GuardDecision {
    fn allow(message: impl Into<String>, entitlements: TierEntitlements) -> Self {
        Self {
            allowed: true,
            reason: GuardReason::Ok,
            message: message.into(),
            entitlements: Some(entitlements),
            used_today: None,
        }
    }

    fn deny(reason: GuardReason, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            message: message.into(),
            entitlements: None,
            used_today: None,
        }
    }

    fn with_entitlements(mut self, entitlements: TierEntitlements) -> Self {
        self.entitlements = Some(entitlements);
        self
    }
}

/// Pre-action guards.
///
/// Activity comes from the runtime store, the tier from the system of record.
/// Every path that cannot establish a positive answer denies.
pub struct GuardEngine {
    directory: Arc<dyn TenantDirectory>,
    runtime: Arc<dyn RuntimeStore>,
    policy: EntitlementPolicy,
}

impl GuardEngine {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        runtime: Arc<dyn RuntimeStore>,
        policy: EntitlementPolicy,
    ) -> Self {
        Self {
            directory,
            runtime,
            policy,
        }
    }

    /// Common prelude: active flag, then tenant lookup
    async fn active_tenant(&self, tenant_id: Uuid) -> Result<Tenant, GuardDecision> {
        match self.runtime.is_active(tenant_id).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(GuardDecision::deny(
                    GuardReason::TenantInactive,
                    "Tenant is inactive",
                ))
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Runtime store unavailable, denying");
                return Err(GuardDecision::deny(
                    GuardReason::StateUnavailable,
                    "Tenant state is temporarily unavailable",
                ));
            }
        }

        match self.directory.tenant(tenant_id).await {
            Ok(Some(tenant)) => Ok(tenant),
            Ok(None) => Err(GuardDecision::deny(
                GuardReason::TenantNotFound,
                "Tenant not found",
            )),
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Tenant lookup failed, denying");
                Err(GuardDecision::deny(
                    GuardReason::StateUnavailable,
                    "Tenant state is temporarily unavailable",
                ))
            }
        }
    }

    pub async fn guard_strategy_creation(&self, tenant_id: Uuid) -> GuardDecision {
        let tenant = match self.active_tenant(tenant_id).await {
            Ok(t) => t,
            Err(decision) => return decision,
        };
        let ent = self.policy.entitlements(tenant.subscription_tier);

        let Some(limit) = ent.max_active_strategies else {
            return GuardDecision::allow("Pro tier: unlimited strategies", ent);
        };

        match self.directory.count_active_strategies(tenant_id).await {
            Ok(count) if count >= limit => {
                debug!(tenant_id = %tenant_id, count, limit, "Strategy limit reached");
                GuardDecision::deny(
                    GuardReason::LimitExceeded,
                    format!(
                        "Basic tier allows {} active strateg{}. Upgrade to Pro for unlimited strategies.",
                        limit,
                        if limit == 1 { "y" } else { "ies" }
                    ),
                )
                .with_entitlements(ent)
            }
            Ok(_) => GuardDecision::allow("Strategy creation allowed", ent),
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Strategy count failed, denying");
                GuardDecision::deny(
                    GuardReason::StateUnavailable,
                    "Tenant state is temporarily unavailable",
                )
            }
        }
    }

    pub async fn guard_trade_execution(&self, tenant_id: Uuid) -> GuardDecision {
        self.guard_trade_execution_at(tenant_id, Utc::now()).await
    }

    /// Trade guard against an explicit clock; the counter belongs to the UTC day of `now`.
    pub async fn guard_trade_execution_at(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> GuardDecision {
        let tenant = match self.active_tenant(tenant_id).await {
            Ok(t) => t,
            Err(decision) => return decision,
        };
        let ent = self.policy.entitlements(tenant.subscription_tier);

        let Some(limit) = ent.daily_trade_limit else {
            return GuardDecision::allow("Pro tier: unlimited trades", ent);
        };

        let key = trade_count_key_at(tenant_id, now);
        match self
            .runtime
            .increment_within_limit(&key, limit, trade_counter_ttl_at(now))
            .await
        {
            Ok(Some(used)) => {
                let mut decision = GuardDecision::allow(
                    format!("Trade allowed ({} of {} today)", used, limit),
                    ent,
                );
                decision.used_today = Some(used);
                decision
            }
            Ok(None) => {
                debug!(tenant_id = %tenant_id, limit, "Daily trade limit reached");
                let mut decision = GuardDecision::deny(
                    GuardReason::LimitExceeded,
                    format!(
                        "Basic tier allows {} trades per day. Upgrade to Pro for unlimited trading.",
                        limit
                    ),
                )
                .with_entitlements(ent);
                decision.used_today = Some(limit);
                decision
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Trade counter unavailable, denying");
                GuardDecision::deny(
                    GuardReason::StateUnavailable,
                    "Tenant state is temporarily unavailable",
                )
            }
        }
    }

    pub async fn guard_priority_access(&self, tenant_id: Uuid) -> GuardDecision {
        let tenant = match self.active_tenant(tenant_id).await {
            Ok(t) => t,
            Err(decision) => return decision,
        };
        let ent = self.policy.entitlements(tenant.subscription_tier);
        match tenant.subscription_tier {
            SubscriptionTier::Pro => GuardDecision::allow("Priority access granted", ent),
            SubscriptionTier::Basic => GuardDecision::deny(
                GuardReason::ProTierRequired,
                "Priority execution requires the Pro tier",
            )
            .with_entitlements(ent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::{StrategyInstance, SubscriptionTier, Tenant};
    use crate::runtime::MemoryRuntimeStore;
    use chrono::TimeZone;

    struct Fixture {
        store: Arc<MemoryStore>,
        runtime: Arc<MemoryRuntimeStore>,
        engine: GuardEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MemoryRuntimeStore::new());
        let engine = GuardEngine::new(
            store.clone(),
            runtime.clone(),
            EntitlementPolicy::default(),
        );
        Fixture {
            store,
            runtime,
            engine,
        }
    }

    async fn tenant(f: &Fixture, tier: SubscriptionTier, active: bool) -> Uuid {
        let tenant = Tenant::new(format!("org_{}", Uuid::new_v4()), tier);
        let id = tenant.id;
        f.store.insert_tenant(tenant);
        f.runtime.set_active(id, active).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_inactive_tenant_fails_every_guard() {
        let f = fixture();
        for tier in [SubscriptionTier::Basic, SubscriptionTier::Pro] {
            let id = tenant(&f, tier, false).await;
            assert_eq!(
                f.engine.guard_strategy_creation(id).await.reason,
                GuardReason::TenantInactive
            );
            assert_eq!(
                f.engine.guard_trade_execution(id).await.reason,
                GuardReason::TenantInactive
            );
            assert_eq!(
                f.engine.guard_priority_access(id).await.reason,
                GuardReason::TenantInactive
            );
        }
    }

    #[tokio::test]
    async fn test_basic_strategy_limit() {
        let f = fixture();
        let id = tenant(&f, SubscriptionTier::Basic, true).await;
        assert!(f.engine.guard_strategy_creation(id).await.allowed);

        f.store
            .insert_strategy(StrategyInstance::new(id, "momentum", "equity_momentum"));
        let decision = f.engine.guard_strategy_creation(id).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, GuardReason::LimitExceeded);
    }

    #[tokio::test]
    async fn test_pro_passes_without_counting() {
        let f = fixture();
        let id = tenant(&f, SubscriptionTier::Pro, true).await;
        for _ in 0..20 {
            assert!(f.engine.guard_trade_execution(id).await.allowed);
        }
        let key = trade_count_key_at(id, Utc::now());
        assert_eq!(f.runtime.counter(&key).await.unwrap(), 0);
        assert!(f.engine.guard_priority_access(id).await.allowed);
    }

    #[tokio::test]
    async fn test_basic_daily_limit_and_rejections_do_not_count() {
        let f = fixture();
        let id = tenant(&f, SubscriptionTier::Basic, true).await;
        for n in 1..=5 {
            let decision = f.engine.guard_trade_execution(id).await;
            assert!(decision.allowed, "trade {} should pass", n);
            assert_eq!(decision.used_today, Some(n));
        }
        for _ in 0..3 {
            let decision = f.engine.guard_trade_execution(id).await;
            assert_eq!(decision.reason, GuardReason::LimitExceeded);
        }
        let key = trade_count_key_at(id, Utc::now());
        assert_eq!(f.runtime.counter(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_counter_resets_next_utc_day() {
        let f = fixture();
        let id = tenant(&f, SubscriptionTier::Basic, true).await;
        let late = Utc.with_ymd_and_hms(2026, 5, 1, 23, 59, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 1).unwrap();
        for _ in 0..5 {
            assert!(f.engine.guard_trade_execution_at(id, late).await.allowed);
        }
        assert!(!f.engine.guard_trade_execution_at(id, late).await.allowed);
        assert!(f.engine.guard_trade_execution_at(id, next).await.allowed);
    }

    #[tokio::test]
    async fn test_priority_requires_pro() {
        let f = fixture();
        let id = tenant(&f, SubscriptionTier::Basic, true).await;
        assert_eq!(
            f.engine.guard_priority_access(id).await.reason,
            GuardReason::ProTierRequired
        );
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let f = fixture();
        let id = tenant(&f, SubscriptionTier::Pro, true).await;
        f.runtime.set_unavailable(true);
        let decision = f.engine.guard_priority_access(id).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, GuardReason::StateUnavailable);
    }

    #[tokio::test]
    async fn test_unknown_tenant_denied() {
        let f = fixture();
        let ghost = Uuid::new_v4();
        f.runtime.set_active(ghost, true).await.unwrap();
        assert_eq!(
            f.engine.guard_strategy_creation(ghost).await.reason,
            GuardReason::TenantNotFound
        );
    }
}
