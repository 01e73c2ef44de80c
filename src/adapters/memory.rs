//! In-process system of record for tests and `--in-memory` runs

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::agents::PreferenceSource;
use crate::domain::{
    CascadeSummary, CredentialValidity, NotificationPreference, StoredCredential,
    StrategyInstance, SubscriptionTier, Tenant,
};
use crate::entitlement::TenantDirectory;
use crate::error::{OrraError, Result};
use crate::vault::CredentialRepository;

#[derive(Default)]
pub struct MemoryStore {
    tenants: DashMap<Uuid, Tenant>,
    strategies: DashMap<Uuid, StrategyInstance>,
    credentials: DashMap<(Uuid, String), StoredCredential>,
    preferences: DashMap<Uuid, Vec<NotificationPreference>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id, tenant);
    }

    pub fn insert_strategy(&self, strategy: StrategyInstance) {
        self.strategies.insert(strategy.id, strategy);
    }

    pub fn insert_preference(&self, preference: NotificationPreference) {
        self.preferences
            .entry(preference.tenant_id)
            .or_default()
            .push(preference);
    }

    /// Make every call fail as if the database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OrraError::TransientIo(
                "system of record unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>> {
        self.check()?;
        Ok(self.tenants.get(&tenant_id).map(|t| t.clone()))
    }

    async fn tenant_by_org(&self, org_id: &str) -> Result<Option<Tenant>> {
        self.check()?;
        Ok(self
            .tenants
            .iter()
            .find(|t| t.org_id == org_id)
            .map(|t| t.clone()))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        self.check()?;
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|t| t.clone()).collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn count_active_strategies(&self, tenant_id: Uuid) -> Result<u64> {
        self.check()?;
        Ok(self
            .strategies
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.is_active)
            .count() as u64)
    }

    async fn strategies_for(&self, tenant_id: Uuid) -> Result<Vec<StrategyInstance>> {
        self.check()?;
        Ok(self
            .strategies
            .iter()
            .filter(|s| s.tenant_id == tenant_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn apply_billing_activation(
        &self,
        tenant_id: Uuid,
        tier: Option<SubscriptionTier>,
    ) -> Result<bool> {
        self.check()?;
        let Some(mut tenant) = self.tenants.get_mut(&tenant_id) else {
            return Ok(false);
        };
        let mut changed = !tenant.is_active;
        tenant.is_active = true;
        if let Some(tier) = tier {
            changed |= tenant.subscription_tier != tier;
            tenant.subscription_tier = tier;
        }
        Ok(changed)
    }

    async fn deactivate_cascade(&self, tenant_id: Uuid) -> Result<CascadeSummary> {
        self.check()?;
        let tenant_changed = match self.tenants.get_mut(&tenant_id) {
            Some(mut tenant) => std::mem::replace(&mut tenant.is_active, false),
            None => false,
        };
        let mut strategies_deactivated = 0;
        for mut strategy in self.strategies.iter_mut() {
            if strategy.tenant_id == tenant_id && strategy.is_active {
                strategy.is_active = false;
                strategies_deactivated += 1;
            }
        }
        Ok(CascadeSummary {
            tenant_changed,
            strategies_deactivated,
        })
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn upsert_credential(
        &self,
        tenant_id: Uuid,
        broker: &str,
        ciphertext: &str,
    ) -> Result<()> {
        self.check()?;
        self.credentials.insert(
            (tenant_id, broker.to_string()),
            StoredCredential {
                tenant_id,
                broker: broker.to_string(),
                ciphertext: ciphertext.to_string(),
                validity: CredentialValidity::Unknown,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn fetch_credential(
        &self,
        tenant_id: Uuid,
        broker: &str,
    ) -> Result<Option<StoredCredential>> {
        self.check()?;
        Ok(self
            .credentials
            .get(&(tenant_id, broker.to_string()))
            .map(|c| c.clone()))
    }

    async fn set_validity(
        &self,
        tenant_id: Uuid,
        broker: &str,
        validity: CredentialValidity,
    ) -> Result<bool> {
        self.check()?;
        match self.credentials.get_mut(&(tenant_id, broker.to_string())) {
            Some(mut stored) => {
                stored.validity = validity;
                stored.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn tenants_with_credentials(&self, broker: &str) -> Result<Vec<Uuid>> {
        self.check()?;
        let mut tenants: Vec<Uuid> = self
            .credentials
            .iter()
            .filter(|c| c.broker == broker)
            .map(|c| c.tenant_id)
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

#[async_trait]
impl PreferenceSource for MemoryStore {
    async fn preferences(&self, tenant_id: Uuid) -> Result<Vec<NotificationPreference>> {
        self.check()?;
        Ok(self
            .preferences
            .get(&tenant_id)
            .map(|p| p.iter().filter(|p| p.is_enabled).cloned().collect())
            .unwrap_or_default())
    }
}
