use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::agents::PreferenceSource;
use crate::domain::{
    CascadeSummary, ChannelKind, CredentialValidity, NotificationPreference, StoredCredential,
    StrategyInstance, SubscriptionTier, Tenant,
};
use crate::entitlement::TenantDirectory;
use crate::error::Result;
use crate::vault::CredentialRepository;

/// PostgreSQL system of record
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn tenant_from_row(r: &PgRow) -> Tenant {
    Tenant {
        id: r.get("id"),
        org_id: r.get("org_id"),
        subscription_tier: SubscriptionTier::normalize(r.get::<&str, _>("subscription_tier")),
        is_active: r.get("is_active"),
        created_at: r.get("created_at"),
    }
}

const TENANT_COLUMNS: &str = "id, org_id, subscription_tier, is_active, created_at";

#[async_trait]
impl TenantDirectory for PostgresStore {
    async fn tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tenants WHERE id = $1",
            TENANT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(tenant_from_row))
    }

    async fn tenant_by_org(&self, org_id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tenants WHERE org_id = $1",
            TENANT_COLUMNS
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(tenant_from_row))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tenants ORDER BY created_at",
            TENANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tenant_from_row).collect())
    }

    async fn count_active_strategies(&self, tenant_id: Uuid) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM strategy_instances WHERE tenant_id = $1 AND is_active",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    async fn strategies_for(&self, tenant_id: Uuid) -> Result<Vec<StrategyInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, name, strategy_type, is_active
            FROM strategy_instances
            WHERE tenant_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| StrategyInstance {
                id: r.get("id"),
                tenant_id: r.get("tenant_id"),
                name: r.get("name"),
                strategy_type: r.get("strategy_type"),
                is_active: r.get("is_active"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn apply_billing_activation(
        &self,
        tenant_id: Uuid,
        tier: Option<SubscriptionTier>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants SET
                is_active = TRUE,
                subscription_tier = COALESCE($2, subscription_tier)
            WHERE id = $1
              AND (NOT is_active OR ($2 IS NOT NULL AND subscription_tier <> $2))
            "#,
        )
        .bind(tenant_id)
        .bind(tier.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn deactivate_cascade(&self, tenant_id: Uuid) -> Result<CascadeSummary> {
        let mut tx = self.pool.begin().await?;

        let tenant = sqlx::query("UPDATE tenants SET is_active = FALSE WHERE id = $1 AND is_active")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

        let strategies = sqlx::query(
            "UPDATE strategy_instances SET is_active = FALSE WHERE tenant_id = $1 AND is_active",
        )
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let summary = CascadeSummary {
            tenant_changed: tenant.rows_affected() > 0,
            strategies_deactivated: strategies.rows_affected(),
        };
        debug!(?summary, "Deactivation cascade committed");
        Ok(summary)
    }
}

#[async_trait]
impl CredentialRepository for PostgresStore {
    async fn upsert_credential(
        &self,
        tenant_id: Uuid,
        broker: &str,
        ciphertext: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broker_credentials (tenant_id, broker, ciphertext, validity, updated_at)
            VALUES ($1, $2, $3, 'unknown', NOW())
            ON CONFLICT (tenant_id, broker) DO UPDATE SET
                ciphertext = EXCLUDED.ciphertext,
                validity = 'unknown',
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(broker)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_credential(
        &self,
        tenant_id: Uuid,
        broker: &str,
    ) -> Result<Option<StoredCredential>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, broker, ciphertext, validity, updated_at
            FROM broker_credentials
            WHERE tenant_id = $1 AND broker = $2
            "#,
        )
        .bind(tenant_id)
        .bind(broker)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredCredential {
            tenant_id: r.get("tenant_id"),
            broker: r.get("broker"),
            ciphertext: r.get("ciphertext"),
            validity: CredentialValidity::parse(r.get::<&str, _>("validity")),
            updated_at: r.get::<DateTime<Utc>, _>("updated_at"),
        }))
    }

    async fn set_validity(
        &self,
        tenant_id: Uuid,
        broker: &str,
        validity: CredentialValidity,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE broker_credentials SET validity = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND broker = $2
            "#,
        )
        .bind(tenant_id)
        .bind(broker)
        .bind(validity.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tenants_with_credentials(&self, broker: &str) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT tenant_id FROM broker_credentials WHERE broker = $1 ORDER BY tenant_id",
        )
        .bind(broker)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("tenant_id")).collect())
    }
}

#[async_trait]
impl PreferenceSource for PostgresStore {
    async fn preferences(&self, tenant_id: Uuid) -> Result<Vec<NotificationPreference>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, channel, destination, is_enabled
            FROM notification_preferences
            WHERE tenant_id = $1 AND is_enabled
            ORDER BY channel
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        // Unknown channel names are skipped rather than failing the dispatch
        Ok(rows
            .iter()
            .filter_map(|r| {
                let channel = ChannelKind::parse_preference(r.get::<&str, _>("channel"))?;
                Some(NotificationPreference {
                    tenant_id: r.get("tenant_id"),
                    channel,
                    destination: r.get("destination"),
                    is_enabled: r.get("is_enabled"),
                })
            })
            .collect())
    }
}
