use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::{active_key, connection_status_key, session_token_key, RuntimeStore};
use crate::domain::{ConnectionStatus, SessionToken};
use crate::error::{OrraError, Result};

/// Runtime store shared across processes through Postgres.
///
/// Each call is one statement on one key. The conditional counter increment
/// runs as a single upsert so concurrent callers serialize on the row lock.
#[derive(Clone)]
pub struct PgRuntimeStore {
    pool: PgPool,
}

fn unavailable(e: sqlx::Error) -> OrraError {
    OrraError::StoreUnavailable(e.to_string())
}

fn expiry(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| OrraError::Validation(format!("ttl out of range: {}", e)))?;
    Ok(Utc::now() + ttl)
}

impl PgRuntimeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn put(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_kv (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM runtime_kv
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|r| r.get("value")))
    }
}

#[async_trait]
impl RuntimeStore for PgRuntimeStore {
    #[instrument(skip(self))]
    async fn set_active(&self, tenant_id: Uuid, active: bool) -> Result<()> {
        self.put(&active_key(tenant_id), if active { "1" } else { "0" }, None)
            .await
    }

    async fn is_active(&self, tenant_id: Uuid) -> Result<bool> {
        Ok(self.fetch(&active_key(tenant_id)).await?.as_deref() == Some("1"))
    }

    #[instrument(skip(self, token))]
    async fn set_session_token(
        &self,
        tenant_id: Uuid,
        token: &SessionToken,
        ttl: Duration,
    ) -> Result<()> {
        self.put(&session_token_key(tenant_id), token.expose(), Some(expiry(ttl)?))
            .await
    }

    async fn get_session_token(&self, tenant_id: Uuid) -> Result<Option<SessionToken>> {
        Ok(self
            .fetch(&session_token_key(tenant_id))
            .await?
            .map(SessionToken::new))
    }

    #[instrument(skip(self))]
    async fn clear_session_token(&self, tenant_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM runtime_kv WHERE key = $1")
            .bind(session_token_key(tenant_id))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_connection_status(
        &self,
        tenant_id: Uuid,
        status: ConnectionStatus,
        ttl: Duration,
    ) -> Result<()> {
        self.put(
            &connection_status_key(tenant_id),
            status.as_str(),
            Some(expiry(ttl)?),
        )
        .await
    }

    async fn connection_status(&self, tenant_id: Uuid) -> Result<Option<ConnectionStatus>> {
        Ok(self
            .fetch(&connection_status_key(tenant_id))
            .await?
            .and_then(|v| ConnectionStatus::parse(&v)))
    }

    async fn increment_within_limit(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        if limit == 0 {
            return Ok(None);
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // An expired row restarts at 1. A live row at the limit fails the
        // WHERE clause and the upsert returns no row.
        let row = sqlx::query(
            r#"
            INSERT INTO runtime_counters (key, value, expires_at)
            VALUES ($1, 1, $3)
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN runtime_counters.expires_at <= NOW() THEN 1
                    ELSE runtime_counters.value + 1
                END,
                expires_at = CASE
                    WHEN runtime_counters.expires_at <= NOW() THEN EXCLUDED.expires_at
                    ELSE runtime_counters.expires_at
                END
            WHERE runtime_counters.value < $2 OR runtime_counters.expires_at <= NOW()
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(limit)
        .bind(expiry(ttl)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|r| r.get::<i64, _>("value").max(0) as u64))
    }

    async fn counter(&self, key: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT value FROM runtime_counters
            WHERE key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row
            .map(|r| r.get::<i64, _>("value").max(0) as u64)
            .unwrap_or(0))
    }

    /// Reads already ignore expired rows; this only reclaims space.
    async fn purge_expired(&self) -> Result<u64> {
        let kv = sqlx::query("DELETE FROM runtime_kv WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        let counters = sqlx::query("DELETE FROM runtime_counters WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(kv.rows_affected() + counters.rows_affected())
    }
}
