//! Tenant runtime state store
//!
//! Low-latency key/value state shared by every agent process: the tenant
//! activity flag, cached broker session tokens and daily trade counters.
//! All operations are single-key and atomic. A missing activity flag means
//! the tenant is inactive.

mod memory;
mod postgres;

pub use memory::MemoryRuntimeStore;
pub use postgres::PgRuntimeStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{ConnectionStatus, SessionToken};
use crate::error::Result;

const DAY: Duration = Duration::from_secs(24 * 3600);

pub fn active_key(tenant_id: Uuid) -> String {
    format!("tenant:active:{}", tenant_id)
}

pub fn session_token_key(tenant_id: Uuid) -> String {
    format!("kite:access_token:{}", tenant_id)
}

pub fn connection_status_key(tenant_id: Uuid) -> String {
    format!("kite:connection_status:{}", tenant_id)
}

pub fn trade_count_key(tenant_id: Uuid, day: NaiveDate) -> String {
    format!("trades:count:{}:{}", tenant_id, day.format("%Y-%m-%d"))
}

/// Trade counter key for the UTC day containing `now`
pub fn trade_count_key_at(tenant_id: Uuid, now: DateTime<Utc>) -> String {
    trade_count_key(tenant_id, now.date_naive())
}

/// Time left in the UTC day containing `now`. A daily trade counter expires
/// with its day; never less than one second.
pub fn trade_counter_ttl_at(now: DateTime<Utc>) -> Duration {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| (midnight.and_utc() - now).to_std().ok())
        .unwrap_or(DAY)
        .max(Duration::from_secs(1))
}

#[async_trait]
pub trait RuntimeStore: Send + Sync {
    async fn set_active(&self, tenant_id: Uuid, active: bool) -> Result<()>;

    /// Missing flag reads as `false`
    async fn is_active(&self, tenant_id: Uuid) -> Result<bool>;

    async fn set_session_token(
        &self,
        tenant_id: Uuid,
        token: &SessionToken,
        ttl: Duration,
    ) -> Result<()>;

    async fn get_session_token(&self, tenant_id: Uuid) -> Result<Option<SessionToken>>;

    async fn clear_session_token(&self, tenant_id: Uuid) -> Result<()>;

    async fn set_connection_status(
        &self,
        tenant_id: Uuid,
        status: ConnectionStatus,
        ttl: Duration,
    ) -> Result<()>;

    /// `None` when never written or expired
    async fn connection_status(&self, tenant_id: Uuid) -> Result<Option<ConnectionStatus>>;

    /// Atomically increment `key` unless it already reached `limit`.
    ///
    /// Returns the new value, or `None` when the limit was hit (the counter is
    /// left untouched). `ttl` applies when the counter is created.
    async fn increment_within_limit(&self, key: &str, limit: u64, ttl: Duration)
        -> Result<Option<u64>>;

    /// Current counter value, 0 when absent or expired
    async fn counter(&self, key: &str) -> Result<u64>;

    /// Reclaim storage held by expired keys. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_layout() {
        let tenant = Uuid::parse_str("6f1c2a52-9d8e-4c0b-8d59-3b9f1b7e2a10").unwrap();
        assert_eq!(
            active_key(tenant),
            "tenant:active:6f1c2a52-9d8e-4c0b-8d59-3b9f1b7e2a10"
        );
        assert_eq!(
            session_token_key(tenant),
            "kite:access_token:6f1c2a52-9d8e-4c0b-8d59-3b9f1b7e2a10"
        );
        assert_eq!(
            connection_status_key(tenant),
            "kite:connection_status:6f1c2a52-9d8e-4c0b-8d59-3b9f1b7e2a10"
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 59).unwrap();
        assert_eq!(
            trade_count_key_at(tenant, now),
            "trades:count:6f1c2a52-9d8e-4c0b-8d59-3b9f1b7e2a10:2026-03-09"
        );
    }

    #[test]
    fn test_trade_key_rolls_over_at_utc_midnight() {
        let tenant = Uuid::new_v4();
        let before = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        assert_ne!(
            trade_count_key_at(tenant, before),
            trade_count_key_at(tenant, after)
        );
    }

    #[test]
    fn test_trade_counter_expires_with_its_day() {
        let late = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(trade_counter_ttl_at(late), Duration::from_secs(60));

        let midnight = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(trade_counter_ttl_at(midnight), DAY);

        let noon = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(trade_counter_ttl_at(noon), Duration::from_secs(12 * 3600));
    }
}
