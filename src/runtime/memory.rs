use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{active_key, connection_status_key, session_token_key, RuntimeStore};
use crate::domain::{ConnectionStatus, SessionToken};
use crate::error::{OrraError, Result};

#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Slot<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

/// Single-process runtime store for tests and `--in-memory` runs.
///
/// DashMap's per-shard locking makes every single-key operation atomic,
/// including the conditional counter increment.
#[derive(Default)]
pub struct MemoryRuntimeStore {
    values: DashMap<String, Slot<String>>,
    counters: DashMap<String, Slot<u64>>,
    unavailable: AtomicBool,
}

impl MemoryRuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OrraError::StoreUnavailable(
                "in-memory store marked unavailable".into(),
            ));
        }
        Ok(())
    }

    fn get_value(&self, key: &str) -> Option<String> {
        let slot = self.values.get(key)?;
        if slot.is_expired() {
            drop(slot);
            self.values.remove_if(key, |_, s| s.is_expired());
            return None;
        }
        Some(slot.value.clone())
    }
}

#[async_trait]
impl RuntimeStore for MemoryRuntimeStore {
    async fn set_active(&self, tenant_id: Uuid, active: bool) -> Result<()> {
        self.check()?;
        let value = if active { "1" } else { "0" };
        self.values
            .insert(active_key(tenant_id), Slot::new(value.to_string(), None));
        Ok(())
    }

    async fn is_active(&self, tenant_id: Uuid) -> Result<bool> {
        self.check()?;
        Ok(self.get_value(&active_key(tenant_id)).as_deref() == Some("1"))
    }

    async fn set_session_token(
        &self,
        tenant_id: Uuid,
        token: &SessionToken,
        ttl: Duration,
    ) -> Result<()> {
        self.check()?;
        self.values.insert(
            session_token_key(tenant_id),
            Slot::new(token.expose().to_string(), Some(ttl)),
        );
        Ok(())
    }

    async fn get_session_token(&self, tenant_id: Uuid) -> Result<Option<SessionToken>> {
        self.check()?;
        Ok(self
            .get_value(&session_token_key(tenant_id))
            .map(SessionToken::new))
    }

    async fn clear_session_token(&self, tenant_id: Uuid) -> Result<()> {
        self.check()?;
        self.values.remove(&session_token_key(tenant_id));
        Ok(())
    }

    async fn set_connection_status(
        &self,
        tenant_id: Uuid,
        status: ConnectionStatus,
        ttl: Duration,
    ) -> Result<()> {
        self.check()?;
        self.values.insert(
            connection_status_key(tenant_id),
            Slot::new(status.as_str().to_string(), Some(ttl)),
        );
        Ok(())
    }

    async fn connection_status(&self, tenant_id: Uuid) -> Result<Option<ConnectionStatus>> {
        self.check()?;
        Ok(self
            .get_value(&connection_status_key(tenant_id))
            .and_then(|v| ConnectionStatus::parse(&v)))
    }

    async fn increment_within_limit(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        self.check()?;
        if limit == 0 {
            return Ok(None);
        }
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_expired() {
                    *slot = Slot::new(1, Some(ttl));
                    return Ok(Some(1));
                }
                if slot.value >= limit {
                    return Ok(None);
                }
                slot.value += 1;
                Ok(Some(slot.value))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(1, Some(ttl)));
                Ok(Some(1))
            }
        }
    }

    async fn counter(&self, key: &str) -> Result<u64> {
        self.check()?;
        Ok(self
            .counters
            .get(key)
            .filter(|slot| !slot.is_expired())
            .map(|slot| slot.value)
            .unwrap_or(0))
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.check()?;
        let before = self.values.len() + self.counters.len();
        self.values.retain(|_, slot| !slot.is_expired());
        self.counters.retain(|_, slot| !slot.is_expired());
        let after = self.values.len() + self.counters.len();
        Ok(before.saturating_sub(after) as u64)
    }
}
