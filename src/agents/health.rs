use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Liveness and progress of one agent
pub struct AgentHealth {
    name: String,
    healthy: AtomicBool,
    ready: AtomicBool,
    last_error: RwLock<Option<String>>,
    last_success_at: RwLock<Option<DateTime<Utc>>>,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
    counters: DashMap<&'static str, AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentHealthSnapshot {
    pub name: String,
    pub healthy: bool,
    pub ready: bool,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub metrics: BTreeMap<String, u64>,
}

impl AgentHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            last_error: RwLock::new(None),
            last_success_at: RwLock::new(None),
            last_run_at: RwLock::new(None),
            counters: DashMap::new(),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub async fn mark_run(&self) {
        *self.last_run_at.write().await = Some(Utc::now());
    }

    pub async fn mark_success(&self) {
        self.healthy.store(true, Ordering::SeqCst);
        *self.last_success_at.write().await = Some(Utc::now());
        *self.last_error.write().await = None;
    }

    /// Record an agent-level failure. Tenant-level failures go through `incr` instead.
    pub async fn mark_error(&self, error: impl ToString) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.last_error.write().await = Some(error.to_string());
    }

    pub fn incr(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &'static str, n: u64) {
        self.counters
            .entry(counter)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, counter: &'static str, value: u64) {
        self.counters
            .entry(counter)
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters
            .get(counter)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> AgentHealthSnapshot {
        AgentHealthSnapshot {
            name: self.name.clone(),
            healthy: self.is_healthy(),
            ready: self.is_ready(),
            last_error: self.last_error.read().await.clone(),
            last_success_at: *self.last_success_at.read().await,
            last_run_at: *self.last_run_at.read().await,
            metrics: self
                .counters
                .iter()
                .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_then_success() {
        let health = AgentHealth::new("auth-agent");
        assert!(health.is_healthy());
        assert!(!health.is_ready());

        health.mark_error("stream read failed").await;
        let snap = health.snapshot().await;
        assert!(!snap.healthy);
        assert_eq!(snap.last_error.as_deref(), Some("stream read failed"));

        health.mark_success().await;
        let snap = health.snapshot().await;
        assert!(snap.healthy);
        assert!(snap.last_error.is_none());
        assert!(snap.last_success_at.is_some());
    }

    #[test]
    fn test_counters() {
        let health = AgentHealth::new("notification-agent");
        health.incr("events_processed");
        health.add("events_processed", 2);
        health.set("eligible_tenants", 7);
        assert_eq!(health.counter("events_processed"), 3);
        assert_eq!(health.counter("eligible_tenants"), 7);
        assert_eq!(health.counter("missing"), 0);
    }
}
