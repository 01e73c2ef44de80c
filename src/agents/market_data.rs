//! Market data ingestion agent
//!
//! One upstream subscription per instrument, each with its own reconnect
//! loop. Ticks fan out to tenants that are active and hold a session token.
//!
//! Eligibility is a snapshot refreshed every `eligibility_refresh`; a tenant
//! deactivated between refreshes may receive ticks for at most one interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::AgentHealth;
use crate::config::TickerConfig;
use crate::coordination::Backoff;
use crate::entitlement::TenantDirectory;
use crate::error::Result;
use crate::runtime::RuntimeStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_token: u32,
    pub last_price: Decimal,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

pub type TickStream = BoxStream<'static, Result<Tick>>;

/// Upstream market data source
#[async_trait]
pub trait TickFeed: Send + Sync {
    /// Open a subscription for one instrument. The stream ends or yields an
    /// error when the connection is lost.
    async fn subscribe(&self, instrument_token: u32) -> Result<TickStream>;
}

/// Downstream tick publisher
#[async_trait]
pub trait TickSink: Send + Sync {
    async fn publish(&self, topic: &str, tick: &Tick) -> Result<()>;
}

pub fn ticker_topic(tenant_id: Uuid, instrument_token: u32) -> String {
    format!("ticker:{}:{}", tenant_id, instrument_token)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicTick {
    pub topic: String,
    pub tick: Tick,
}

/// In-process publisher over a broadcast channel
pub struct BroadcastTickSink {
    tx: broadcast::Sender<TopicTick>,
}

impl BroadcastTickSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicTick> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl TickSink for BroadcastTickSink {
    async fn publish(&self, topic: &str, tick: &Tick) -> Result<()> {
        // No subscribers is not an error; ticks are not queued
        let _ = self.tx.send(TopicTick {
            topic: topic.to_string(),
            tick: tick.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MarketDataSettings {
    pub instruments: Vec<u32>,
    pub reconnect: Backoff,
    pub eligibility_refresh: Duration,
}

impl MarketDataSettings {
    pub fn from_config(cfg: &TickerConfig) -> Result<Self> {
        Ok(Self {
            instruments: cfg.instrument_tokens()?,
            reconnect: Backoff::new(
                Duration::from_secs(cfg.reconnect_initial_delay_secs),
                Duration::from_secs(cfg.reconnect_max_delay_secs),
            ),
            eligibility_refresh: Duration::from_secs(cfg.eligibility_refresh_secs.max(1)),
        })
    }
}

pub struct MarketDataAgent {
    feed: Arc<dyn TickFeed>,
    sink: Arc<dyn TickSink>,
    directory: Arc<dyn TenantDirectory>,
    runtime: Arc<dyn RuntimeStore>,
    settings: MarketDataSettings,
    eligible: RwLock<BTreeSet<Uuid>>,
    health: Arc<AgentHealth>,
}

impl MarketDataAgent {
    pub fn new(
        feed: Arc<dyn TickFeed>,
        sink: Arc<dyn TickSink>,
        directory: Arc<dyn TenantDirectory>,
        runtime: Arc<dyn RuntimeStore>,
        settings: MarketDataSettings,
    ) -> Self {
        Self {
            feed,
            sink,
            directory,
            runtime,
            settings,
            eligible: RwLock::new(BTreeSet::new()),
            health: Arc::new(AgentHealth::new("ticker-agent")),
        }
    }

    pub fn health(&self) -> Arc<AgentHealth> {
        Arc::clone(&self.health)
    }

    pub async fn eligible_tenants(&self) -> Vec<Uuid> {
        self.eligible.read().await.iter().copied().collect()
    }

    /// Recompute the set of tenants allowed to receive ticks.
    ///
    /// A tenant is eligible only when both the activity flag and a session
    /// token can be read positively; store errors exclude it.
    pub async fn refresh_eligibility(&self) -> Result<usize> {
        let tenants = self.directory.list_tenants().await?;
        let mut next = BTreeSet::new();
        for tenant in tenants {
            let active = matches!(self.runtime.is_active(tenant.id).await, Ok(true));
            if !active {
                continue;
            }
            if matches!(self.runtime.get_session_token(tenant.id).await, Ok(Some(_))) {
                next.insert(tenant.id);
            }
        }

        let count = next.len();
        let mut eligible = self.eligible.write().await;
        for dropped in eligible.difference(&next) {
            info!(tenant_id = %dropped, "Tenant no longer eligible for market data");
        }
        *eligible = next;
        self.health.set("eligible_tenants", count as u64);
        Ok(count)
    }

    /// Publish one tick to every eligible tenant. Returns the number of deliveries.
    pub async fn fan_out(&self, tick: &Tick) -> usize {
        let tenants = self.eligible_tenants().await;
        let mut delivered = 0;
        for tenant_id in tenants {
            let topic = ticker_topic(tenant_id, tick.instrument_token);
            match self.sink.publish(&topic, tick).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "Tick publish failed"),
            }
        }
        self.health.incr("ticks_received");
        self.health.add("ticks_delivered", delivered as u64);
        delivered
    }

    /// Subscription loop for one instrument, reconnecting with jittered backoff
    async fn run_instrument(self: Arc<Self>, instrument: u32, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            match self.feed.subscribe(instrument).await {
                Ok(mut ticks) => {
                    info!(instrument, "Subscribed to market data");
                    loop {
                        tokio::select! {
                            next = ticks.next() => match next {
                                Some(Ok(tick)) => {
                                    failures = 0;
                                    self.fan_out(&tick).await;
                                }
                                Some(Err(e)) => {
                                    warn!(instrument, error = %e, "Market data stream error");
                                    break;
                                }
                                None => {
                                    warn!(instrument, "Market data stream closed");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => {
                    error!(instrument, error = %e, "Market data subscribe failed");
                }
            }

            self.health.incr("reconnects");
            let delay = self.settings.reconnect.delay_with_jitter(failures);
            failures = failures.saturating_add(1);
            debug!(instrument, ?delay, "Resubscribing after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_eligibility(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.eligibility_refresh);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.health.mark_run().await;
                    match self.refresh_eligibility().await {
                        Ok(_) => self.health.mark_success().await,
                        Err(e) => {
                            // Keep the previous snapshot; the next refresh retries
                            error!(error = %e, "Eligibility refresh failed");
                            self.health.mark_error(&e).await;
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Run all instrument subscriptions and the eligibility refresher until shutdown
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.refresh_eligibility().await {
            warn!(error = %e, "Initial eligibility refresh failed");
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&self).run_eligibility(shutdown.clone()));
        for instrument in self.settings.instruments.clone() {
            tasks.spawn(Arc::clone(&self).run_instrument(instrument, shutdown.clone()));
        }
        self.health.set_ready(true);
        info!(
            instruments = self.settings.instruments.len(),
            "Market data agent running"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Market data task panicked");
            }
        }
        self.health.set_ready(false);
        info!("Market data agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let tenant = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        assert_eq!(
            ticker_topic(tenant, 256265),
            "ticker:00000000-0000-0000-0000-000000000001:256265"
        );
    }

    #[test]
    fn test_tick_parses_without_optional_fields() {
        let tick: Tick =
            serde_json::from_str(r#"{"instrument_token": 256265, "last_price": "22150.35"}"#)
                .unwrap();
        assert_eq!(tick.instrument_token, 256265);
        assert_eq!(tick.volume, None);
    }
}
