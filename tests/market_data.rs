use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use orra::adapters::MemoryStore;
use orra::agents::market_data::ticker_topic;
use orra::agents::{
    BroadcastTickSink, MarketDataAgent, MarketDataSettings, Tick, TickFeed, TickStream,
};
use orra::coordination::{Backoff, Shutdown};
use orra::domain::{SessionToken, SubscriptionTier, Tenant};
use orra::error::{OrraError, Result};
use orra::runtime::{MemoryRuntimeStore, RuntimeStore};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn tick(instrument_token: u32, price: rust_decimal::Decimal) -> Tick {
    Tick {
        instrument_token,
        last_price: price,
        volume: Some(100),
        timestamp: Utc::now(),
    }
}

/// Serves scripted ticks per instrument; unknown instruments fail to subscribe
#[derive(Default)]
struct ScriptedFeed {
    ticks: HashMap<u32, Vec<Tick>>,
    subscribes: HashMap<u32, AtomicUsize>,
}

impl ScriptedFeed {
    fn with(mut self, instrument: u32, ticks: Vec<Tick>) -> Self {
        self.ticks.insert(instrument, ticks);
        self.subscribes.insert(instrument, AtomicUsize::new(0));
        self
    }

    fn failing(mut self, instrument: u32) -> Self {
        self.subscribes.insert(instrument, AtomicUsize::new(0));
        self
    }

    fn subscribe_count(&self, instrument: u32) -> usize {
        self.subscribes
            .get(&instrument)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[async_trait]
impl TickFeed for ScriptedFeed {
    async fn subscribe(&self, instrument_token: u32) -> Result<TickStream> {
        if let Some(counter) = self.subscribes.get(&instrument_token) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let Some(ticks) = self.ticks.get(&instrument_token) else {
            return Err(OrraError::TransientIo(format!(
                "instrument {} unavailable",
                instrument_token
            )));
        };
        // Stay connected after the script so the loop does not resubscribe
        Ok(futures::stream::iter(ticks.clone().into_iter().map(Ok))
            .chain(futures::stream::pending())
            .boxed())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    runtime: Arc<MemoryRuntimeStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            runtime: Arc::new(MemoryRuntimeStore::new()),
        }
    }

    async fn tenant(&self, active: bool, token: bool) -> Uuid {
        let mut tenant = Tenant::new(format!("org_{}", Uuid::new_v4()), SubscriptionTier::Basic);
        tenant.is_active = active;
        let id = tenant.id;
        self.store.insert_tenant(tenant);
        self.runtime.set_active(id, active).await.unwrap();
        if token {
            self.runtime
                .set_session_token(id, &SessionToken::new("tok"), Duration::from_secs(3600))
                .await
                .unwrap();
        }
        id
    }

    fn agent(
        &self,
        feed: Arc<ScriptedFeed>,
        sink: Arc<BroadcastTickSink>,
        instruments: Vec<u32>,
    ) -> Arc<MarketDataAgent> {
        Arc::new(MarketDataAgent::new(
            feed,
            sink,
            self.store.clone(),
            self.runtime.clone(),
            MarketDataSettings {
                instruments,
                reconnect: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
                eligibility_refresh: Duration::from_secs(60),
            },
        ))
    }
}

#[tokio::test]
async fn only_active_tenants_with_sessions_are_eligible() {
    let h = Harness::new();
    let eligible = h.tenant(true, true).await;
    h.tenant(true, false).await;
    h.tenant(false, true).await;
    let agent = h.agent(
        Arc::new(ScriptedFeed::default()),
        Arc::new(BroadcastTickSink::new(16)),
        vec![],
    );

    assert_eq!(agent.refresh_eligibility().await.unwrap(), 1);
    assert_eq!(agent.eligible_tenants().await, vec![eligible]);
}

#[tokio::test]
async fn deactivated_tenant_is_dropped_at_next_refresh() {
    let h = Harness::new();
    let tenant = h.tenant(true, true).await;
    let sink = Arc::new(BroadcastTickSink::new(16));
    let mut rx = sink.subscribe();
    let agent = h.agent(Arc::new(ScriptedFeed::default()), sink, vec![]);

    agent.refresh_eligibility().await.unwrap();
    assert_eq!(agent.fan_out(&tick(256265, dec!(22150.35))).await, 1);
    let published = rx.recv().await.unwrap();
    assert_eq!(published.topic, ticker_topic(tenant, 256265));
    assert_eq!(published.tick.last_price, dec!(22150.35));

    h.runtime.set_active(tenant, false).await.unwrap();
    agent.refresh_eligibility().await.unwrap();
    assert_eq!(agent.fan_out(&tick(256265, dec!(22151))).await, 0);
    assert_eq!(agent.health().counter("ticks_received"), 2);
}

#[tokio::test]
async fn unavailable_runtime_store_excludes_everyone() {
    let h = Harness::new();
    h.tenant(true, true).await;
    let agent = h.agent(
        Arc::new(ScriptedFeed::default()),
        Arc::new(BroadcastTickSink::new(16)),
        vec![],
    );

    h.runtime.set_unavailable(true);
    assert_eq!(agent.refresh_eligibility().await.unwrap(), 0);
}

#[tokio::test]
async fn failing_instrument_does_not_stop_others() {
    let h = Harness::new();
    let tenant = h.tenant(true, true).await;
    let feed = Arc::new(
        ScriptedFeed::default()
            .failing(1)
            .with(2, vec![tick(2, dec!(101.5)), tick(2, dec!(101.75))]),
    );
    let sink = Arc::new(BroadcastTickSink::new(16));
    let mut rx = sink.subscribe();
    let agent = h.agent(feed.clone(), sink, vec![1, 2]);

    let shutdown = Shutdown::new();
    let task = tokio::spawn(agent.clone().run(shutdown.subscribe()));

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        (first, second)
    })
    .await
    .expect("ticks were not fanned out");
    assert_eq!(received.0.topic, ticker_topic(tenant, 2));
    assert_eq!(received.1.tick.last_price, dec!(101.75));

    // The failing instrument keeps retrying on its own
    let retried = tokio::time::timeout(Duration::from_secs(5), async {
        while feed.subscribe_count(1) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(retried.is_ok());
    assert_eq!(feed.subscribe_count(2), 1);

    shutdown.request();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("agent did not stop")
        .unwrap();
    assert!(agent.health().counter("reconnects") >= 2);
    assert!(!agent.health().is_ready());
}
