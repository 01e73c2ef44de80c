use orra::adapters::{HttpBrokerGateway, WebhookChannelSender, WsTickFeed};
use orra::agents::{
    AgentHealth, AuthRefreshAgent, AuthRefreshSettings, BroadcastTickSink, DispatchSettings,
    IdentityBook, MarketDataAgent, MarketDataSettings, NotificationDispatcher,
};
use orra::api::{self, AppState};
use orra::cli::Backends;
use orra::config::AppConfig;
use orra::coordination::{shutdown::with_timeout, Shutdown};
use orra::domain::BrokerCredential;
use orra::entitlement::{BillingWebhookHandler, EntitlementPolicy, GuardEngine, Reconciler};
use orra::error::Result;
use orra::services::{HealthServer, HealthState};
use orra::vault::CredentialVault;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

const DEFAULT_HEALTH_PORT: u16 = 8081;
const DEFAULT_API_PORT: u16 = 8080;
const TICK_SINK_CAPACITY: usize = 4096;
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

fn spawn_health_server(
    cfg: &AppConfig,
    agents: Vec<Arc<AgentHealth>>,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    let server = HealthServer::new(
        Arc::new(HealthState::new(agents)),
        cfg.health_port.unwrap_or(DEFAULT_HEALTH_PORT),
    );
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        if let Err(e) = server.run(rx).await {
            error!("Health server error: {}", e);
        }
    })
}

fn vault(cfg: &AppConfig, backends: &Backends) -> Result<Arc<CredentialVault>> {
    Ok(Arc::new(CredentialVault::new(
        cfg.vault.master_key.as_deref(),
        backends.credentials.clone(),
    )?))
}

pub async fn run_auth_agent(cfg: AppConfig, backends: Backends, once: bool) -> Result<()> {
    let agent = Arc::new(AuthRefreshAgent::new(
        backends.runtime.clone(),
        vault(&cfg, &backends)?,
        backends.streams.clone(),
        Arc::new(HttpBrokerGateway::from_config(&cfg.auth)?),
        IdentityBook::from_config(&cfg.auth)?,
        AuthRefreshSettings::from_config(&cfg.auth, &cfg.streams),
    ));

    if once {
        let report = agent.run_cycle().await?;
        info!(?report, "Auth refresh cycle complete");
        return Ok(());
    }

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();
    let health = spawn_health_server(&cfg, vec![agent.health()], &shutdown);

    agent.run(shutdown.subscribe()).await;
    with_timeout(health, SHUTDOWN_TIMEOUT_SECS, "Health server").await;
    Ok(())
}

pub async fn run_ticker_agent(cfg: AppConfig, backends: Backends) -> Result<()> {
    let sink = Arc::new(BroadcastTickSink::new(TICK_SINK_CAPACITY));
    let mut ticks = sink.subscribe();
    tokio::spawn(async move {
        while let Ok(published) = ticks.recv().await {
            debug!(topic = %published.topic, price = %published.tick.last_price, "Tick published");
        }
    });

    let agent = Arc::new(MarketDataAgent::new(
        Arc::new(WsTickFeed::new(cfg.ticker.ws_url.clone())),
        sink,
        backends.directory.clone(),
        backends.runtime.clone(),
        MarketDataSettings::from_config(&cfg.ticker)?,
    ));

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();
    let health = spawn_health_server(&cfg, vec![agent.health()], &shutdown);

    agent.run(shutdown.subscribe()).await;
    with_timeout(health, SHUTDOWN_TIMEOUT_SECS, "Health server").await;
    Ok(())
}

pub async fn run_notification_agent(cfg: AppConfig, backends: Backends) -> Result<()> {
    let dispatcher = Arc::new(NotificationDispatcher::new(
        backends.streams.clone(),
        Arc::new(WebhookChannelSender::new(cfg.notification.channels.clone())?),
        backends.preferences.clone(),
        DispatchSettings::from_config(&cfg.notification, &cfg.streams),
    ));

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();
    let health = spawn_health_server(&cfg, vec![dispatcher.health()], &shutdown);

    dispatcher.run(shutdown.subscribe()).await;
    with_timeout(health, SHUTDOWN_TIMEOUT_SECS, "Health server").await;
    Ok(())
}

pub async fn run_api(cfg: AppConfig, backends: Backends) -> Result<()> {
    let guards = Arc::new(GuardEngine::new(
        backends.directory.clone(),
        backends.runtime.clone(),
        EntitlementPolicy::from(&cfg.billing),
    ));
    let billing = Arc::new(BillingWebhookHandler::new(
        cfg.billing.webhook_secret.as_deref(),
        cfg.billing.signature_tolerance_secs,
        backends.directory.clone(),
        backends.runtime.clone(),
    )?
    .with_status_events(backends.streams.clone(), cfg.streams.tenant_status.clone()));

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();

    let reconciler = Reconciler::new(backends.directory.clone(), backends.runtime.clone());
    let interval = Duration::from_secs(cfg.billing.reconcile_interval_secs.max(1));
    let rx = shutdown.subscribe();
    let sweeps = tokio::spawn(async move { reconciler.run(interval, rx).await });

    api::serve(
        AppState::new(guards, billing),
        cfg.api_port.unwrap_or(DEFAULT_API_PORT),
        shutdown.subscribe(),
    )
    .await?;

    with_timeout(sweeps, SHUTDOWN_TIMEOUT_SECS, "Reconciler").await;
    Ok(())
}

pub async fn run_reconcile(backends: Backends) -> Result<()> {
    let reconciler = Reconciler::new(backends.directory, backends.runtime);
    let report = reconciler.sweep().await?;
    println!(
        "checked={} repaired={} errors={}",
        report.checked, report.repaired, report.errors
    );
    Ok(())
}

pub async fn run_store_credential(
    cfg: AppConfig,
    backends: Backends,
    tenant_id: Uuid,
    broker: Option<String>,
    credential: BrokerCredential,
) -> Result<()> {
    let broker = broker.unwrap_or_else(|| cfg.auth.broker_id.clone());
    vault(&cfg, &backends)?
        .store(tenant_id, &broker, &credential)
        .await?;
    println!("Stored {} credential for tenant {}", broker, tenant_id);
    Ok(())
}
