use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use orra::adapters::MemoryStore;
use orra::agents::{
    AuthRefreshAgent, AuthRefreshSettings, BrokerGateway, BrokerLoginError, IdentityBook,
    RefreshOutcome, RefreshState, SkipReason,
};
use orra::coordination::Backoff;
use orra::domain::{
    token_refreshed_topic, BrokerCredential, BrokerIdentity, ConnectionStatus, CredentialValidity,
    EventType, SessionToken, Severity, AUTH_ERRORS_STREAM, TENANT_STATUS_STREAM,
};
use orra::runtime::{MemoryRuntimeStore, RuntimeStore};
use orra::streams::MemoryEventStreams;
use orra::vault::CredentialVault;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

const BROKER: &str = "kite";

type LoginResult = Result<SessionToken, BrokerLoginError>;

/// Replays scripted login results, optionally pausing inside `login`
#[derive(Default)]
struct ScriptedGateway {
    script: Mutex<VecDeque<LoginResult>>,
    calls: AtomicUsize,
    entered: Notify,
    release: Option<Notify>,
    deactivate_on_login: Option<(Arc<MemoryRuntimeStore>, Uuid)>,
}

impl ScriptedGateway {
    fn new(script: Vec<LoginResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    fn gated(mut self) -> Self {
        self.release = Some(Notify::new());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerGateway for ScriptedGateway {
    async fn login(
        &self,
        _credential: &BrokerCredential,
        _identity: &BrokerIdentity,
    ) -> Result<SessionToken, BrokerLoginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(release) = &self.release {
            release.notified().await;
        }
        if let Some((runtime, tenant)) = &self.deactivate_on_login {
            runtime.set_active(*tenant, false).await.unwrap();
        }
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(BrokerLoginError::Transient("script exhausted".into())))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    runtime: Arc<MemoryRuntimeStore>,
    streams: Arc<MemoryEventStreams>,
    vault: Arc<CredentialVault>,
    identities: IdentityBook,
}

fn master_key(fill: u8) -> String {
    STANDARD.encode([fill; 32])
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let vault = Arc::new(CredentialVault::new(Some(&master_key(7)), store.clone()).unwrap());
    Harness {
        store,
        runtime: Arc::new(MemoryRuntimeStore::new()),
        streams: Arc::new(MemoryEventStreams::new()),
        vault,
        identities: IdentityBook::default(),
    }
}

fn settings(max_attempts: u32) -> AuthRefreshSettings {
    AuthRefreshSettings {
        broker: BROKER.to_string(),
        token_ttl: Duration::from_secs(3600),
        max_attempts,
        backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        concurrency: 4,
        refresh_interval: Duration::from_secs(60),
        auth_errors_stream: AUTH_ERRORS_STREAM.to_string(),
        status_stream: TENANT_STATUS_STREAM.to_string(),
    }
}

impl Harness {
    /// Active tenant with a stored credential and a login identity
    async fn enrolled_tenant(&mut self) -> Uuid {
        let tenant = Uuid::new_v4();
        self.runtime.set_active(tenant, true).await.unwrap();
        self.vault
            .store(
                tenant,
                BROKER,
                &BrokerCredential::new("api-key", "api-secret", "JBSWY3DPEHPK3PXP"),
            )
            .await
            .unwrap();
        self.identities.insert(tenant, "AB1234", "hunter2");
        tenant
    }

    fn agent(self, gateway: Arc<ScriptedGateway>, max_attempts: u32) -> Built {
        let agent = Arc::new(AuthRefreshAgent::new(
            self.runtime.clone(),
            self.vault.clone(),
            self.streams.clone(),
            gateway,
            self.identities,
            settings(max_attempts),
        ));
        Built {
            agent,
            store: self.store,
            runtime: self.runtime,
            streams: self.streams,
            vault: self.vault,
        }
    }
}

struct Built {
    agent: Arc<AuthRefreshAgent>,
    #[allow(dead_code)]
    store: Arc<MemoryStore>,
    runtime: Arc<MemoryRuntimeStore>,
    streams: Arc<MemoryEventStreams>,
    vault: Arc<CredentialVault>,
}

#[tokio::test]
async fn successful_refresh_caches_token_and_marks_valid() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let gateway = Arc::new(ScriptedGateway::new(vec![Ok(SessionToken::new("tok-1"))]));
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Refreshed);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(
        b.runtime
            .get_session_token(tenant)
            .await
            .unwrap()
            .unwrap()
            .expose(),
        "tok-1"
    );
    assert_eq!(
        b.vault.validity(tenant, BROKER).await.unwrap(),
        CredentialValidity::Valid
    );
    assert_eq!(b.agent.state(tenant), RefreshState::Idle);
    assert!(b.streams.events(AUTH_ERRORS_STREAM).await.is_empty());
}

#[tokio::test]
async fn successful_refresh_announces_connection() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let gateway = Arc::new(ScriptedGateway::new(vec![Ok(SessionToken::new("tok-1"))]));
    let b = h.agent(gateway, 3);

    assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Refreshed);
    assert_eq!(
        b.runtime.connection_status(tenant).await.unwrap(),
        Some(ConnectionStatus::Connected)
    );

    let events = b.streams.events(TENANT_STATUS_STREAM).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::TokenRefreshed);
    assert_eq!(events[0].tenant_id, tenant);
    assert_eq!(
        events[0].payload_str("topic"),
        Some(token_refreshed_topic(tenant).as_str())
    );
}

#[tokio::test]
async fn failed_refresh_announces_nothing() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let gateway = Arc::new(ScriptedGateway::new(vec![Err(BrokerLoginError::TwoFactor(
        "bad otp".into(),
    ))]));
    let b = h.agent(gateway, 3);

    assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Failed2fa);
    assert!(b.runtime.connection_status(tenant).await.unwrap().is_none());
    assert!(b.streams.events(TENANT_STATUS_STREAM).await.is_empty());
}

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_login() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let gateway = Arc::new(ScriptedGateway::new(vec![Ok(SessionToken::new("tok"))]).gated());
    let b = h.agent(gateway.clone(), 3);

    let first = {
        let agent = b.agent.clone();
        tokio::spawn(async move { agent.refresh_tenant(tenant).await })
    };
    gateway.entered.notified().await;
    assert_eq!(b.agent.state(tenant), RefreshState::Refreshing);

    for _ in 0..3 {
        assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Coalesced);
    }

    gateway.release.as_ref().unwrap().notify_one();
    assert_eq!(first.await.unwrap(), RefreshOutcome::Refreshed);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(b.agent.health().counter("refresh_coalesced"), 3);
}

#[tokio::test]
async fn two_factor_failure_is_urgent_and_invalidates_credential() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    h.runtime
        .set_session_token(tenant, &SessionToken::new("stale"), Duration::from_secs(60))
        .await
        .unwrap();
    let gateway = Arc::new(ScriptedGateway::new(vec![Err(BrokerLoginError::TwoFactor(
        "bad otp".into(),
    ))]));
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Failed2fa);
    assert_eq!(gateway.calls(), 1);

    let events = b.streams.events(AUTH_ERRORS_STREAM).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Auth2faFailed);
    assert_eq!(events[0].severity, Severity::Urgent);
    assert_eq!(events[0].tenant_id, tenant);

    assert_eq!(
        b.vault.validity(tenant, BROKER).await.unwrap(),
        CredentialValidity::Invalid
    );
    assert!(b.runtime.get_session_token(tenant).await.unwrap().is_none());

    // Invalid credentials wait for the tenant to re-enter them
    assert_eq!(
        b.agent.refresh_tenant(tenant).await,
        RefreshOutcome::Skipped(SkipReason::CredentialInvalid)
    );
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test]
async fn transient_failures_retry_then_report() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let gateway = Arc::new(ScriptedGateway::new(vec![
        Err(BrokerLoginError::Transient("timeout".into())),
        Err(BrokerLoginError::Transient("timeout".into())),
        Err(BrokerLoginError::Transient("502".into())),
    ]));
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(
        b.agent.refresh_tenant(tenant).await,
        RefreshOutcome::FailedTransient { attempts: 3 }
    );
    assert_eq!(gateway.calls(), 3);

    let events = b.streams.events(AUTH_ERRORS_STREAM).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::AuthRefreshFailed);
    assert_eq!(events[0].payload["attempts"], 3);
    assert_eq!(events[0].payload_str("error"), Some("502"));

    // Transient trouble says nothing about the credential itself
    assert!(b
        .vault
        .validity(tenant, BROKER)
        .await
        .unwrap()
        .allows_refresh());
}

#[tokio::test]
async fn transient_failure_then_success() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let gateway = Arc::new(ScriptedGateway::new(vec![
        Err(BrokerLoginError::Transient("reset".into())),
        Ok(SessionToken::new("tok-2")),
    ]));
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Refreshed);
    assert_eq!(gateway.calls(), 2);
    assert!(b.streams.events(AUTH_ERRORS_STREAM).await.is_empty());
}

#[tokio::test]
async fn deactivation_mid_refresh_discards_token() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    let mut gateway = ScriptedGateway::new(vec![Ok(SessionToken::new("late"))]);
    gateway.deactivate_on_login = Some((h.runtime.clone(), tenant));
    let gateway = Arc::new(gateway);
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(b.agent.refresh_tenant(tenant).await, RefreshOutcome::Cancelled);
    assert!(b.runtime.get_session_token(tenant).await.unwrap().is_none());
}

#[tokio::test]
async fn inactive_or_unenrolled_tenants_are_skipped() {
    let mut h = harness();
    let inactive = h.enrolled_tenant().await;
    h.runtime.set_active(inactive, false).await.unwrap();
    let unenrolled = Uuid::new_v4();
    h.runtime.set_active(unenrolled, true).await.unwrap();
    let gateway = Arc::new(ScriptedGateway::new(vec![]));
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(
        b.agent.refresh_tenant(inactive).await,
        RefreshOutcome::Skipped(SkipReason::TenantInactive)
    );
    assert_eq!(
        b.agent.refresh_tenant(unenrolled).await,
        RefreshOutcome::Skipped(SkipReason::NoCredential)
    );
    assert_eq!(gateway.calls(), 0);
}

#[tokio::test]
async fn undecryptable_credential_fails_without_login() {
    let mut h = harness();
    let tenant = h.enrolled_tenant().await;
    // Same repository, different master key
    h.vault = Arc::new(CredentialVault::new(Some(&master_key(9)), h.store.clone()).unwrap());
    let gateway = Arc::new(ScriptedGateway::new(vec![Ok(SessionToken::new("never"))]));
    let b = h.agent(gateway.clone(), 3);

    assert_eq!(
        b.agent.refresh_tenant(tenant).await,
        RefreshOutcome::FailedCredential
    );
    assert_eq!(gateway.calls(), 0);
    assert_eq!(
        b.vault.validity(tenant, BROKER).await.unwrap(),
        CredentialValidity::Invalid
    );
    let events = b.streams.events(AUTH_ERRORS_STREAM).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::AuthRefreshFailed);
}

#[tokio::test]
async fn cycle_isolates_tenant_failures() {
    let mut h = harness();
    let ok = h.enrolled_tenant().await;
    let inactive = h.enrolled_tenant().await;
    h.runtime.set_active(inactive, false).await.unwrap();
    let gateway = Arc::new(ScriptedGateway::new(vec![Ok(SessionToken::new("tok"))]));
    let b = h.agent(gateway.clone(), 1);

    let report = b.agent.run_cycle().await.unwrap();
    assert_eq!(report.tenants_seen, 2);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert!(b.runtime.get_session_token(ok).await.unwrap().is_some());
    assert_eq!(b.agent.health().counter("tenants_refreshed"), 1);
}
