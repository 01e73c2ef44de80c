//! Auth refresh agent
//!
//! Keeps one broker session token per active tenant. Refreshes for a tenant
//! never overlap: a second trigger while one is running is coalesced.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::AgentHealth;
use crate::config::{AuthAgentConfig, StreamNames};
use crate::coordination::{Backoff, KeyedLocks};
use crate::domain::{
    BrokerCredential, BrokerIdentity, ConnectionStatus, CredentialValidity, Event, SessionToken,
};
use crate::error::{OrraError, Result};
use crate::runtime::RuntimeStore;
use crate::streams::EventStreams;
use crate::vault::CredentialVault;

/// Why a broker login did not produce a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerLoginError {
    /// Second factor rejected
    TwoFactor(String),
    /// Credentials rejected outright
    Rejected(String),
    /// Network trouble or broker-side outage; worth retrying
    Transient(String),
}

impl fmt::Display for BrokerLoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerLoginError::TwoFactor(d) => write!(f, "2FA failed: {}", d),
            BrokerLoginError::Rejected(d) => write!(f, "login rejected: {}", d),
            BrokerLoginError::Transient(d) => write!(f, "transient login failure: {}", d),
        }
    }
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn login(
        &self,
        credential: &BrokerCredential,
        identity: &BrokerIdentity,
    ) -> std::result::Result<SessionToken, BrokerLoginError>;
}

/// Per-tenant refresh state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    Refreshed,
    Failed2fa,
    FailedOther,
}

impl RefreshState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Refreshing => "refreshing",
            RefreshState::Refreshed => "refreshed",
            RefreshState::Failed2fa => "failed_2fa",
            RefreshState::FailedOther => "failed_other",
        }
    }

    pub fn can_transition_to(&self, next: RefreshState) -> bool {
        use RefreshState::*;
        matches!(
            (self, next),
            (Idle, Refreshing)
                | (Refreshing, Refreshed)
                | (Refreshing, Failed2fa)
                | (Refreshing, FailedOther)
                | (Refreshed, Idle)
                | (Failed2fa, Idle)
                | (FailedOther, Idle)
        )
    }
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TenantInactive,
    CredentialInvalid,
    NoCredential,
    StateUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another refresh for the tenant was already running
    Coalesced,
    Skipped(SkipReason),
    /// The tenant was deactivated mid-refresh; no token was written
    Cancelled,
    Failed2fa,
    /// Transient failures exhausted the attempt budget
    FailedTransient { attempts: u32 },
    /// Decryption failure, missing identity or similar tenant-level problem
    FailedCredential,
}

impl RefreshOutcome {
    fn terminal_state(&self) -> Option<RefreshState> {
        match self {
            RefreshOutcome::Refreshed => Some(RefreshState::Refreshed),
            RefreshOutcome::Failed2fa => Some(RefreshState::Failed2fa),
            RefreshOutcome::Cancelled
            | RefreshOutcome::FailedTransient { .. }
            | RefreshOutcome::FailedCredential => Some(RefreshState::FailedOther),
            RefreshOutcome::Coalesced | RefreshOutcome::Skipped(_) => None,
        }
    }
}

/// Broker login identities keyed by tenant id
#[derive(Default)]
pub struct IdentityBook {
    user_ids: HashMap<String, String>,
    passwords: HashMap<String, Zeroizing<String>>,
}

impl IdentityBook {
    pub fn new(user_ids: HashMap<String, String>, passwords: HashMap<String, String>) -> Self {
        Self {
            user_ids,
            passwords: passwords
                .into_iter()
                .map(|(k, v)| (k, Zeroizing::new(v)))
                .collect(),
        }
    }

    pub fn from_config(cfg: &AuthAgentConfig) -> Result<Self> {
        Ok(Self::new(cfg.user_id_map()?, cfg.password_map()?))
    }

    pub fn insert(&mut self, tenant_id: Uuid, user_id: &str, password: &str) {
        let key = tenant_id.to_string();
        self.user_ids.insert(key.clone(), user_id.to_string());
        self.passwords.insert(key, Zeroizing::new(password.to_string()));
    }

    pub fn lookup(&self, tenant_id: Uuid) -> Option<BrokerIdentity> {
        let key = tenant_id.to_string();
        let user_id = self.user_ids.get(&key)?;
        let password = self.passwords.get(&key)?;
        Some(BrokerIdentity {
            user_id: user_id.clone(),
            password: password.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuthRefreshSettings {
    pub broker: String,
    pub token_ttl: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub concurrency: usize,
    pub refresh_interval: Duration,
    pub auth_errors_stream: String,
    /// Where successful refreshes are announced
    pub status_stream: String,
}

impl AuthRefreshSettings {
    pub fn from_config(cfg: &AuthAgentConfig, streams: &StreamNames) -> Self {
        Self {
            broker: cfg.broker_id.clone(),
            token_ttl: cfg.token_ttl(),
            max_attempts: cfg.max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(cfg.base_backoff_ms),
                Duration::from_secs(cfg.max_backoff_secs),
            ),
            concurrency: cfg.concurrency.max(1),
            refresh_interval: Duration::from_secs(cfg.refresh_interval_secs),
            auth_errors_stream: streams.auth_errors.clone(),
            status_stream: streams.tenant_status.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub tenants_seen: usize,
    pub refreshed: usize,
    pub coalesced: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct AuthRefreshAgent {
    runtime: Arc<dyn RuntimeStore>,
    vault: Arc<CredentialVault>,
    streams: Arc<dyn EventStreams>,
    gateway: Arc<dyn BrokerGateway>,
    identities: IdentityBook,
    settings: AuthRefreshSettings,
    locks: KeyedLocks<Uuid>,
    states: DashMap<Uuid, RefreshState>,
    health: Arc<AgentHealth>,
}

impl AuthRefreshAgent {
    pub fn new(
        runtime: Arc<dyn RuntimeStore>,
        vault: Arc<CredentialVault>,
        streams: Arc<dyn EventStreams>,
        gateway: Arc<dyn BrokerGateway>,
        identities: IdentityBook,
        settings: AuthRefreshSettings,
    ) -> Self {
        Self {
            runtime,
            vault,
            streams,
            gateway,
            identities,
            settings,
            locks: KeyedLocks::new(),
            states: DashMap::new(),
            health: Arc::new(AgentHealth::new("auth-agent")),
        }
    }

    pub fn health(&self) -> Arc<AgentHealth> {
        Arc::clone(&self.health)
    }

    pub fn state(&self, tenant_id: Uuid) -> RefreshState {
        self.states
            .get(&tenant_id)
            .map(|s| *s)
            .unwrap_or(RefreshState::Idle)
    }

    fn transition(&self, tenant_id: Uuid, next: RefreshState) {
        let current = self.state(tenant_id);
        if !current.can_transition_to(next) {
            warn!(tenant_id = %tenant_id, from = %current, to = %next, "Unexpected refresh transition");
        }
        self.states.insert(tenant_id, next);
    }

    /// Refresh one tenant's session token
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn refresh_tenant(&self, tenant_id: Uuid) -> RefreshOutcome {
        let Some(_guard) = self.locks.try_acquire(&tenant_id) else {
            debug!("Refresh already in flight, coalescing");
            self.health.incr("refresh_coalesced");
            return RefreshOutcome::Coalesced;
        };

        if let Some(reason) = self.entry_check(tenant_id).await {
            debug!(?reason, "Refresh skipped");
            return RefreshOutcome::Skipped(reason);
        }

        self.transition(tenant_id, RefreshState::Refreshing);
        let outcome = self.perform(tenant_id).await;
        if let Some(terminal) = outcome.terminal_state() {
            self.transition(tenant_id, terminal);
        }
        self.transition(tenant_id, RefreshState::Idle);
        outcome
    }

    async fn entry_check(&self, tenant_id: Uuid) -> Option<SkipReason> {
        match self.runtime.is_active(tenant_id).await {
            Ok(true) => {}
            Ok(false) => return Some(SkipReason::TenantInactive),
            Err(e) => {
                warn!(error = %e, "Runtime store unavailable");
                return Some(SkipReason::StateUnavailable);
            }
        }
        match self.vault.validity(tenant_id, &self.settings.broker).await {
            Ok(v) if !v.allows_refresh() => Some(SkipReason::CredentialInvalid),
            Ok(_) => None,
            Err(OrraError::CredentialNotFound { .. }) => Some(SkipReason::NoCredential),
            Err(e) => {
                warn!(error = %e, "Credential lookup failed");
                Some(SkipReason::StateUnavailable)
            }
        }
    }

    /// Cooperative cancellation point. Store errors count as inactive.
    async fn still_active(&self, tenant_id: Uuid) -> bool {
        matches!(self.runtime.is_active(tenant_id).await, Ok(true))
    }

    async fn perform(&self, tenant_id: Uuid) -> RefreshOutcome {
        let broker = self.settings.broker.as_str();

        let credential = match self.vault.decrypt(tenant_id, broker).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Credential decryption failed");
                if matches!(e, OrraError::DecryptionFailure { .. }) {
                    self.mark(tenant_id, CredentialValidity::Invalid).await;
                }
                self.emit(Event::auth_refresh_failed(tenant_id, 0, &e.to_string()))
                    .await;
                return RefreshOutcome::FailedCredential;
            }
        };

        let Some(identity) = self.identities.lookup(tenant_id) else {
            error!("No broker identity configured for tenant");
            self.emit(Event::auth_refresh_failed(
                tenant_id,
                0,
                "broker login identity is not configured",
            ))
            .await;
            return RefreshOutcome::FailedCredential;
        };

        let mut last_error = String::new();
        for attempt in 0..self.settings.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.backoff.delay(attempt - 1)).await;
                if !self.still_active(tenant_id).await {
                    info!(attempt, "Tenant deactivated during refresh, abandoning");
                    return RefreshOutcome::Cancelled;
                }
            }

            match self.gateway.login(&credential, &identity).await {
                Ok(token) => {
                    if !self.still_active(tenant_id).await {
                        info!("Tenant deactivated during login, discarding token");
                        return RefreshOutcome::Cancelled;
                    }
                    if let Err(e) = self
                        .runtime
                        .set_session_token(tenant_id, &token, self.settings.token_ttl)
                        .await
                    {
                        warn!(attempt, error = %e, "Session token write failed");
                        last_error = e.to_string();
                        continue;
                    }
                    self.mark(tenant_id, CredentialValidity::Valid).await;
                    self.announce_refresh(tenant_id).await;
                    info!(attempt, "Session token refreshed");
                    return RefreshOutcome::Refreshed;
                }
                Err(e @ (BrokerLoginError::TwoFactor(_) | BrokerLoginError::Rejected(_))) => {
                    error!(error = %e, "Broker login rejected");
                    self.emit(Event::auth_2fa_failed(tenant_id, &e.to_string()))
                        .await;
                    self.mark(tenant_id, CredentialValidity::Invalid).await;
                    if let Err(e) = self.runtime.clear_session_token(tenant_id).await {
                        warn!(error = %e, "Failed to clear session token");
                    }
                    return RefreshOutcome::Failed2fa;
                }
                Err(BrokerLoginError::Transient(detail)) => {
                    warn!(attempt, error = %detail, "Transient login failure");
                    last_error = detail;
                }
            }
        }

        let attempts = self.settings.max_attempts;
        error!(attempts, error = %last_error, "Refresh attempts exhausted");
        self.emit(Event::auth_refresh_failed(tenant_id, attempts, &last_error))
            .await;
        RefreshOutcome::FailedTransient { attempts }
    }

    async fn mark(&self, tenant_id: Uuid, validity: CredentialValidity) {
        if let Err(e) = self
            .vault
            .mark_validity(tenant_id, &self.settings.broker, validity)
            .await
        {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to update credential validity");
        }
    }

    /// Connection status and a `token_refreshed` event, both best effort
    async fn announce_refresh(&self, tenant_id: Uuid) {
        if let Err(e) = self
            .runtime
            .set_connection_status(tenant_id, ConnectionStatus::Connected, self.settings.token_ttl)
            .await
        {
            warn!(error = %e, "Failed to record connection status");
        }
        if let Err(e) = self
            .streams
            .append(&self.settings.status_stream, &Event::token_refreshed(tenant_id))
            .await
        {
            warn!(error = %e, "Failed to publish token refresh");
        }
    }

    async fn emit(&self, event: Event) {
        match self
            .streams
            .append(&self.settings.auth_errors_stream, &event)
            .await
        {
            Ok(id) => debug!(entry_id = id, event_type = %event.event_type, "Auth event appended"),
            Err(e) => error!(
                tenant_id = %event.tenant_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to append auth event"
            ),
        }
    }

    /// Refresh every tenant holding a credential through a bounded worker pool
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        let tenants = self
            .vault
            .tenants_with_credentials(&self.settings.broker)
            .await?;
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();

        for tenant_id in tenants.iter().copied() {
            let agent = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                agent.refresh_tenant(tenant_id).await
            });
        }

        let mut report = CycleReport {
            tenants_seen: tenants.len(),
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
                Ok(RefreshOutcome::Coalesced) => report.coalesced += 1,
                Ok(RefreshOutcome::Skipped(_)) => report.skipped += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "Refresh task panicked");
                    report.failed += 1;
                }
            }
        }

        self.health.set("tenants_seen", report.tenants_seen as u64);
        self.health.set("tenants_refreshed", report.refreshed as u64);
        self.health.add("refresh_failures", report.failed as u64);
        Ok(report)
    }

    /// Run refresh cycles until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.health.set_ready(true);
        let retry = Backoff::new(Duration::from_secs(1), self.settings.backoff.max);
        let mut failures: u32 = 0;

        loop {
            self.health.mark_run().await;
            let wait = match self.run_cycle().await {
                Ok(report) => {
                    info!(?report, "Auth refresh cycle complete");
                    self.health.mark_success().await;
                    failures = 0;
                    self.settings.refresh_interval
                }
                Err(e) => {
                    error!(error = %e, "Auth refresh cycle failed");
                    self.health.mark_error(&e).await;
                    failures = failures.saturating_add(1);
                    retry
                        .delay(failures - 1)
                        .min(self.settings.refresh_interval)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!("Auth agent stopping");
                    self.health.set_ready(false);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use RefreshState::*;
        assert!(Idle.can_transition_to(Refreshing));
        assert!(Refreshing.can_transition_to(Failed2fa));
        assert!(Refreshed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Refreshed));
        assert!(!Refreshing.can_transition_to(Refreshing));
    }

    #[test]
    fn test_identity_book_requires_both_entries() {
        let tenant = Uuid::new_v4();
        let mut users = HashMap::new();
        users.insert(tenant.to_string(), "AB1234".to_string());
        let book = IdentityBook::new(users, HashMap::new());
        assert!(book.lookup(tenant).is_none());

        let mut book = IdentityBook::default();
        book.insert(tenant, "AB1234", "hunter2");
        let identity = book.lookup(tenant).unwrap();
        assert_eq!(identity.user_id, "AB1234");
        assert_eq!(identity.password.as_str(), "hunter2");
    }
}
