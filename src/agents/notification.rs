//! Notification dispatch engine
//!
//! Sole consumer of the execution and auth-error streams. Each event is routed
//! to the tenant's preferred channels (urgent escalation for 2FA failures),
//! delivered per channel with bounded retries, and acknowledged once every
//! channel attempt has completed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::AgentHealth;
use crate::config::{NotificationConfig, StreamNames};
use crate::coordination::Backoff;
use crate::domain::{ChannelKind, Event, EventType, NotificationPreference, Severity};
use crate::error::Result;
use crate::streams::{EventStreams, StreamEntry};

/// Body posted to a channel webhook
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    pub tenant_id: Uuid,
    pub channel: ChannelKind,
    pub destination: Option<String>,
    pub message: String,
    pub meta: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Delivers a payload to one channel
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, channel: ChannelKind, payload: &NotificationPayload) -> Result<()>;
}

/// Tenant notification preferences
#[async_trait]
pub trait PreferenceSource: Send + Sync {
    async fn preferences(&self, tenant_id: Uuid) -> Result<Vec<NotificationPreference>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel: ChannelKind,
    pub destination: Option<String>,
}

/// Channels for an event given the tenant's enabled preferences.
///
/// Standard events fall back to email when no preference is enabled.
/// `auth_2fa_failed` always adds the urgent channel, alone when there are
/// no preferences.
pub fn route(event: &Event, preferences: &[NotificationPreference]) -> Vec<Route> {
    let mut routes: Vec<Route> = Vec::new();
    for pref in preferences.iter().filter(|p| p.is_enabled) {
        if pref.channel == ChannelKind::Urgent || routes.iter().any(|r| r.channel == pref.channel)
        {
            continue;
        }
        routes.push(Route {
            channel: pref.channel,
            destination: Some(pref.destination.clone()).filter(|d| !d.is_empty()),
        });
    }

    match event.event_type {
        EventType::Auth2faFailed => routes.push(Route {
            channel: ChannelKind::Urgent,
            destination: None,
        }),
        EventType::ExecutionResult | EventType::AuthRefreshFailed if routes.is_empty() => {
            routes.push(Route {
                channel: ChannelKind::Email,
                destination: None,
            })
        }
        _ => {}
    }
    routes
}

pub fn render_message(event: &Event) -> String {
    match event.event_type {
        EventType::ExecutionResult => {
            let status = event.payload_str("status").unwrap_or("unknown");
            if crate::domain::is_success_status(status) {
                "Trade executed successfully".to_string()
            } else {
                format!(
                    "Trade execution failed: {}",
                    event.payload_str("error").unwrap_or("unknown reason")
                )
            }
        }
        EventType::Auth2faFailed => {
            "Urgent: broker 2FA login failed. Please re-check your credentials immediately."
                .to_string()
        }
        EventType::AuthRefreshFailed => format!(
            "Broker session refresh failed: {}. Trading is paused until the next successful login.",
            event.payload_str("error").unwrap_or("unknown reason")
        ),
        EventType::NotificationUndelivered => "Notification could not be delivered".to_string(),
        EventType::TenantStatusChanged => format!(
            "Subscription status changed: {}",
            event.payload_str("status").unwrap_or("unknown")
        ),
        EventType::TokenRefreshed => "Broker session refreshed".to_string(),
    }
}

/// Bounded memory of recently processed event ids
pub struct DedupeWindow {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl DedupeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false when `id` is already in the window
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Delivered { channels: usize },
    PartiallyDelivered { delivered: usize, failed: usize },
    Undelivered { channels: usize },
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub group: String,
    pub consumer: String,
    pub streams: Vec<String>,
    pub failure_stream: String,
    pub batch_size: usize,
    pub block: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub dedupe_window: usize,
}

impl DispatchSettings {
    pub fn from_config(cfg: &NotificationConfig, streams: &StreamNames) -> Self {
        Self {
            group: cfg.consumer_group.clone(),
            consumer: cfg.consumer_name.clone(),
            streams: vec![streams.execution_results.clone(), streams.auth_errors.clone()],
            failure_stream: streams.notification_failures.clone(),
            batch_size: cfg.batch_size.max(1),
            block: Duration::from_millis(cfg.block_ms),
            max_attempts: cfg.max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(cfg.base_backoff_ms),
                Duration::from_secs(cfg.max_backoff_secs),
            ),
            dedupe_window: cfg.dedupe_window,
        }
    }
}

pub struct NotificationDispatcher {
    streams: Arc<dyn EventStreams>,
    sender: Arc<dyn ChannelSender>,
    preferences: Arc<dyn PreferenceSource>,
    settings: DispatchSettings,
    dedupe: Mutex<DedupeWindow>,
    /// Set when an entry of a batch could not be acknowledged
    drain_needed: AtomicBool,
    health: Arc<AgentHealth>,
}

impl NotificationDispatcher {
    pub fn new(
        streams: Arc<dyn EventStreams>,
        sender: Arc<dyn ChannelSender>,
        preferences: Arc<dyn PreferenceSource>,
        settings: DispatchSettings,
    ) -> Self {
        let dedupe = Mutex::new(DedupeWindow::new(settings.dedupe_window));
        Self {
            streams,
            sender,
            preferences,
            settings,
            dedupe,
            drain_needed: AtomicBool::new(false),
            health: Arc::new(AgentHealth::new("notification-agent")),
        }
    }

    pub fn health(&self) -> Arc<AgentHealth> {
        Arc::clone(&self.health)
    }

    pub async fn ensure_groups(&self) -> Result<()> {
        for stream in &self.settings.streams {
            self.streams
                .ensure_group(stream, &self.settings.group)
                .await?;
        }
        Ok(())
    }

    /// Re-process entries delivered to this consumer but never acknowledged
    pub async fn drain_pending(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let entries = self
                .streams
                .read_pending(
                    &self.settings.group,
                    &self.settings.consumer,
                    &self.settings.streams,
                    self.settings.batch_size,
                )
                .await?;
            if entries.is_empty() {
                break;
            }
            total += entries.len();
            for entry in entries {
                self.process_entry(&entry).await?;
            }
        }
        if total > 0 {
            info!(count = total, "Re-processed pending notifications");
        }
        Ok(total)
    }

    /// Read one batch of new entries and process it. Returns the batch size.
    ///
    /// An entry that fails to process stays pending and does not hold up the
    /// rest of the batch; pending entries are drained before the next read.
    pub async fn poll_once(&self) -> Result<usize> {
        if self.drain_needed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.drain_pending().await {
                self.drain_needed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        let entries = self
            .streams
            .read_group(
                &self.settings.group,
                &self.settings.consumer,
                &self.settings.streams,
                self.settings.batch_size,
                self.settings.block,
            )
            .await?;

        let mut left_pending = 0;
        for entry in &entries {
            if let Err(e) = self.process_entry(entry).await {
                warn!(stream = %entry.stream, entry_id = entry.id, error = %e, "Entry left pending");
                self.health.incr("entries_left_pending");
                left_pending += 1;
            }
        }
        if left_pending > 0 {
            self.drain_needed.store(true, Ordering::SeqCst);
        }
        Ok(entries.len())
    }

    /// Dispatch one stream entry and acknowledge it
    #[instrument(skip(self, entry), fields(stream = %entry.stream, entry_id = entry.id, event_id = %entry.event.id))]
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<EntryOutcome> {
        let fresh = self.dedupe.lock().await.insert(entry.event.id);
        let outcome = if fresh {
            self.dispatch(&entry.event).await
        } else {
            debug!("Duplicate event, skipping dispatch");
            self.health.incr("events_duplicate");
            EntryOutcome::Duplicate
        };

        self.streams
            .ack(&entry.stream, &self.settings.group, entry.id)
            .await?;
        self.health.incr("events_processed");
        Ok(outcome)
    }

    async fn dispatch(&self, event: &Event) -> EntryOutcome {
        let preferences = match self.preferences.preferences(event.tenant_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(tenant_id = %event.tenant_id, error = %e, "Preference lookup failed, using defaults");
                Vec::new()
            }
        };
        let routes = route(event, &preferences);
        let message = render_message(event);

        let attempts = routes.iter().map(|r| {
            let payload = NotificationPayload {
                event_id: event.id,
                event_type: event.event_type,
                severity: event.severity,
                tenant_id: event.tenant_id,
                channel: r.channel,
                destination: r.destination.clone(),
                message: message.clone(),
                meta: event.payload.clone(),
                timestamp: Utc::now(),
            };
            async move {
                let result = self.deliver(&payload).await;
                (payload, result)
            }
        });

        let results = join_all(attempts).await;
        let mut delivered = 0;
        let mut failed = 0;
        for (payload, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    failed += 1;
                    self.record_undelivered(event, &payload, &err).await;
                }
            }
        }

        self.health.add("notifications_sent", delivered as u64);
        self.health.add("notifications_failed", failed as u64);
        match (delivered, failed) {
            (d, 0) => EntryOutcome::Delivered { channels: d },
            (0, f) => EntryOutcome::Undelivered { channels: f },
            (d, f) => EntryOutcome::PartiallyDelivered {
                delivered: d,
                failed: f,
            },
        }
    }

    /// Send to one channel with bounded retries. Returns the last error text.
    async fn deliver(&self, payload: &NotificationPayload) -> std::result::Result<(), String> {
        let mut last_error = String::new();
        for attempt in 0..self.settings.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.backoff.delay(attempt - 1)).await;
            }
            match self.sender.send(payload.channel, payload).await {
                Ok(()) => {
                    debug!(channel = %payload.channel, attempt, "Notification delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(channel = %payload.channel, attempt, error = %e, "Notification attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(last_error)
    }

    async fn record_undelivered(&self, event: &Event, payload: &NotificationPayload, err: &str) {
        error!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            channel = %payload.channel,
            error = %err,
            "Notification undelivered after retries"
        );
        let record = Event::new(
            EventType::NotificationUndelivered,
            event.tenant_id,
            event.severity,
            serde_json::json!({
                "original_event_id": event.id,
                "original_event_type": event.event_type,
                "channel": payload.channel,
                "attempts": self.settings.max_attempts,
                "error": err,
            }),
        );
        if let Err(e) = self
            .streams
            .append(&self.settings.failure_stream, &record)
            .await
        {
            error!(event_id = %event.id, error = %e, "Failed to record undelivered notification");
        }
    }

    async fn start(&self) -> Result<usize> {
        self.ensure_groups().await?;
        self.drain_pending().await
    }

    /// Consume until shutdown: pending entries first, then new ones
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retry = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
        let mut failures: u32 = 0;

        loop {
            match self.start().await {
                Ok(_) => break,
                Err(e) => {
                    error!(error = %e, "Notification agent startup failed");
                    self.health.mark_error(&e).await;
                    let delay = retry.delay(failures);
                    failures = failures.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }

        self.health.set_ready(true);
        failures = 0;
        info!(group = %self.settings.group, consumer = %self.settings.consumer, "Notification agent running");

        loop {
            self.health.mark_run().await;
            tokio::select! {
                result = self.poll_once() => match result {
                    Ok(_) => {
                        failures = 0;
                        self.health.mark_success().await;
                    }
                    Err(e) => {
                        error!(error = %e, "Notification stream loop failed");
                        self.health.mark_error(&e).await;
                        let delay = retry.delay(failures);
                        failures = failures.saturating_add(1);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        self.health.set_ready(false);
        info!("Notification agent stopped");
    }
}
