//! Billing webhook: signature verification and the activation/deactivation cascade.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::TenantDirectory;
use crate::domain::{ConnectionStatus, Event, SubscriptionTier};
use crate::error::{OrraError, Result};
use crate::runtime::RuntimeStore;
use crate::streams::EventStreams;

type HmacSha256 = Hmac<Sha256>;

pub const INVOICE_PAID: &str = "invoice.paid";
pub const SUBSCRIPTION_DELETED: &str = "subscription.deleted";

/// How long a deactivated tenant's connection shows as inactive
const INACTIVE_STATUS_TTL: Duration = Duration::from_secs(24 * 3600);

/// Build a `t=<unix>,v1=<hex>` signature header for `body`
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| OrraError::Configuration(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify a `t=<unix>,v1=<hex>` header against `body`.
///
/// Any `v1` entry may match. Comparison is constant time. A `tolerance_secs`
/// of 0 disables the timestamp window.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    tolerance_secs: u64,
    now_unix: i64,
) -> Result<()> {
    let mut timestamp: Option<&str> = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => candidates.push(v),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| OrraError::SignatureInvalid("missing timestamp".into()))?;
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| OrraError::SignatureInvalid("malformed timestamp".into()))?;
    if candidates.is_empty() {
        return Err(OrraError::SignatureInvalid("missing v1 signature".into()));
    }
    if tolerance_secs > 0 && now_unix.abs_diff(ts) > tolerance_secs {
        return Err(OrraError::SignatureInvalid(
            "timestamp outside tolerance".into(),
        ));
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| OrraError::Configuration(format!("invalid webhook secret: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(OrraError::SignatureInvalid("no matching signature".into()))
}

#[derive(Debug, Deserialize)]
struct BillingEnvelope {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    data: BillingData,
}

#[derive(Debug, Default, Deserialize)]
struct BillingData {
    #[serde(default)]
    object: serde_json::Value,
}

impl BillingEnvelope {
    fn lookup(&self, keys: &[&str]) -> Option<String> {
        let object = &self.data.object;
        let metadata = object.get("metadata");
        let from = |v: Option<&serde_json::Value>| {
            keys.iter().find_map(|k| {
                v.and_then(|m| m.get(*k))
                    .and_then(|s| s.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
        };
        from(metadata).or_else(|| from(Some(object)))
    }

    fn org_id(&self) -> Option<String> {
        self.lookup(&["clerk_org_id", "org_id"])
    }

    fn tier(&self) -> Option<SubscriptionTier> {
        let metadata = self.data.object.get("metadata")?;
        ["subscription_tier", "tier"]
            .iter()
            .find_map(|k| metadata.get(*k).and_then(|v| v.as_str()))
            .map(SubscriptionTier::normalize)
    }
}

/// Acknowledgment returned to the billing provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub event_type: String,
    pub tenant_id: Option<Uuid>,
    /// A tenant matched and the event was applied in the system of record
    pub updated: bool,
    /// The runtime store reflects the new state
    pub runtime_synced: bool,
}

impl WebhookAck {
    fn ignored(event_type: String) -> Self {
        Self {
            received: true,
            event_type,
            tenant_id: None,
            updated: false,
            runtime_synced: false,
        }
    }
}

pub struct BillingWebhookHandler {
    secret: String,
    tolerance_secs: u64,
    directory: Arc<dyn TenantDirectory>,
    runtime: Arc<dyn RuntimeStore>,
    status_events: Option<(Arc<dyn EventStreams>, String)>,
}

impl BillingWebhookHandler {
    /// A missing or empty secret is a configuration error
    pub fn new(
        secret: Option<&str>,
        tolerance_secs: u64,
        directory: Arc<dyn TenantDirectory>,
        runtime: Arc<dyn RuntimeStore>,
    ) -> Result<Self> {
        let secret = secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OrraError::Configuration("billing webhook secret is not configured".into()))?;
        Ok(Self {
            secret: secret.to_string(),
            tolerance_secs,
            directory,
            runtime,
            status_events: None,
        })
    }

    /// Announce every activation change on `stream`
    pub fn with_status_events(
        mut self,
        streams: Arc<dyn EventStreams>,
        stream: impl Into<String>,
    ) -> Self {
        self.status_events = Some((streams, stream.into()));
        self
    }

    /// Verify, parse and apply one webhook delivery. Nothing is mutated
    /// unless the signature verifies.
    #[instrument(skip_all)]
    pub async fn handle(&self, raw_body: &[u8], signature: Option<&str>) -> Result<WebhookAck> {
        let header = signature
            .ok_or_else(|| OrraError::SignatureInvalid("missing signature header".into()))?;
        verify_signature(
            &self.secret,
            header,
            raw_body,
            self.tolerance_secs,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(error = %e, "Rejected billing webhook");
            e
        })?;

        let envelope: BillingEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| OrraError::Validation(format!("invalid webhook payload: {}", e)))?;
        let event_type = envelope.event_type.clone();

        if event_type != INVOICE_PAID && event_type != SUBSCRIPTION_DELETED {
            info!(event_type = %event_type, "Ignoring billing event");
            return Ok(WebhookAck::ignored(event_type));
        }

        let org_id = envelope
            .org_id()
            .ok_or_else(|| OrraError::Validation("webhook payload missing org identifier".into()))?;

        let Some(tenant) = self.directory.tenant_by_org(&org_id).await? else {
            warn!(org_id = %org_id, event_type = %event_type, "Billing event for unknown org");
            return Ok(WebhookAck::ignored(event_type));
        };

        let active = event_type == INVOICE_PAID;
        let runtime_synced = if active {
            self.activate(tenant.id, envelope.tier()).await?
        } else {
            self.deactivate(tenant.id).await?
        };
        self.publish_status(tenant.id, active).await;

        Ok(WebhookAck {
            received: true,
            event_type,
            tenant_id: Some(tenant.id),
            updated: true,
            runtime_synced,
        })
    }

    async fn activate(&self, tenant_id: Uuid, tier: Option<SubscriptionTier>) -> Result<bool> {
        let changed = self
            .directory
            .apply_billing_activation(tenant_id, tier)
            .await?;
        info!(tenant_id = %tenant_id, tier = ?tier, changed, "Tenant activated by billing");

        match self.runtime.set_active(tenant_id, true).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "Runtime activation failed, reconciler will retry");
                Ok(false)
            }
        }
    }

    /// System of record first (one transaction), then best-effort runtime propagation.
    async fn deactivate(&self, tenant_id: Uuid) -> Result<bool> {
        let summary = self.directory.deactivate_cascade(tenant_id).await?;
        info!(
            tenant_id = %tenant_id,
            tenant_changed = summary.tenant_changed,
            strategies_deactivated = summary.strategies_deactivated,
            "Tenant deactivated by billing"
        );

        let flag = self.runtime.set_active(tenant_id, false).await;
        let token = self.runtime.clear_session_token(tenant_id).await;
        if let Err(e) = self
            .runtime
            .set_connection_status(tenant_id, ConnectionStatus::Inactive, INACTIVE_STATUS_TTL)
            .await
        {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to record connection status");
        }
        match (flag, token) {
            (Ok(()), Ok(())) => Ok(true),
            (flag, token) => {
                let e = flag.err().or(token.err());
                error!(
                    tenant_id = %tenant_id,
                    error = ?e.map(|e| e.to_string()),
                    "Runtime deactivation failed, reconciler will retry"
                );
                Ok(false)
            }
        }
    }

    /// Best effort; the runtime flag stays the source of truth
    async fn publish_status(&self, tenant_id: Uuid, active: bool) {
        let Some((streams, stream)) = &self.status_events else {
            return;
        };
        match streams
            .append(stream, &Event::tenant_status_changed(tenant_id, active))
            .await
        {
            Ok(id) => debug!(tenant_id = %tenant_id, active, entry_id = id, "Tenant status published"),
            Err(e) => warn!(tenant_id = %tenant_id, error = %e, "Failed to publish tenant status"),
        }
    }
}
