//! Stream events exchanged between agents and the notification dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Trade outcome events
pub const EXECUTION_RESULTS_STREAM: &str = "execution_results";
/// Urgent authentication failures
pub const AUTH_ERRORS_STREAM: &str = "auth_errors";
/// Events the dispatcher gave up on
pub const NOTIFICATION_FAILURES_STREAM: &str = "notification_failures";
/// Tenant activation changes and session refreshes, for agents that react
/// without polling the runtime store
pub const TENANT_STATUS_STREAM: &str = "tenant_status";

pub fn tenant_status_topic(tenant_id: Uuid) -> String {
    format!("billing:tenant_status:{}", tenant_id)
}

pub fn token_refreshed_topic(tenant_id: Uuid) -> String {
    format!("auth:token_refreshed:{}", tenant_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "execution_result")]
    ExecutionResult,
    #[serde(rename = "auth_2fa_failed")]
    Auth2faFailed,
    #[serde(rename = "auth_refresh_failed")]
    AuthRefreshFailed,
    #[serde(rename = "notification_undelivered")]
    NotificationUndelivered,
    #[serde(rename = "tenant_status_changed")]
    TenantStatusChanged,
    #[serde(rename = "auth_token_refreshed")]
    TokenRefreshed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionResult => "execution_result",
            EventType::Auth2faFailed => "auth_2fa_failed",
            EventType::AuthRefreshFailed => "auth_refresh_failed",
            EventType::NotificationUndelivered => "notification_undelivered",
            EventType::TenantStatusChanged => "tenant_status_changed",
            EventType::TokenRefreshed => "auth_token_refreshed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Urgent,
}

/// Immutable stream record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub tenant_id: Uuid,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        tenant_id: Uuid,
        severity: Severity,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            tenant_id,
            severity,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Trade outcome. `status` values `success`, `filled` and `completed` count as success.
    pub fn execution_result(tenant_id: Uuid, status: &str, detail: Option<&str>) -> Self {
        let status = status.to_lowercase();
        let severity = if is_success_status(&status) {
            Severity::Info
        } else {
            Severity::Warning
        };
        Self::new(
            EventType::ExecutionResult,
            tenant_id,
            severity,
            serde_json::json!({
                "status": status,
                "error": detail,
            }),
        )
    }

    pub fn auth_2fa_failed(tenant_id: Uuid, detail: &str) -> Self {
        Self::new(
            EventType::Auth2faFailed,
            tenant_id,
            Severity::Urgent,
            serde_json::json!({ "error": detail }),
        )
    }

    pub fn auth_refresh_failed(tenant_id: Uuid, attempts: u32, detail: &str) -> Self {
        Self::new(
            EventType::AuthRefreshFailed,
            tenant_id,
            Severity::Warning,
            serde_json::json!({ "error": detail, "attempts": attempts }),
        )
    }

    /// Billing turned the tenant on or off
    pub fn tenant_status_changed(tenant_id: Uuid, active: bool) -> Self {
        Self::new(
            EventType::TenantStatusChanged,
            tenant_id,
            Severity::Info,
            serde_json::json!({
                "topic": tenant_status_topic(tenant_id),
                "status": if active { "active" } else { "inactive" },
            }),
        )
    }

    /// A fresh session token was stored for the tenant
    pub fn token_refreshed(tenant_id: Uuid) -> Self {
        Self::new(
            EventType::TokenRefreshed,
            tenant_id,
            Severity::Info,
            serde_json::json!({
                "topic": token_refreshed_topic(tenant_id),
                "refreshed_at": Utc::now().to_rfc3339(),
            }),
        )
    }

    /// For `tenant_status_changed`: whether the tenant is now active
    pub fn status_active(&self) -> Option<bool> {
        match self.payload_str("status")? {
            "active" => Some(true),
            "inactive" => Some(false),
            _ => None,
        }
    }

    /// Read a string field from the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

pub fn is_success_status(status: &str) -> bool {
    matches!(status, "success" | "filled" | "completed")
}

/// External notification channel. Each kind maps to one webhook URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[serde(alias = "telegram")]
    Chat,
    #[serde(alias = "whatsapp")]
    Messaging,
    Email,
    Urgent,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Chat => "chat",
            ChannelKind::Messaging => "messaging",
            ChannelKind::Email => "email",
            ChannelKind::Urgent => "urgent",
        }
    }

    /// Parse a stored preference value. `urgent` is never a tenant preference.
    pub fn parse_preference(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "chat" | "telegram" => Some(ChannelKind::Chat),
            "messaging" | "whatsapp" => Some(ChannelKind::Messaging),
            "email" => Some(ChannelKind::Email),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One enabled channel a tenant wants notifications on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub tenant_id: Uuid,
    pub channel: ChannelKind,
    /// Channel-specific address (chat id, phone number, mailbox)
    pub destination: String,
    pub is_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::Auth2faFailed).unwrap();
        assert_eq!(json, "\"auth_2fa_failed\"");
        let parsed: EventType = serde_json::from_str("\"execution_result\"").unwrap();
        assert_eq!(parsed, EventType::ExecutionResult);
    }

    #[test]
    fn test_status_events_carry_topics() {
        let tenant = Uuid::parse_str("00000000-0000-0000-0000-000000000007").unwrap();
        let off = Event::tenant_status_changed(tenant, false);
        assert_eq!(
            off.payload_str("topic"),
            Some("billing:tenant_status:00000000-0000-0000-0000-000000000007")
        );
        assert_eq!(off.status_active(), Some(false));
        assert_eq!(Event::tenant_status_changed(tenant, true).status_active(), Some(true));

        let refreshed = Event::token_refreshed(tenant);
        assert_eq!(refreshed.event_type.as_str(), "auth_token_refreshed");
        assert_eq!(
            refreshed.payload_str("topic"),
            Some("auth:token_refreshed:00000000-0000-0000-0000-000000000007")
        );
        assert!(refreshed.payload_str("refreshed_at").is_some());
        assert_eq!(refreshed.status_active(), None);
    }

    #[test]
    fn test_execution_result_severity() {
        let tenant = Uuid::new_v4();
        let ok = Event::execution_result(tenant, "FILLED", None);
        assert_eq!(ok.severity, Severity::Info);
        assert_eq!(ok.payload_str("status"), Some("filled"));

        let failed = Event::execution_result(tenant, "rejected", Some("margin"));
        assert_eq!(failed.severity, Severity::Warning);
        assert_eq!(failed.payload_str("error"), Some("margin"));
    }

    #[test]
    fn test_channel_preference_aliases() {
        assert_eq!(ChannelKind::parse_preference("Telegram"), Some(ChannelKind::Chat));
        assert_eq!(ChannelKind::parse_preference("whatsapp"), Some(ChannelKind::Messaging));
        assert_eq!(ChannelKind::parse_preference("email"), Some(ChannelKind::Email));
        assert_eq!(ChannelKind::parse_preference("urgent"), None);
        let parsed: ChannelKind = serde_json::from_str("\"telegram\"").unwrap();
        assert_eq!(parsed, ChannelKind::Chat);
    }

    #[test]
    fn test_auth_failure_is_urgent() {
        let event = Event::auth_2fa_failed(Uuid::new_v4(), "totp rejected");
        assert_eq!(event.severity, Severity::Urgent);
        assert_eq!(event.event_type, EventType::Auth2faFailed);
    }
}
