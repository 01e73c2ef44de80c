use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Subscription tier. Anything the billing provider sends that is not `pro`
/// is treated as `basic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Basic,
    Pro,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Pro => "pro",
        }
    }

    /// Lenient parse used for database rows and billing payloads
    pub fn normalize(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("pro") {
            SubscriptionTier::Pro
        } else {
            SubscriptionTier::Basic
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenant as held by the system of record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    /// Organisation id used by the billing provider to refer to this tenant
    pub org_id: String,
    pub subscription_tier: SubscriptionTier,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(org_id: impl Into<String>, tier: SubscriptionTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.into(),
            subscription_tier: tier,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Tenant-owned strategy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub strategy_type: String,
    pub is_active: bool,
}

impl StrategyInstance {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, strategy_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            strategy_type: strategy_type.into(),
            is_active: true,
        }
    }
}

/// Result of the deactivation cascade in the system of record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeSummary {
    /// Whether the tenant flag actually flipped (false on replay)
    pub tenant_changed: bool,
    pub strategies_deactivated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_normalize() {
        assert_eq!(SubscriptionTier::normalize("PRO"), SubscriptionTier::Pro);
        assert_eq!(SubscriptionTier::normalize(" pro "), SubscriptionTier::Pro);
        assert_eq!(SubscriptionTier::normalize("basic"), SubscriptionTier::Basic);
        assert_eq!(SubscriptionTier::normalize("free"), SubscriptionTier::Basic);
        assert_eq!(SubscriptionTier::normalize(""), SubscriptionTier::Basic);
    }

    #[test]
    fn test_tier_serde_lowercase() {
        let json = serde_json::to_string(&SubscriptionTier::Pro).unwrap();
        assert_eq!(json, "\"pro\"");
    }
}
