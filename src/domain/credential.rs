use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Validity of a stored broker credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialValidity {
    Unknown,
    Valid,
    Expired,
    Invalid,
}

impl CredentialValidity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialValidity::Unknown => "unknown",
            CredentialValidity::Valid => "valid",
            CredentialValidity::Expired => "expired",
            CredentialValidity::Invalid => "invalid",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "valid" => CredentialValidity::Valid,
            "expired" => CredentialValidity::Expired,
            "invalid" => CredentialValidity::Invalid,
            _ => CredentialValidity::Unknown,
        }
    }

    /// Credentials marked invalid wait for the tenant to re-enter them
    pub fn allows_refresh(&self) -> bool {
        !matches!(self, CredentialValidity::Invalid)
    }
}

impl fmt::Display for CredentialValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decrypted broker credential set. Zeroized on drop and redacted in Debug.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct BrokerCredential {
    pub api_key: String,
    pub api_secret: String,
    pub totp_secret: String,
}

impl BrokerCredential {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        totp_secret: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            totp_secret: totp_secret.into(),
        }
    }
}

impl fmt::Debug for BrokerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredential")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .field("totp_secret", &"***")
            .finish()
    }
}

/// Ciphertext envelope as persisted by the credential repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub tenant_id: Uuid,
    pub broker: String,
    pub ciphertext: String,
    pub validity: CredentialValidity,
    pub updated_at: DateTime<Utc>,
}

/// Broker login identity for one tenant, sourced from configuration maps
pub struct BrokerIdentity {
    pub user_id: String,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for BrokerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerIdentity")
            .field("user_id", &self.user_id)
            .field("password", &"***")
            .finish()
    }
}

/// Broker-issued session token
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken(***)")
    }
}

/// Broker connection state published for the tenant's dashboards and agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "connected" => Some(ConnectionStatus::Connected),
            "inactive" => Some(ConnectionStatus::Inactive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_prints_secrets() {
        let cred = BrokerCredential::new("key-123", "secret-456", "totp-789");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("secret-456"));
        assert!(!debug.contains("totp-789"));

        let token = SessionToken::new("access-abc");
        assert_eq!(format!("{:?}", token), "SessionToken(***)");
    }

    #[test]
    fn test_validity_roundtrip_and_refresh_gate() {
        for v in [
            CredentialValidity::Unknown,
            CredentialValidity::Valid,
            CredentialValidity::Expired,
            CredentialValidity::Invalid,
        ] {
            assert_eq!(CredentialValidity::parse(v.as_str()), v);
        }
        assert!(CredentialValidity::Expired.allows_refresh());
        assert!(!CredentialValidity::Invalid.allows_refresh());
    }
}
