//! Credential vault
//!
//! Broker credentials are only ever persisted as AES-256-GCM envelopes bound
//! to their `(tenant, broker)` pair. Plaintext lives in zeroizing memory for
//! the duration of the caller's scope.

mod cipher;

pub use cipher::MasterKey;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::domain::{BrokerCredential, CredentialValidity, StoredCredential};
use crate::error::{OrraError, Result};

/// Persistence for credential envelopes
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Insert or replace the envelope, resetting validity to `unknown`
    async fn upsert_credential(&self, tenant_id: Uuid, broker: &str, ciphertext: &str)
        -> Result<()>;

    async fn fetch_credential(&self, tenant_id: Uuid, broker: &str)
        -> Result<Option<StoredCredential>>;

    /// Returns false when no credential exists for the pair
    async fn set_validity(
        &self,
        tenant_id: Uuid,
        broker: &str,
        validity: CredentialValidity,
    ) -> Result<bool>;

    /// Tenants holding a credential for `broker`
    async fn tenants_with_credentials(&self, broker: &str) -> Result<Vec<Uuid>>;
}

fn associated_data(tenant_id: Uuid, broker: &str) -> String {
    format!("{}:{}", tenant_id, broker)
}

pub struct CredentialVault {
    key: MasterKey,
    repo: Arc<dyn CredentialRepository>,
}

impl CredentialVault {
    /// Fails with a configuration error when the master key is absent or malformed
    pub fn new(master_key: Option<&str>, repo: Arc<dyn CredentialRepository>) -> Result<Self> {
        let encoded = master_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| OrraError::Configuration("vault master key is not configured".into()))?;
        Ok(Self {
            key: MasterKey::from_base64(encoded)?,
            repo,
        })
    }

    pub async fn store(
        &self,
        tenant_id: Uuid,
        broker: &str,
        credential: &BrokerCredential,
    ) -> Result<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(credential)?);
        let envelope = self
            .key
            .seal(&associated_data(tenant_id, broker), &plaintext)?;
        self.repo
            .upsert_credential(tenant_id, broker, &envelope)
            .await?;
        info!(tenant_id = %tenant_id, broker, "Stored broker credential");
        Ok(())
    }

    /// Decrypt the credential for one tenant and broker.
    ///
    /// Any envelope that fails authentication, including one copied from
    /// another tenant, is reported as `DecryptionFailure`.
    pub async fn decrypt(&self, tenant_id: Uuid, broker: &str) -> Result<BrokerCredential> {
        let stored = self
            .repo
            .fetch_credential(tenant_id, broker)
            .await?
            .ok_or_else(|| OrraError::CredentialNotFound {
                tenant_id,
                broker: broker.to_string(),
            })?;

        let failure = || OrraError::DecryptionFailure {
            tenant_id,
            broker: broker.to_string(),
        };

        let plaintext = self
            .key
            .open(&associated_data(tenant_id, broker), &stored.ciphertext)
            .ok_or_else(|| {
                warn!(tenant_id = %tenant_id, broker, "Credential envelope failed authentication");
                failure()
            })?;

        let credential: BrokerCredential =
            serde_json::from_slice(&plaintext).map_err(|_| failure())?;
        debug!(tenant_id = %tenant_id, broker, "Decrypted broker credential");
        Ok(credential)
    }

    pub async fn validity(&self, tenant_id: Uuid, broker: &str) -> Result<CredentialValidity> {
        self.repo
            .fetch_credential(tenant_id, broker)
            .await?
            .map(|c| c.validity)
            .ok_or_else(|| OrraError::CredentialNotFound {
                tenant_id,
                broker: broker.to_string(),
            })
    }

    pub async fn mark_validity(
        &self,
        tenant_id: Uuid,
        broker: &str,
        validity: CredentialValidity,
    ) -> Result<()> {
        if !self.repo.set_validity(tenant_id, broker, validity).await? {
            return Err(OrraError::CredentialNotFound {
                tenant_id,
                broker: broker.to_string(),
            });
        }
        debug!(tenant_id = %tenant_id, broker, validity = %validity, "Credential validity updated");
        Ok(())
    }

    pub async fn tenants_with_credentials(&self, broker: &str) -> Result<Vec<Uuid>> {
        self.repo.tenants_with_credentials(broker).await
    }
}
