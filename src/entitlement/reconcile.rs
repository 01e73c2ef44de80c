use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TenantDirectory;
use crate::error::Result;
use crate::runtime::RuntimeStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub repaired: usize,
    pub errors: usize,
}

/// Rewrites runtime activity flags that drifted from the system of record.
///
/// Heals cascades whose runtime propagation failed after the database
/// transaction committed.
pub struct Reconciler {
    directory: Arc<dyn TenantDirectory>,
    runtime: Arc<dyn RuntimeStore>,
}

impl Reconciler {
    pub fn new(directory: Arc<dyn TenantDirectory>, runtime: Arc<dyn RuntimeStore>) -> Self {
        Self { directory, runtime }
    }

    pub async fn sweep(&self) -> Result<ReconcileReport> {
        let tenants = self.directory.list_tenants().await?;
        let mut report = ReconcileReport::default();

        for tenant in tenants {
            report.checked += 1;
            match self.reconcile_tenant(tenant.id).await {
                Ok(true) => report.repaired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(tenant_id = %tenant.id, error = %e, "Reconcile failed");
                    report.errors += 1;
                }
            }
        }

        debug!(?report, "Reconcile sweep finished");
        Ok(report)
    }

    /// Bring one tenant's runtime state in line with the system of record.
    ///
    /// The listing that drives the sweep can be stale by the time a tenant is
    /// reached, so every decision uses a fresh read. A tenant missing from the
    /// directory counts as inactive.
    async fn reconcile_tenant(&self, tenant_id: Uuid) -> Result<bool> {
        let runtime_active = self.runtime.is_active(tenant_id).await?;
        let mut active = self.recorded_active(tenant_id).await?;
        let mut repaired = false;

        if runtime_active != active {
            self.runtime.set_active(tenant_id, active).await?;
            repaired = true;
            if active {
                // A cascade that committed while the flag was written must win
                active = self.recorded_active(tenant_id).await?;
                if !active {
                    self.runtime.set_active(tenant_id, false).await?;
                }
            }
            info!(tenant_id = %tenant_id, active, "Repaired runtime flag");
        }

        if !active && self.runtime.get_session_token(tenant_id).await?.is_some() {
            self.runtime.clear_session_token(tenant_id).await?;
            info!(tenant_id = %tenant_id, "Cleared session token of inactive tenant");
            repaired = true;
        }
        Ok(repaired)
    }

    async fn recorded_active(&self, tenant_id: Uuid) -> Result<bool> {
        Ok(self
            .directory
            .tenant(tenant_id)
            .await?
            .map(|t| t.is_active)
            .unwrap_or(false))
    }

    /// Sweep every `interval` until shutdown
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Reconcile sweep failed");
                    }
                    match self.runtime.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => debug!(purged = n, "Purged expired runtime keys"),
                        Err(e) => warn!(error = %e, "Runtime purge failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reconciler stopping");
                    return;
                }
            }
        }
    }
}
