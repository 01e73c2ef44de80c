//! Graceful shutdown
//!
//! One watch channel per process. Agents select on `changed()` and finish
//! their current unit of work before returning.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn request(&self) {
        if self.tx.send_replace(true) {
            warn!("Shutdown already requested");
        } else {
            info!("Shutdown requested");
        }
    }

    /// Request shutdown on Ctrl+C or SIGTERM
    pub fn install_signal_handlers(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.request();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run a shutdown future with timeout protection
pub async fn with_timeout<F: Future>(fut: F, timeout_secs: u64, name: &str) {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
        Ok(_) => info!("{} shutdown completed gracefully", name),
        Err(_) => warn!("{} shutdown timed out after {}s, forcing", name, timeout_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_observe_request() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_requested());

        shutdown.request();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        // Second request is harmless
        shutdown.request();
        assert!(shutdown.is_requested());
    }
}
