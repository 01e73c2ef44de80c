//! Entitlement API: billing webhook intake and guard endpoints

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;

use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::info;

use crate::error::{OrraError, Result};

/// Serve the API until the shutdown channel fires
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| OrraError::Internal(format!("API server error: {}", e)))?;
    Ok(())
}
