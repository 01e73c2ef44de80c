//! Health check HTTP server for agent processes
//!
//! Liveness and readiness endpoints for process supervision plus a Prometheus
//! text endpoint built from the agents' counters.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::agents::{AgentHealth, AgentHealthSnapshot};
use crate::error::OrraError;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Overall process health response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub agents: Vec<AgentHealthSnapshot>,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    agents: Vec<Arc<AgentHealth>>,
}

impl HealthState {
    pub fn new(agents: Vec<Arc<AgentHealth>>) -> Self {
        Self {
            started_at: Utc::now(),
            agents,
        }
    }

    /// Unhealthy when every agent reports unhealthy, degraded when some do
    pub async fn get_health(&self) -> HealthResponse {
        let mut snapshots = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            snapshots.push(agent.snapshot().await);
        }

        let unhealthy = snapshots.iter().filter(|s| !s.healthy).count();
        let status = if unhealthy == 0 {
            HealthStatus::Healthy
        } else if unhealthy < snapshots.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            agents: snapshots,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.agents.iter().all(|a| a.is_ready())
    }
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until the shutdown channel fires
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::Result<()> {
        let app = health_router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| OrraError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if !state.is_ready() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.get_health().await.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let up = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
        HealthStatus::Unhealthy => -1,
    };

    let mut out = format!(
        "# HELP orra_up Health status (1=healthy, 0=degraded, -1=unhealthy)\n\
         # TYPE orra_up gauge\n\
         orra_up {}\n\n\
         # HELP orra_uptime_seconds Uptime in seconds\n\
         # TYPE orra_uptime_seconds counter\n\
         orra_uptime_seconds {}\n",
        up, health.uptime_seconds
    );

    for agent in &health.agents {
        let label = agent.name.replace('"', "");
        let _ = writeln!(
            out,
            "orra_agent_healthy{{agent=\"{}\"}} {}",
            label,
            u8::from(agent.healthy)
        );
        for (name, value) in &agent.metrics {
            let _ = writeln!(out, "orra_{}{{agent=\"{}\"}} {}", name, label, value);
        }
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        out,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_overall_health() {
        let a = Arc::new(AgentHealth::new("a"));
        let b = Arc::new(AgentHealth::new("b"));
        let state = HealthState::new(vec![a.clone(), b.clone()]);
        assert_eq!(state.get_health().await.status, HealthStatus::Healthy);

        a.mark_error("boom").await;
        assert_eq!(state.get_health().await.status, HealthStatus::Degraded);

        b.mark_error("boom").await;
        assert_eq!(state.get_health().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readyz_waits_for_agents() {
        let agent = Arc::new(AgentHealth::new("ticker-agent"));
        let app = health_router(Arc::new(HealthState::new(vec![agent.clone()])));

        let resp = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        agent.set_ready(true);
        let resp = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_include_agent_counters() {
        let agent = Arc::new(AgentHealth::new("notification-agent"));
        agent.add("events_processed", 4);
        let app = health_router(Arc::new(HealthState::new(vec![agent])));

        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("orra_events_processed{agent=\"notification-agent\"} 4"));
    }
}
