//! HTTP API: liveness, readiness, per-loop status and Prometheus metrics

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use controller_lib::{
    health::HealthRegistry,
    observability::ControlMetrics,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    /// Keeps the global collectors registered before the first scrape
    pub metrics: ControlMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: ControlMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn probe_status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// 503 only once a component is unhealthy; degraded loops keep running
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    (probe_status(health.status.is_operational()), Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    (probe_status(readiness.ready), Json(readiness))
}

/// Last interval of every control loop, keyed by application
async fn loops(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_registry.loops().await)
}

async fn metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let status = match TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            buffer.clear();
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        buffer,
    )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/loops", get(loops))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
