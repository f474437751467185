//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestration systems
//! to determine if the service is healthy and ready to receive traffic.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Component health details.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    /// Infrastructure store reachability.
    pub store: ComponentStatus,

    /// Number of maintenance workers currently supervised.
    pub managed_infrastructures: usize,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// Status: "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Basic health check: returns 200 if the server is up.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "infra-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness check: 503 if the store cannot be read.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store_result = state.store().list_infrastructures().await;
    let store_ok = store_result.is_ok();

    let components = ComponentHealth {
        store: ComponentStatus {
            status: if store_ok { "ok" } else { "unavailable" }.to_string(),
            message: store_result.err().map(|e| e.to_string()),
        },
        managed_infrastructures: state.manager().list().await.len(),
    };

    let response = HealthResponse {
        status: if store_ok { "ok" } else { "degraded" }.to_string(),
        service: "infra-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(components),
    };

    if store_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Liveness check with an empty body.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
