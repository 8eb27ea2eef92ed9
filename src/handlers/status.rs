//! Status and health check handlers.
//!
//! - `/health` - liveness; always 200 while the process answers
//! - `/ready` - readiness; 503 when the backing store cannot be reached
//! - `/status` - uptime, request counters and latency percentiles
//!
//! These routes bypass the secure handler wrapper: they take no input, need
//! no identity and are polled by load balancers.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "name": "turnover-guard",
//!   "uptime_seconds": 3600,
//!   "metrics": {
//!     "requests_total": 5000,
//!     "rate_limited": 12,
//!     "replay_rejected": 3,
//!     "duplicate_webhooks": 41,
//!     "latency": { "p50_ms": 1.2, "p95_ms": 4.8, "p99_ms": 9.7 }
//!   },
//!   "status": "running"
//! }
//! ```

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::metrics::MetricsSnapshot;
use crate::server::AppState;

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Health check response for simple liveness checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self::with_status("healthy")
    }
}

/// Detailed server status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub name: String,
    pub uptime_seconds: u64,
    pub metrics: MetricsSnapshot,
    /// Always "running" if responding
    pub status: String,
    /// RFC 3339 time the snapshot was taken
    pub timestamp: String,
}

/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Health check requested");
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// `GET /ready`
#[instrument(skip_all)]
pub async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Readiness check requested");
    match state.ping_store().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse::with_status("ready"))),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::with_status("unavailable")),
            )
        }
    }
}

/// `GET /status`
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Status check requested");

    let metrics = state.metrics.snapshot();
    let response = StatusResponse {
        version: SERVER_VERSION.to_string(),
        name: SERVER_NAME.to_string(),
        uptime_seconds: metrics.uptime_seconds,
        metrics,
        status: "running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}
