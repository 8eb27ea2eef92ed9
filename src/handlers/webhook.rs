//! `POST /webhooks/:provider`
//!
//! The wrapper only rate-limits (keyed by the signature header) and bounds
//! the body size; the pipeline verifies the raw bytes before anything parses
//! them.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;

use crate::security::wrapper::GuardRequest;
use crate::server::AppState;

pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let endpoint = &state.endpoints.webhook;
    let request = GuardRequest::new(method, headers, body)
        .with_param("provider", provider)
        .with_client_ip(connect.map(|ConnectInfo(addr)| addr.ip()));
    state
        .guard
        .run(&endpoint.policy, request, &endpoint.handler)
        .await
}
