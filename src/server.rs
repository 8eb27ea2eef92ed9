//! Router assembly and shared state.
//!
//! ```text
//! Request ──> CORS ──> Router ──> SecureHandler::run(policy, handler)
//!                        │
//!                        ├── /health /ready /status     (unwrapped)
//!                        ├── /api/schedules/status      ChangeStatusHandler
//!                        ├── /api/schedules/:id         ReadResourceHandler
//!                        ├── /api/properties/:id        ReadResourceHandler
//!                        └── /webhooks/:provider        WebhookPipeline
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use tracing::warn;

use crate::authz::{AuditTrail, AuthorizationEngine, ResourceType};
use crate::config::{ConfigError, GuardConfig};
use crate::context::new_request_id;
use crate::cors::{cors_layer, CorsConfig};
use crate::error::{GuardError, GuardResult};
use crate::handlers::{
    change_schedule_status, get_property, get_schedule, health_handler, ingest_webhook,
    readiness_handler, status_handler, ChangeStatusHandler, ReadResourceHandler,
};
use crate::locking::OptimisticUpdater;
use crate::metrics::GuardMetrics;
use crate::security::headers::SecurityHeaders;
use crate::security::{AuthValidator, EndpointPolicy, KeyStrategy, RateLimiter, SecureHandler};
use crate::store::InMemoryStore;
use crate::webhook::{
    IdempotencyLedger, SubscriptionBook, WebhookPipeline, WebhookVerifier, SIGNATURE_HEADER,
};

/// A policy paired with the handler it guards.
pub struct Endpoint<H> {
    pub policy: EndpointPolicy,
    pub handler: H,
}

/// Every guarded endpoint of the service.
pub struct Endpoints {
    pub change_status: Endpoint<ChangeStatusHandler>,
    pub read_schedule: Endpoint<ReadResourceHandler>,
    pub read_property: Endpoint<ReadResourceHandler>,
    pub webhook: Endpoint<WebhookPipeline>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub guard: SecureHandler,
    pub endpoints: Arc<Endpoints>,
    pub metrics: Arc<GuardMetrics>,
    pub limiter: RateLimiter,
    pub book: Arc<SubscriptionBook>,
    pub config: Arc<GuardConfig>,
    ledger: IdempotencyLedger,
}

impl AppState {
    /// Wire every component against one store.
    pub fn new(config: GuardConfig, store: Arc<InMemoryStore>) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(GuardMetrics::new());
        let limits = config.sanitizer_limits();
        let limiter = RateLimiter::new(store.clone());
        let guard = SecureHandler::new(
            limiter.clone(),
            AuthValidator::new(store.clone()),
            limits,
            config.handler_timeout,
            metrics.clone(),
        );

        let engine = AuthorizationEngine::new(store.clone(), AuditTrail::new(store.clone()));
        let updater = OptimisticUpdater::new(store.clone());

        let book = Arc::new(SubscriptionBook::new(config.field_cipher()?));
        let ledger = IdempotencyLedger::new(store.clone(), config.idempotency_ttl);
        let verifier = WebhookVerifier::new(
            config.webhook_secret.clone(),
            config.webhook_max_age_secs,
            config.clock_skew_tolerance_secs,
        )
        .require_timestamp(config.webhook_require_timestamp);
        let pipeline = WebhookPipeline::new(
            verifier,
            ledger.clone(),
            limits,
            book.clone(),
            metrics.clone(),
        )
        .with_consumer_timeout(config.handler_timeout / 2);

        let api_limit = config.rate_limit;
        let endpoints = Endpoints {
            change_status: Endpoint {
                policy: EndpointPolicy::new("schedules.status", [Method::PATCH])
                    .authenticated()
                    .rate_limited(api_limit, KeyStrategy::Credential(AUTHORIZATION)),
                handler: ChangeStatusHandler::new(engine.clone(), updater),
            },
            read_schedule: Endpoint {
                policy: EndpointPolicy::new("schedules.read", [Method::GET])
                    .authenticated()
                    .rate_limited(api_limit, KeyStrategy::Credential(AUTHORIZATION)),
                handler: ReadResourceHandler::new(engine.clone(), ResourceType::Schedule),
            },
            read_property: Endpoint {
                policy: EndpointPolicy::new("properties.read", [Method::GET])
                    .authenticated()
                    .rate_limited(api_limit, KeyStrategy::Credential(AUTHORIZATION)),
                handler: ReadResourceHandler::new(engine, ResourceType::Property),
            },
            webhook: Endpoint {
                policy: EndpointPolicy::new("webhooks.ingest", [Method::POST])
                    .rate_limited(
                        api_limit,
                        KeyStrategy::Credential(HeaderName::from_static(SIGNATURE_HEADER)),
                    )
                    .raw_body()
                    .bare_response(),
                handler: pipeline,
            },
        };

        Ok(Self {
            guard,
            endpoints: Arc::new(endpoints),
            metrics,
            limiter,
            book,
            config: Arc::new(config),
            ledger,
        })
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// One cheap store round-trip for the readiness check.
    pub async fn ping_store(&self) -> GuardResult<()> {
        self.ledger.find("readiness", "ping").await.map(|_| ())
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(CorsConfig::new(state.config.allowed_origins.clone()));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/api/schedules/status", any(change_schedule_status))
        .route("/api/schedules/:id", any(get_schedule))
        .route("/api/properties/:id", any(get_property))
        .route("/webhooks/:provider", any(ingest_webhook))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

async fn not_found() -> Response {
    let request_id = new_request_id();
    let envelope = GuardError::NotFound.into_envelope(&request_id);
    let mut response = (StatusCode::NOT_FOUND, Json(envelope)).into_response();
    SecurityHeaders::apply(response.headers_mut(), &request_id);
    response
}

/// One cleanup pass: finished rate limit windows and expired ledger records.
pub async fn sweep_store(limiter: &RateLimiter, ledger: &IdempotencyLedger, window: Duration) {
    if let Err(e) = limiter.cleanup(window).await {
        warn!(error = %e, "Rate limit bucket cleanup failed");
    }
    if let Err(e) = ledger.purge_expired(Utc::now()).await {
        warn!(error = %e, "Idempotency ledger cleanup failed");
    }
}

/// Run [`sweep_store`] once per rate limit window.
pub async fn run_store_cleanup(limiter: RateLimiter, ledger: IdempotencyLedger, window: Duration) {
    let mut ticker = tokio::time::interval(window.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        sweep_store(&limiter, &ledger, window).await;
    }
}
