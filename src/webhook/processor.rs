//! Webhook Ingestion Pipeline
//!
//! Accepts purchase/subscription events from a payment provider and applies
//! each one at most once.
//!
//! # Architecture
//!
//! ```text
//! Webhook Received (raw bytes)
//!       |
//!       v
//! [Verify Signature] --> mismatch/stale? --> 401
//!       |
//!       v
//! [Sanitize + Parse Schema] --> malformed? --> 400
//!       |
//!       v
//! [Claim in Ledger] --> already claimed? --> 200 already_processed
//!       |
//!       v
//! [Dispatch to Lifecycle] (own task, runs to completion)
//!       |
//!       +--> ok       --> mark processed --> 200 processed | ignored
//!       +--> failed   --> release claim  --> 503 (provider retries)
//!       +--> too slow --> claim held     --> 503; the task still settles
//! ```
//!
//! Dispatch runs on its own task and is never cancelled once started. A
//! consumer that outlives the response deadline may already have applied
//! its side effect, so its claim stays in the ledger and a retry is
//! answered as a duplicate. Only an error returned by the consumer releases
//! the claim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Level};

use super::events::{PurchaseEvent, SubscriptionChangeEvent, WebhookEnvelope, WebhookEventType};
use super::idempotency::{IdempotencyLedger, LedgerClaim};
use super::signature::WebhookVerifier;
use crate::context::SecurityContext;
use crate::error::{GuardError, GuardResult};
use crate::metrics::GuardMetrics;
use crate::security::masking::{mask_email, secure_log};
use crate::security::sanitize::{parse_signed_json_body, SanitizerLimits};
use crate::security::wrapper::{SecuredHandler, ValidatedRequest};

/// Result of applying a subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    /// The subscriber is unknown here, e.g. their purchase predates this
    /// deployment. Retrying cannot help, so the event is acknowledged as
    /// ignored.
    UnknownSubscriber,
}

/// Consumer of verified, deduplicated webhook events
#[async_trait]
pub trait SubscriptionLifecycle: Send + Sync + 'static {
    /// Purchase approved or completed
    async fn on_activated(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()>;

    /// Purchase canceled, refunded or charged back
    async fn on_revoked(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()>;

    /// Payment delayed
    async fn on_past_due(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()>;

    /// Subscription cancelled by the subscriber
    async fn on_cancelled(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome>;

    /// Subscriber moved to another plan
    async fn on_plan_changed(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome>;
}

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed,
    Ignored,
    AlreadyProcessed,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

/// Acknowledgement returned to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub outcome: IngestOutcome,
    pub event_id: String,
    pub event: String,
}

impl Ingested {
    pub fn to_json(&self) -> Value {
        json!({ "status": self.outcome.as_str(), "event": self.event })
    }
}

/// Event decoded far enough to know which consumer callback applies.
#[derive(Debug, Clone)]
enum TypedEvent {
    Purchase(PurchaseEvent),
    Subscription(SubscriptionChangeEvent),
    Unrecognized,
}

impl TypedEvent {
    fn decode(envelope: &WebhookEnvelope) -> GuardResult<Self> {
        let event_type = envelope.typed_event_type();
        if event_type.is_purchase() {
            Ok(Self::Purchase(envelope.as_purchase()?))
        } else if event_type.is_known() {
            Ok(Self::Subscription(envelope.as_subscription_change()?))
        } else {
            Ok(Self::Unrecognized)
        }
    }
}

/// Verifies, deduplicates and dispatches webhook deliveries.
#[derive(Clone)]
pub struct WebhookPipeline {
    verifier: WebhookVerifier,
    ledger: IdempotencyLedger,
    limits: SanitizerLimits,
    lifecycle: Arc<dyn SubscriptionLifecycle>,
    metrics: Arc<GuardMetrics>,
    consumer_timeout: Duration,
}

impl WebhookPipeline {
    pub fn new(
        verifier: WebhookVerifier,
        ledger: IdempotencyLedger,
        limits: SanitizerLimits,
        lifecycle: Arc<dyn SubscriptionLifecycle>,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            verifier,
            ledger,
            limits,
            lifecycle,
            metrics,
            consumer_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_consumer_timeout(mut self, consumer_timeout: Duration) -> Self {
        self.consumer_timeout = consumer_timeout;
        self
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Run one delivery through the pipeline.
    pub async fn ingest(
        &self,
        provider: &str,
        raw_body: Bytes,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> GuardResult<Ingested> {
        if !is_valid_provider(provider) {
            return Err(GuardError::validation("Unknown webhook provider"));
        }

        self.verifier.verify(&raw_body, headers, now).map_err(|reason| {
            let reason_text = reason.to_string();
            let body_bytes = raw_body.len().to_string();
            let signature = headers
                .get(super::signature::SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            secure_log(
                Level::WARN,
                "Webhook delivery rejected",
                &[
                    ("provider", provider),
                    ("reason", reason_text.as_str()),
                    ("body_bytes", body_bytes.as_str()),
                    ("signature", signature),
                ],
            );
            GuardError::Replay(reason)
        })?;

        let value = parse_signed_json_body(&raw_body, &self.limits)?
            .ok_or_else(|| GuardError::validation("Webhook body is empty"))?;
        let envelope = WebhookEnvelope::from_value(value)?;
        let typed = TypedEvent::decode(&envelope)?;

        let claim = self
            .ledger
            .claim(&envelope.id, &envelope.event, provider, &raw_body, now)
            .await?;

        if let LedgerClaim::Duplicate(record) = claim {
            let seen = self.metrics.record_duplicate_webhook();
            info!(
                provider,
                event_id = %envelope.id,
                event = %envelope.event,
                processed = record.processed,
                duplicates_total = seen,
                "Duplicate webhook delivery skipped"
            );
            return Ok(Ingested {
                outcome: IngestOutcome::AlreadyProcessed,
                event_id: envelope.id,
                event: envelope.event,
            });
        }

        let pipeline = self.clone();
        let task_provider = provider.to_string();
        let task_envelope = envelope.clone();
        let mut task = tokio::spawn(async move {
            pipeline
                .dispatch_and_settle(&task_provider, &task_envelope, typed)
                .await
        });

        // Dropping the handle on timeout detaches the task; it keeps running.
        let outcome = match timeout(self.consumer_timeout, &mut task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                // Side effects may have run before the panic; keep the claim.
                error!(
                    provider,
                    event_id = %envelope.id,
                    error = %join_err,
                    "Webhook dispatch task aborted; claim kept"
                );
                return Err(GuardError::Unavailable("webhook consumer".to_string()));
            }
            Err(_) => {
                warn!(
                    provider,
                    event_id = %envelope.id,
                    event = %envelope.event,
                    timeout_ms = self.consumer_timeout.as_millis() as u64,
                    "Webhook consumer still running; claim kept until it settles"
                );
                return Err(GuardError::Unavailable("webhook consumer".to_string()));
            }
        };

        Ok(Ingested {
            outcome,
            event_id: envelope.id,
            event: envelope.event,
        })
    }

    async fn dispatch_and_settle(
        &self,
        provider: &str,
        envelope: &WebhookEnvelope,
        typed: TypedEvent,
    ) -> GuardResult<IngestOutcome> {
        match self.dispatch(provider, envelope, typed).await {
            Ok(outcome) => {
                if let Err(e) = self.ledger.complete(provider, &envelope.id).await {
                    // Side effects already ran; a retry would see the claim and skip.
                    error!(
                        provider,
                        event_id = %envelope.id,
                        error = %e,
                        "Webhook applied but ledger not marked processed"
                    );
                }
                info!(
                    provider,
                    event_id = %envelope.id,
                    event = %envelope.event,
                    outcome = outcome.as_str(),
                    "Webhook event settled"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    provider,
                    event_id = %envelope.id,
                    event = %envelope.event,
                    error = %e,
                    "Webhook consumer failed; releasing claim for retry"
                );
                self.release_quietly(provider, &envelope.id).await;
                Err(GuardError::Unavailable("webhook consumer".to_string()))
            }
        }
    }

    async fn dispatch(
        &self,
        provider: &str,
        envelope: &WebhookEnvelope,
        typed: TypedEvent,
    ) -> anyhow::Result<IngestOutcome> {
        let lifecycle = &self.lifecycle;
        match (envelope.typed_event_type(), typed) {
            (
                WebhookEventType::PurchaseApproved | WebhookEventType::PurchaseComplete,
                TypedEvent::Purchase(event),
            ) => lifecycle.on_activated(provider, &event).await?,
            (
                WebhookEventType::PurchaseCanceled
                | WebhookEventType::PurchaseRefunded
                | WebhookEventType::PurchaseChargeback,
                TypedEvent::Purchase(event),
            ) => lifecycle.on_revoked(provider, &event).await?,
            (WebhookEventType::PurchaseDelayed, TypedEvent::Purchase(event)) => {
                lifecycle.on_past_due(provider, &event).await?
            }
            (WebhookEventType::SubscriptionCancellation, TypedEvent::Subscription(event)) => {
                let change = lifecycle.on_cancelled(provider, &event).await?;
                return Ok(change_outcome(provider, envelope, change));
            }
            (WebhookEventType::SwitchPlan, TypedEvent::Subscription(event)) => {
                let change = lifecycle.on_plan_changed(provider, &event).await?;
                return Ok(change_outcome(provider, envelope, change));
            }
            _ => {
                debug!(
                    provider,
                    event_id = %envelope.id,
                    event = %envelope.event,
                    "Ignoring unhandled event type"
                );
                return Ok(IngestOutcome::Ignored);
            }
        }
        Ok(IngestOutcome::Processed)
    }

    async fn release_quietly(&self, provider: &str, event_id: &str) {
        if let Err(e) = self.ledger.release(provider, event_id).await {
            error!(provider, event_id, error = %e, "Failed to release webhook claim");
        }
    }
}

fn change_outcome(
    provider: &str,
    envelope: &WebhookEnvelope,
    change: ChangeOutcome,
) -> IngestOutcome {
    match change {
        ChangeOutcome::Applied => IngestOutcome::Processed,
        ChangeOutcome::UnknownSubscriber => {
            warn!(
                provider,
                event_id = %envelope.id,
                event = %envelope.event,
                "Subscription change for unknown subscriber ignored"
            );
            IngestOutcome::Ignored
        }
    }
}

/// Providers are path segments: lowercase ASCII, digits, `-` and `_`.
fn is_valid_provider(provider: &str) -> bool {
    !provider.is_empty()
        && provider.len() <= 32
        && provider
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

#[async_trait]
impl SecuredHandler for WebhookPipeline {
    async fn handle(&self, _ctx: &SecurityContext, request: ValidatedRequest) -> GuardResult<Value> {
        let provider = request.param("provider")?;
        let ingested = self
            .ingest(provider, request.raw_body.clone(), &request.headers, Utc::now())
            .await?;
        Ok(ingested.to_json())
    }
}

/// No-op lifecycle for testing
#[derive(Clone)]
pub struct NoOpLifecycle;

#[async_trait]
impl SubscriptionLifecycle for NoOpLifecycle {
    async fn on_activated(&self, _provider: &str, _event: &PurchaseEvent) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_revoked(&self, _provider: &str, _event: &PurchaseEvent) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_past_due(&self, _provider: &str, _event: &PurchaseEvent) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_cancelled(
        &self,
        _provider: &str,
        _event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome> {
        Ok(ChangeOutcome::Applied)
    }
    async fn on_plan_changed(
        &self,
        _provider: &str,
        _event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome> {
        Ok(ChangeOutcome::Applied)
    }
}

/// Logging lifecycle that logs all events with masked subscriber emails
#[derive(Clone)]
pub struct LoggingLifecycle;

#[async_trait]
impl SubscriptionLifecycle for LoggingLifecycle {
    async fn on_activated(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()> {
        info!(
            provider,
            event_id = %event.event_id,
            subscriber = %mask_email(event.subscriber_email()),
            transaction = %event.data.purchase.transaction,
            plan = ?event.plan_name(),
            "Subscription activated"
        );
        Ok(())
    }

    async fn on_revoked(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()> {
        info!(
            provider,
            event_id = %event.event_id,
            subscriber = %mask_email(event.subscriber_email()),
            reason = event.event_type.as_str(),
            "Subscription revoked"
        );
        Ok(())
    }

    async fn on_past_due(&self, provider: &str, event: &PurchaseEvent) -> anyhow::Result<()> {
        warn!(
            provider,
            event_id = %event.event_id,
            subscriber = %mask_email(event.subscriber_email()),
            "Subscription payment delayed"
        );
        Ok(())
    }

    async fn on_cancelled(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome> {
        info!(
            provider,
            event_id = %event.event_id,
            subscriber = %mask_email(&event.data.subscriber.email),
            "Subscription cancelled"
        );
        Ok(ChangeOutcome::Applied)
    }

    async fn on_plan_changed(
        &self,
        provider: &str,
        event: &SubscriptionChangeEvent,
    ) -> anyhow::Result<ChangeOutcome> {
        info!(
            provider,
            event_id = %event.event_id,
            subscriber = %mask_email(&event.data.subscriber.email),
            plan = ?event.data.plan.as_ref().map(|p| p.name.as_str()),
            "Subscription plan changed"
        );
        Ok(ChangeOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplayReason;
    use crate::store::InMemoryStore;
    use crate::webhook::idempotency::DEFAULT_TTL;
    use crate::webhook::signature::{sign_payload, sign_payload_at, SIGNATURE_HEADER};
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const SECRET: &str = "whsec_test";

    /// Test lifecycle that tracks calls
    struct TestLifecycle {
        activated_calls: AtomicU32,
        revoked_calls: AtomicU32,
        past_due_calls: AtomicU32,
        cancelled_calls: AtomicU32,
        plan_changed_calls: AtomicU32,
        should_fail: AtomicBool,
        delay: Option<Duration>,
    }

    impl TestLifecycle {
        fn new() -> Self {
            Self {
                activated_calls: AtomicU32::new(0),
                revoked_calls: AtomicU32::new(0),
                past_due_calls: AtomicU32::new(0),
                cancelled_calls: AtomicU32::new(0),
                plan_changed_calls: AtomicU32::new(0),
                should_fail: AtomicBool::new(false),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl SubscriptionLifecycle for TestLifecycle {
        async fn on_activated(&self, _provider: &str, _event: &PurchaseEvent) -> anyhow::Result<()> {
            self.activated_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail.load(Ordering::SeqCst) {
                anyhow::bail!("Simulated failure");
            }
            Ok(())
        }
        async fn on_revoked(&self, _provider: &str, _event: &PurchaseEvent) -> anyhow::Result<()> {
            self.revoked_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_past_due(&self, _provider: &str, _event: &PurchaseEvent) -> anyhow::Result<()> {
            self.past_due_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_cancelled(
            &self,
            _provider: &str,
            _event: &SubscriptionChangeEvent,
        ) -> anyhow::Result<ChangeOutcome> {
            self.cancelled_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChangeOutcome::Applied)
        }
        async fn on_plan_changed(
            &self,
            _provider: &str,
            _event: &SubscriptionChangeEvent,
        ) -> anyhow::Result<ChangeOutcome> {
            self.plan_changed_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChangeOutcome::Applied)
        }
    }

    fn pipeline_with(lifecycle: Arc<TestLifecycle>) -> (WebhookPipeline, Arc<GuardMetrics>) {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(GuardMetrics::new());
        let pipeline = WebhookPipeline::new(
            WebhookVerifier::new(SECRET, 300, 30),
            IdempotencyLedger::new(store, DEFAULT_TTL),
            SanitizerLimits::default(),
            lifecycle,
            metrics.clone(),
        )
        .with_consumer_timeout(Duration::from_millis(200));
        (pipeline, metrics)
    }

    fn purchase_body(id: &str, event: &str) -> Bytes {
        Bytes::from(
            json!({
                "id": id,
                "event": event,
                "data": {
                    "buyer": {"email": "ana@example.com", "document": "12345678909"},
                    "purchase": {"transaction": "HP1"}
                }
            })
            .to_string(),
        )
    }

    fn signed(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_payload(body, SECRET)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_first_delivery_processed_then_duplicate_skipped() {
        let lifecycle = Arc::new(TestLifecycle::new());
        let (pipeline, metrics) = pipeline_with(lifecycle.clone());
        let body = purchase_body("evt-1", "PURCHASE_APPROVED");
        let headers = signed(&body);

        let first = pipeline.ingest("hotmart", body.clone(), &headers, Utc::now()).await.unwrap();
        assert_eq!(first.outcome, IngestOutcome::Processed);
        assert_eq!(first.to_json(), json!({"status": "processed", "event": "PURCHASE_APPROVED"}));

        let second = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap();
        assert_eq!(second.outcome, IngestOutcome::AlreadyProcessed);

        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().duplicate_webhooks, 1);
        let record = pipeline.ledger().find("hotmart", "evt-1").await.unwrap().unwrap();
        assert!(record.processed);
    }

    #[tokio::test]
    async fn test_tampered_body_rejected_before_ledger() {
        let lifecycle = Arc::new(TestLifecycle::new());
        let (pipeline, _) = pipeline_with(lifecycle.clone());
        let body = purchase_body("evt-1", "PURCHASE_APPROVED");
        let headers = signed(&body);
        let tampered = Bytes::from(
            String::from_utf8(body.to_vec()).unwrap().replace("HP1", "HP2"),
        );

        let err = pipeline.ingest("hotmart", tampered, &headers, Utc::now()).await.unwrap_err();
        assert!(matches!(err, GuardError::Replay(ReplayReason::BadSignature)));
        assert!(pipeline.ledger().find("hotmart", "evt-1").await.unwrap().is_none());
        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_bound_timestamp_rejected() {
        let (pipeline, _) = pipeline_with(Arc::new(TestLifecycle::new()));
        let body = purchase_body("evt-1", "PURCHASE_APPROVED");
        let mut headers = HeaderMap::new();
        let old = (Utc::now() - chrono::Duration::hours(2)).timestamp();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign_payload_at(&body, SECRET, old)).unwrap(),
        );

        let err = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap_err();
        assert!(matches!(err, GuardError::Replay(ReplayReason::StaleTimestamp)));
    }

    #[tokio::test]
    async fn test_unknown_event_recorded_and_ignored() {
        let lifecycle = Arc::new(TestLifecycle::new());
        let (pipeline, _) = pipeline_with(lifecycle.clone());
        let body = Bytes::from(r#"{"id":"evt-9","event":"CLUB_FIRST_ACCESS","data":{}}"#);
        let headers = signed(&body);

        let ingested = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap();
        assert_eq!(ingested.outcome, IngestOutcome::Ignored);
        assert!(pipeline.ledger().find("hotmart", "evt-9").await.unwrap().unwrap().processed);
        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_consumer_failure_releases_claim_for_retry() {
        let lifecycle = Arc::new(TestLifecycle::new());
        lifecycle.should_fail.store(true, Ordering::SeqCst);
        let (pipeline, _) = pipeline_with(lifecycle.clone());
        let body = purchase_body("evt-2", "PURCHASE_COMPLETE");
        let headers = signed(&body);

        let err = pipeline.ingest("hotmart", body.clone(), &headers, Utc::now()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(pipeline.ledger().find("hotmart", "evt-2").await.unwrap().is_none());

        lifecycle.should_fail.store(false, Ordering::SeqCst);
        let retry = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap();
        assert_eq!(retry.outcome, IngestOutcome::Processed);
        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_consumer_keeps_claim_and_runs_once() {
        let mut lifecycle = TestLifecycle::new();
        lifecycle.delay = Some(Duration::from_millis(500));
        let lifecycle = Arc::new(lifecycle);
        let (pipeline, metrics) = pipeline_with(lifecycle.clone());
        let body = purchase_body("evt-3", "PURCHASE_APPROVED");
        let headers = signed(&body);

        let err = pipeline.ingest("hotmart", body.clone(), &headers, Utc::now()).await.unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
        let held = pipeline.ledger().find("hotmart", "evt-3").await.unwrap().unwrap();
        assert!(!held.processed);

        // The provider retries while the first consumer is still running.
        let retry = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap();
        assert_eq!(retry.outcome, IngestOutcome::AlreadyProcessed);
        assert_eq!(metrics.snapshot().duplicate_webhooks, 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 1);
        assert!(pipeline.ledger().find("hotmart", "evt-3").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_schema_errors_leave_no_ledger_entry() {
        let (pipeline, _) = pipeline_with(Arc::new(TestLifecycle::new()));
        let body = Bytes::from(r#"{"id":"evt-4","event":"PURCHASE_APPROVED","data":{}}"#);
        let headers = signed(&body);

        let err = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(pipeline.ledger().find("hotmart", "evt-4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signed_body_with_query_string_url_accepted() {
        let lifecycle = Arc::new(TestLifecycle::new());
        let (pipeline, _) = pipeline_with(lifecycle.clone());
        let body = Bytes::from(
            json!({
                "id": "evt-5",
                "event": "PURCHASE_APPROVED",
                "data": {
                    "buyer": {"email": "ana@example.com"},
                    "purchase": {
                        "transaction": "HP5",
                        "checkout_url": "https://pay.example.com/c?one=1&onload=x"
                    }
                }
            })
            .to_string(),
        );
        let headers = signed(&body);

        let ingested = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap();
        assert_eq!(ingested.outcome, IngestOutcome::Processed);
        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forbidden_keys_in_signed_body_rejected() {
        let (pipeline, _) = pipeline_with(Arc::new(TestLifecycle::new()));
        let body = Bytes::from(
            r#"{"id":"evt-6","event":"PURCHASE_APPROVED","data":{"__proto__":{},"buyer":{"email":"a@b.co"},"purchase":{"transaction":"t"}}}"#,
        );
        let headers = signed(&body);
        let err = pipeline.ingest("hotmart", body, &headers, Utc::now()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(pipeline.ledger().find("hotmart", "evt-6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_change_for_unknown_subscriber_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let book = Arc::new(crate::webhook::SubscriptionBook::new(
            crate::crypto::FieldCipher::ephemeral(),
        ));
        let pipeline = WebhookPipeline::new(
            WebhookVerifier::new(SECRET, 300, 30),
            IdempotencyLedger::new(store, DEFAULT_TTL),
            SanitizerLimits::default(),
            book.clone(),
            Arc::new(GuardMetrics::new()),
        );
        let cancel = Bytes::from(
            r#"{"id":"evt-7","event":"SUBSCRIPTION_CANCELLATION","data":{"subscriber":{"email":"nobody@example.com"}}}"#,
        );

        let first = pipeline.ingest("hotmart", cancel.clone(), &signed(&cancel), Utc::now()).await.unwrap();
        assert_eq!(first.outcome, IngestOutcome::Ignored);
        assert!(pipeline.ledger().find("hotmart", "evt-7").await.unwrap().unwrap().processed);
        assert!(book.is_empty());

        let retry = pipeline.ingest("hotmart", cancel.clone(), &signed(&cancel), Utc::now()).await.unwrap();
        assert_eq!(retry.outcome, IngestOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_event_type() {
        let lifecycle = Arc::new(TestLifecycle::new());
        let (pipeline, _) = pipeline_with(lifecycle.clone());

        for (id, event) in [
            ("evt-a", "PURCHASE_REFUNDED"),
            ("evt-b", "PURCHASE_CHARGEBACK"),
            ("evt-c", "PURCHASE_DELAYED"),
        ] {
            let body = purchase_body(id, event);
            pipeline.ingest("hotmart", body.clone(), &signed(&body), Utc::now()).await.unwrap();
        }
        let cancel = Bytes::from(
            r#"{"id":"evt-d","event":"SUBSCRIPTION_CANCELLATION","data":{"subscriber":{"email":"ana@example.com"}}}"#,
        );
        pipeline.ingest("hotmart", cancel.clone(), &signed(&cancel), Utc::now()).await.unwrap();
        let switch = Bytes::from(
            r#"{"id":"evt-e","event":"SWITCH_PLAN","data":{"subscriber":{"email":"ana@example.com"},"plan":{"name":"Pro"}}}"#,
        );
        pipeline.ingest("hotmart", switch.clone(), &signed(&switch), Utc::now()).await.unwrap();

        assert_eq!(lifecycle.revoked_calls.load(Ordering::SeqCst), 2);
        assert_eq!(lifecycle.past_due_calls.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.cancelled_calls.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.plan_changed_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_apply_once() {
        let lifecycle = Arc::new(TestLifecycle::new());
        let (pipeline, _) = pipeline_with(lifecycle.clone());
        let body = purchase_body("evt-race", "PURCHASE_APPROVED");
        let headers = signed(&body);

        let deliveries = (0..8).map(|_| pipeline.ingest("hotmart", body.clone(), &headers, Utc::now()));
        let results = futures::future::join_all(deliveries).await;

        let processed = results
            .iter()
            .filter(|r| matches!(r, Ok(i) if i.outcome == IngestOutcome::Processed))
            .count();
        assert_eq!(processed, 1);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(lifecycle.activated_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_provider_rejected() {
        let (pipeline, _) = pipeline_with(Arc::new(TestLifecycle::new()));
        let body = purchase_body("evt-1", "PURCHASE_APPROVED");
        for provider in ["", "Hot Mart", "../etc"] {
            let err = pipeline
                .ingest(provider, body.clone(), &signed(&body), Utc::now())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
    }
}
