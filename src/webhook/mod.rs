//! Webhook ingestion: signature and freshness checks, the idempotency
//! ledger, typed events and the subscription lifecycle consumer.

pub mod events;
pub mod idempotency;
pub mod lifecycle;
pub mod processor;
pub mod signature;

pub use events::{
    PurchaseEvent, SubscriptionChangeEvent, WebhookEnvelope, WebhookEventType,
};
pub use idempotency::{payload_hash, IdempotencyLedger, LedgerClaim, DEFAULT_TTL};
pub use lifecycle::{AccountStatus, SubscriberAccount, SubscriptionBook};
pub use processor::{
    ChangeOutcome, IngestOutcome, Ingested, LoggingLifecycle, NoOpLifecycle, SubscriptionLifecycle,
    WebhookPipeline,
};
pub use signature::{
    check_timestamp, compute_signature, is_webhook_timestamp_valid, parse_signature_header,
    sign_payload, sign_payload_at, verify_signature, WebhookVerifier, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
