//! Turnover Guard - request security, authorization and idempotent webhook
//! ingestion for multi-tenant property-cleaning schedules.
//!
//! # Features
//!
//! - **Secure handler wrapper**: method check, rate limit, bearer auth and
//!   input sanitizing in front of every endpoint, with one JSON envelope
//!   and hardened headers on every response
//! - **Resource authorization**: tenant-scoped lookups, role matrix,
//!   ownership checks and an audit entry for every decision
//! - **Schedule lifecycle**: a table-driven state machine and
//!   optimistic-lock updates (exactly one of N concurrent writers wins)
//! - **Webhooks**: HMAC-SHA256 over the raw body, timestamp freshness and
//!   an insert-if-absent idempotency ledger
//!
//! # Architecture
//!
//! ```text
//! HTTP ──▶ SecureHandler ──▶ handler ──▶ AuthorizationEngine ──▶ ResourceStore
//!              │                │                 │
//!              ▼                ▼                 ▼
//!        RateLimiter      OptimisticUpdater    AuditTrail
//!        AuthValidator    WebhookPipeline ──▶ IdempotencyLedger
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turnover_guard::{router, AppState, GuardConfig, InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GuardConfig::from_env()?;
//!     let state = AppState::new(config, Arc::new(InMemoryStore::new()))?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3001").await?;
//!     axum::serve(listener, router(state)).await?;
//!     Ok(())
//! }
//! ```

pub mod authz;
pub mod config;
pub mod context;
pub mod cors;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod locking;
pub mod metrics;
pub mod model;
pub mod security;
pub mod server;
pub mod store;
pub mod webhook;

// Re-exports for convenience
pub use authz::{AuthorizationEngine, ResourceType};
pub use config::{ConfigError, GuardConfig};
pub use context::{Role, SecurityContext};
pub use error::{ApiEnvelope, GuardError, GuardResult};
pub use locking::OptimisticUpdater;
pub use server::{router, AppState};
pub use store::{InMemoryStore, Seed};
pub use webhook::WebhookPipeline;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
