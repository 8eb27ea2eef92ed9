//! Storage seams
//!
//! Every piece of shared mutable state lives behind one of these traits. The
//! two cross-request primitives are atomic at the storage layer:
//!
//! - [`RateLimitStore::increment_with_ceiling`] for rate-limit buckets
//! - [`IdempotencyStore::insert_if_absent`] for the webhook ledger
//!
//! and schedule mutation goes through
//! [`ResourceStore::compare_and_swap_schedule`]. The in-memory backend in
//! [`memory`] is what tests run against; a distributed backend implements the
//! same traits.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::authz::audit::AuditLogEntry;
use crate::model::{
    HistoryStamp, IdempotencyRecord, Property, Schedule, ScheduleUpdate, Session,
};

pub use memory::{InMemoryStore, Seed};

/// Storage-layer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or timed out; safe to retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a bucket increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Count after this call (never above the ceiling)
    pub count: u32,
    /// False when the ceiling had already been reached
    pub admitted: bool,
}

/// Outcome of a ledger insert.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerInsert {
    Inserted,
    Duplicate(IdempotencyRecord),
}

/// Outcome of a version-guarded schedule update.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(Schedule),
    VersionMismatch { current: u64 },
    Missing,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session by the SHA-256 hex of its bearer token.
    async fn find_session(&self, token_hash: &str) -> StoreResult<Option<Session>>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically count one request for `key` in the window starting at
    /// `window_start_ms`. A bucket from an older window is reset first. The
    /// counter is not incremented past `ceiling`.
    async fn increment_with_ceiling(
        &self,
        key: &str,
        window_start_ms: i64,
        window_ms: u64,
        ceiling: u32,
    ) -> StoreResult<BucketState>;

    /// Current count for `key` in the window starting at `window_start_ms`,
    /// without counting a request.
    async fn bucket_count(&self, key: &str, window_start_ms: i64) -> StoreResult<u32>;

    /// Drop buckets whose window ended before `older_than_ms`.
    async fn purge_buckets(&self, older_than_ms: i64) -> StoreResult<usize>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` unless a live record with the same provider and event
    /// id exists. Either fully commits or leaves nothing behind.
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerInsert>;

    async fn mark_processed(&self, provider: &str, event_id: &str) -> StoreResult<()>;

    /// Remove a record that was never marked processed.
    async fn release(&self, provider: &str, event_id: &str) -> StoreResult<bool>;

    async fn find_record(
        &self,
        provider: &str,
        event_id: &str,
    ) -> StoreResult<Option<IdempotencyRecord>>;

    /// Drop records whose `expires_at` has passed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Tenant-scoped lookup. A schedule in another tenant is `None`.
    async fn find_schedule_scoped(
        &self,
        tenant_id: &str,
        schedule_id: &str,
    ) -> StoreResult<Option<Schedule>>;

    /// Tenant-scoped lookup. A property in another tenant is `None`.
    async fn find_property_scoped(
        &self,
        tenant_id: &str,
        property_id: &str,
    ) -> StoreResult<Option<Property>>;

    /// Apply `update` and bump the version only if the stored version equals
    /// `expected_version`; append a history entry built from `stamp`.
    async fn compare_and_swap_schedule(
        &self,
        tenant_id: &str,
        schedule_id: &str,
        expected_version: u64,
        update: &ScheduleUpdate,
        stamp: HistoryStamp,
    ) -> StoreResult<CasOutcome>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditLogEntry) -> StoreResult<()>;
}
