//! In-memory backend.
//!
//! Each map sits behind its own `RwLock`; every trait operation takes the
//! write lock for its whole read-modify-write, which is what makes the
//! increment, insert-if-absent and compare-and-swap primitives atomic within
//! one process. `set_unavailable` turns every call into
//! [`StoreError::Unavailable`] for fault-injection tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    AuditStore, BucketState, CasOutcome, IdempotencyStore, LedgerInsert, RateLimitStore,
    ResourceStore, SessionStore, StoreError, StoreResult,
};
use crate::authz::audit::AuditLogEntry;
use crate::model::{
    HistoryEntry, HistoryStamp, IdempotencyRecord, Property, RateLimitBucket, Schedule,
    ScheduleUpdate, Session,
};
use crate::security::auth::hash_token;

/// Fixture loaded with `--seed`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub sessions: Vec<SeedSession>,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

/// A session plus the plaintext token that resolves to it.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedSession {
    pub token: String,
    #[serde(flatten)]
    pub session: Session,
}

impl Seed {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Ledger key: one namespace per provider.
type LedgerKey = (String, String);

#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    buckets: RwLock<HashMap<String, RateLimitBucket>>,
    ledger: RwLock<HashMap<LedgerKey, IdempotencyRecord>>,
    schedules: RwLock<HashMap<String, Schedule>>,
    properties: RwLock<HashMap<String, Property>>,
    audit: RwLock<Vec<AuditLogEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated from a fixture.
    pub async fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for entry in seed.sessions {
            store.insert_session(&entry.token, entry.session).await;
        }
        for property in seed.properties {
            store.insert_property(property).await;
        }
        for schedule in seed.schedules {
            store.insert_schedule(schedule).await;
        }
        info!(
            sessions = store.sessions.read().await.len(),
            properties = store.properties.read().await.len(),
            schedules = store.schedules.read().await.len(),
            "Seeded in-memory store"
        );
        store
    }

    /// Register a session under the hash of `token`.
    pub async fn insert_session(&self, token: &str, session: Session) {
        self.sessions
            .write()
            .await
            .insert(hash_token(token), session);
    }

    pub async fn insert_schedule(&self, schedule: Schedule) {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule);
    }

    pub async fn insert_property(&self, property: Property) {
        self.properties
            .write()
            .await
            .insert(property.id.clone(), property);
    }

    /// Snapshot of the audit trail, oldest first.
    pub async fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.audit.read().await.clone()
    }

    /// Unscoped read for tests and operators; request paths use the scoped
    /// trait methods.
    pub async fn schedule_unscoped(&self, schedule_id: &str) -> Option<Schedule> {
        self.schedules.read().await.get(schedule_id).cloned()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn find_session(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        self.ensure_available()?;
        Ok(self.sessions.read().await.get(token_hash).cloned())
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn increment_with_ceiling(
        &self,
        key: &str,
        window_start_ms: i64,
        window_ms: u64,
        ceiling: u32,
    ) -> StoreResult<BucketState> {
        self.ensure_available()?;
        let mut buckets = self.buckets.write().await;

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateLimitBucket {
                key: key.to_string(),
                window_start: window_start_ms,
                count: 0,
                limit: ceiling,
                window_ms,
            });

        if bucket.window_start != window_start_ms {
            bucket.window_start = window_start_ms;
            bucket.window_ms = window_ms;
            bucket.count = 0;
        }
        bucket.limit = ceiling;

        if bucket.count >= ceiling {
            return Ok(BucketState {
                count: bucket.count,
                admitted: false,
            });
        }

        bucket.count += 1;
        Ok(BucketState {
            count: bucket.count,
            admitted: true,
        })
    }

    async fn bucket_count(&self, key: &str, window_start_ms: i64) -> StoreResult<u32> {
        self.ensure_available()?;
        Ok(self
            .buckets
            .read()
            .await
            .get(key)
            .filter(|b| b.window_start == window_start_ms)
            .map_or(0, |b| b.count))
    }

    async fn purge_buckets(&self, older_than_ms: i64) -> StoreResult<usize> {
        self.ensure_available()?;
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, b| b.window_start + b.window_ms as i64 >= older_than_ms);
        Ok(before - buckets.len())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerInsert> {
        self.ensure_available()?;
        let mut ledger = self.ledger.write().await;
        let key = (record.provider.clone(), record.event_id.clone());

        if let Some(existing) = ledger.get(&key) {
            if !existing.is_expired_at(now) {
                return Ok(LedgerInsert::Duplicate(existing.clone()));
            }
            debug!(event_id = %record.event_id, "Expired ledger record replaced");
        }

        ledger.insert(key, record);
        Ok(LedgerInsert::Inserted)
    }

    async fn mark_processed(&self, provider: &str, event_id: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let mut ledger = self.ledger.write().await;
        match ledger.get_mut(&(provider.to_string(), event_id.to_string())) {
            Some(record) => {
                record.processed = true;
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!(
                "ledger record {provider}/{event_id} vanished before completion"
            ))),
        }
    }

    async fn release(&self, provider: &str, event_id: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut ledger = self.ledger.write().await;
        let key = (provider.to_string(), event_id.to_string());
        match ledger.get(&key) {
            Some(record) if !record.processed => {
                ledger.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_record(
        &self,
        provider: &str,
        event_id: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        self.ensure_available()?;
        Ok(self
            .ledger
            .read()
            .await
            .get(&(provider.to_string(), event_id.to_string()))
            .cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.ensure_available()?;
        let mut ledger = self.ledger.write().await;
        let before = ledger.len();
        ledger.retain(|_, record| !record.is_expired_at(now));
        Ok(before - ledger.len())
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn find_schedule_scoped(
        &self,
        tenant_id: &str,
        schedule_id: &str,
    ) -> StoreResult<Option<Schedule>> {
        self.ensure_available()?;
        Ok(self
            .schedules
            .read()
            .await
            .get(schedule_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_property_scoped(
        &self,
        tenant_id: &str,
        property_id: &str,
    ) -> StoreResult<Option<Property>> {
        self.ensure_available()?;
        Ok(self
            .properties
            .read()
            .await
            .get(property_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn compare_and_swap_schedule(
        &self,
        tenant_id: &str,
        schedule_id: &str,
        expected_version: u64,
        update: &ScheduleUpdate,
        stamp: HistoryStamp,
    ) -> StoreResult<CasOutcome> {
        self.ensure_available()?;
        let mut schedules = self.schedules.write().await;

        let schedule = match schedules.get_mut(schedule_id) {
            Some(s) if s.tenant_id == tenant_id => s,
            _ => return Ok(CasOutcome::Missing),
        };

        if schedule.lock_version != expected_version {
            return Ok(CasOutcome::VersionMismatch {
                current: schedule.lock_version,
            });
        }

        let from_status = schedule.status;
        update.apply(schedule);
        schedule.lock_version += 1;
        schedule.history.push(HistoryEntry {
            actor: stamp.actor,
            at: stamp.at,
            from_status,
            to_status: schedule.status,
            version: schedule.lock_version,
            context: stamp.context,
        });

        Ok(CasOutcome::Applied(schedule.clone()))
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append(&self, entry: AuditLogEntry) -> StoreResult<()> {
        self.ensure_available()?;
        self.audit.write().await.push(entry);
        Ok(())
    }
}
