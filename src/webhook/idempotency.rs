//! Idempotency ledger for external events.
//!
//! A delivery is claimed with one insert-if-absent. Only the caller whose
//! insert succeeds may run side effects; everyone else sees a duplicate. If
//! the ledger cannot be written the caller gets a retryable error and must
//! not proceed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::error::{GuardError, GuardResult};
use crate::model::IdempotencyRecord;
use crate::store::{IdempotencyStore, LedgerInsert, StoreError};

/// Default retention of ledger records
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Result of claiming an event id.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerClaim {
    /// First sighting; the caller owns processing
    New,
    /// Seen before; skip side effects
    Duplicate(IdempotencyRecord),
}

impl LedgerClaim {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

/// SHA-256 hex of the raw payload.
pub fn payload_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// `true` when the event has not been seen before and the caller may
    /// process it.
    pub async fn check_idempotency(
        &self,
        event_id: &str,
        event_type: &str,
        provider: &str,
        payload: &[u8],
    ) -> GuardResult<bool> {
        Ok(self
            .claim(event_id, event_type, provider, payload, Utc::now())
            .await?
            .is_new())
    }

    pub async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        provider: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> GuardResult<LedgerClaim> {
        let record = IdempotencyRecord {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            provider: provider.to_string(),
            payload_hash: payload_hash(payload),
            first_seen_at: now,
            processed: false,
            expires_at: self.expiry_from(now),
        };
        let incoming_hash = record.payload_hash.clone();

        match self
            .store
            .insert_if_absent(record, now)
            .await
            .map_err(|e| unavailable(e, provider, event_id))?
        {
            LedgerInsert::Inserted => Ok(LedgerClaim::New),
            LedgerInsert::Duplicate(existing) => {
                if existing.payload_hash != incoming_hash {
                    warn!(
                        provider,
                        event_id,
                        "Duplicate event id delivered with a different payload"
                    );
                }
                Ok(LedgerClaim::Duplicate(existing))
            }
        }
    }

    /// `now + ttl`, saturating at the latest representable instant.
    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Mark a claimed event as fully processed.
    pub async fn complete(&self, provider: &str, event_id: &str) -> GuardResult<()> {
        self.store
            .mark_processed(provider, event_id)
            .await
            .map_err(|e| unavailable(e, provider, event_id))
    }

    /// Give up a claim whose processing failed so a retry can run it.
    pub async fn release(&self, provider: &str, event_id: &str) -> GuardResult<bool> {
        self.store
            .release(provider, event_id)
            .await
            .map_err(|e| unavailable(e, provider, event_id))
    }

    pub async fn find(&self, provider: &str, event_id: &str) -> GuardResult<Option<IdempotencyRecord>> {
        Ok(self.store.find_record(provider, event_id).await?)
    }

    /// Drop records past their retention.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> GuardResult<usize> {
        let purged = self.store.purge_expired(now).await?;
        if purged > 0 {
            debug!(purged, "Expired idempotency records dropped");
        }
        Ok(purged)
    }
}

fn unavailable(err: StoreError, provider: &str, event_id: &str) -> GuardError {
    error!(provider, event_id, error = %err, "Idempotency ledger write failed");
    GuardError::Unavailable("idempotency ledger".to_string())
}
