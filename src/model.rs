//! Domain records owned by the persistence layer.
//!
//! Everything here is plain data: schedules and properties that the
//! authorization engine guards, the sessions the auth validator resolves,
//! and the ledger/bucket records behind idempotency and rate limiting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Role;

// =============================================================================
// Schedules
// =============================================================================

/// Lifecycle of a cleaning schedule. Edges only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Created, not yet handed to the cleaning team
    Waiting,
    /// Released to the team; guests have left
    Released,
    /// Cleaning in progress
    Cleaning,
    /// Cleaning finished
    Completed,
}

impl ScheduleStatus {
    /// All states in lifecycle order.
    pub const ALL: [ScheduleStatus; 4] = [
        ScheduleStatus::Waiting,
        ScheduleStatus::Released,
        ScheduleStatus::Cleaning,
        ScheduleStatus::Completed,
    ];

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Released => "released",
            Self::Cleaning => "cleaning",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "released" => Ok(Self::Released),
            "cleaning" => Ok(Self::Cleaning),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A cleaning job for one property turnover.
///
/// `lock_version` is the optimistic-lock token: it starts at 1 and is bumped
/// by the store on every successful conditional update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub tenant_id: String,
    pub property_id: String,
    /// Manager responsible for the property
    pub owner_user_id: String,
    #[serde(default)]
    pub assigned_team_member_id: Option<String>,
    pub status: ScheduleStatus,
    pub lock_version: u64,
    pub checkout_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub guest_email: Option<String>,
    #[serde(default)]
    pub guest_phone: Option<String>,
    /// Price paid to the cleaning team, in cents
    #[serde(default)]
    pub price_cents: Option<i64>,
    #[serde(default)]
    pub door_code: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// One applied mutation of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub actor: String,
    pub at: DateTime<Utc>,
    pub from_status: ScheduleStatus,
    pub to_status: ScheduleStatus,
    /// Resulting lock version
    pub version: u64,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Who performed a mutation and why; turned into a [`HistoryEntry`] by the
/// store inside the same atomic section that applies the update.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryStamp {
    pub actor: String,
    pub at: DateTime<Utc>,
    pub context: serde_json::Value,
}

/// Partial update applied by the optimistic updater.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub status: Option<ScheduleStatus>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assigned_team_member_id: Option<String>,
}

impl ScheduleUpdate {
    /// Update that only moves the status.
    pub fn status(status: ScheduleStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.notes.is_none() && self.assigned_team_member_id.is_none()
    }

    /// Apply the update in place. Does not touch `lock_version`.
    pub fn apply(&self, schedule: &mut Schedule) {
        if let Some(status) = self.status {
            schedule.status = status;
        }
        if let Some(notes) = &self.notes {
            schedule.notes = Some(notes.clone());
        }
        if let Some(member) = &self.assigned_team_member_id {
            schedule.assigned_team_member_id = Some(member.clone());
        }
    }
}

// =============================================================================
// Properties
// =============================================================================

/// A rental unit managed by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: String,
    pub tenant_id: String,
    pub owner_user_id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    /// Team members allowed to see the property
    #[serde(default)]
    pub team_member_ids: Vec<String>,
    #[serde(default)]
    pub access_instructions: Option<String>,
    #[serde(default)]
    pub owner_document: Option<String>,
    #[serde(default)]
    pub owner_phone: Option<String>,
    #[serde(default)]
    pub ical_url: Option<String>,
}

// =============================================================================
// Sessions, ledger and buckets
// =============================================================================

/// Resolved bearer session. Tokens are stored hashed; see
/// [`crate::security::auth::hash_token`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub team_member_id: Option<String>,
    pub tenant_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Record of an external event that has been seen at least once.
///
/// `processed` is the only field that changes after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub event_type: String,
    pub provider: String,
    /// Hex SHA-256 of the raw payload
    pub payload_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub processed: bool,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Fixed-window request counter for one caller key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub key: String,
    /// Window start, Unix milliseconds
    pub window_start: i64,
    pub count: u32,
    pub limit: u32,
    pub window_ms: u64,
}
