//! Append-only audit trail of authorization decisions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::access::{Action, ResourceType};
use crate::context::SecurityContext;
use crate::error::GuardResult;
use crate::store::AuditStore;

/// One authorization decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub request_id: String,
    /// User id, or `anonymous`
    pub subject: String,
    pub tenant_id: Option<String>,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub action: Action,
    pub allowed: bool,
    /// Admin bypassed an ownership check
    pub elevated_override: bool,
    /// Short machine reason for denials, e.g. `ownership` or `transition:waiting->completed`
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        ctx: &SecurityContext,
        resource_type: ResourceType,
        resource_id: &str,
        action: Action,
        allowed: bool,
    ) -> Self {
        Self {
            request_id: ctx.request_id().to_string(),
            subject: ctx.subject().to_string(),
            tenant_id: ctx.tenant_id().map(str::to_string),
            resource_type,
            resource_id: resource_id.to_string(),
            action,
            allowed,
            elevated_override: false,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated_override = elevated;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Writes entries to the audit store and mirrors them to the
/// `turnover_guard::audit` tracing target.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append one entry. A failed write fails the request: a decision that
    /// cannot be recorded is not acted on.
    pub async fn record(&self, entry: AuditLogEntry) -> GuardResult<()> {
        if entry.allowed {
            info!(
                target: "turnover_guard::audit",
                request_id = %entry.request_id,
                subject = %entry.subject,
                resource_type = %entry.resource_type,
                resource_id = %entry.resource_id,
                action = %entry.action,
                elevated_override = entry.elevated_override,
                "access granted"
            );
        } else {
            warn!(
                target: "turnover_guard::audit",
                request_id = %entry.request_id,
                subject = %entry.subject,
                resource_type = %entry.resource_type,
                resource_id = %entry.resource_id,
                action = %entry.action,
                reason = entry.reason.as_deref().unwrap_or("-"),
                "access denied"
            );
        }

        self.store.append(entry).await?;
        Ok(())
    }
}
