//! Resource authorization engine.
//!
//! Every decision follows the same three steps:
//!
//! 1. Load the resource scoped to the caller's tenant. A resource in another
//!    tenant is indistinguishable from one that does not exist.
//! 2. Check the role holds the action for the resource type.
//! 3. Check ownership. Admins may bypass this step; the bypass is flagged on
//!    the audit entry.
//!
//! Denials always surface as the same generic `Forbidden`, whether the
//! resource is missing, foreign or simply not the caller's.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use super::audit::{AuditLogEntry, AuditTrail};
use crate::context::{Role, SecurityContext};
use crate::error::{GuardError, GuardResult};
use crate::model::{Property, Schedule};
use crate::store::ResourceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Schedule,
    Property,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schedule => "schedule",
            Self::Property => "property",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Update,
    Transition,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Update => "update",
            Self::Transition => "transition",
            Self::Delete => "delete",
        })
    }
}

/// Role/permission matrix.
pub fn role_permits(role: Role, resource_type: ResourceType, action: Action) -> bool {
    use Action::*;
    match (role, resource_type) {
        (Role::Admin, _) => true,
        (Role::Manager, ResourceType::Schedule) => matches!(action, Read | Update | Transition),
        (Role::Manager, ResourceType::Property) => matches!(action, Read | Update),
        (Role::Cleaner, ResourceType::Schedule) => matches!(action, Read | Transition),
        (Role::Cleaner, ResourceType::Property) => matches!(action, Read),
    }
}

/// A resource loaded by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessibleResource {
    Schedule(Schedule),
    Property(Property),
}

impl AccessibleResource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Schedule(_) => ResourceType::Schedule,
            Self::Property(_) => ResourceType::Property,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Schedule(s) => &s.id,
            Self::Property(p) => &p.id,
        }
    }

    pub fn to_json(&self) -> GuardResult<Value> {
        let value = match self {
            Self::Schedule(s) => serde_json::to_value(s),
            Self::Property(p) => serde_json::to_value(p),
        };
        value.map_err(|e| GuardError::internal(format!("failed to serialize resource: {e}")))
    }

    /// Whether the caller owns this resource within the tenant.
    fn is_owned_by(&self, ctx: &SecurityContext, role: Role) -> bool {
        let user_id = ctx.user_id();
        let member = ctx.team_member_id();
        match (self, role) {
            (Self::Schedule(s), Role::Cleaner) => {
                member.is_some() && s.assigned_team_member_id.as_deref() == member
            }
            (Self::Property(p), Role::Cleaner) => {
                member.is_some_and(|m| p.team_member_ids.iter().any(|id| id == m))
            }
            (Self::Schedule(s), _) => user_id == Some(s.owner_user_id.as_str()),
            (Self::Property(p), _) => user_id == Some(p.owner_user_id.as_str()),
        }
    }
}

/// Outcome of one access check.
#[derive(Debug, Clone)]
pub struct ResourceAccessResult {
    pub allowed: bool,
    pub resource: Option<AccessibleResource>,
    pub error: Option<GuardError>,
    /// Admin bypassed ownership
    pub elevated_override: bool,
    /// Internal reason for a denial, recorded in the audit trail only
    pub reason: Option<&'static str>,
}

impl ResourceAccessResult {
    fn allow(resource: AccessibleResource, elevated_override: bool) -> Self {
        Self {
            allowed: true,
            resource: Some(resource),
            error: None,
            elevated_override,
            reason: None,
        }
    }

    fn deny(error: GuardError, reason: &'static str) -> Self {
        Self {
            allowed: false,
            resource: None,
            error: Some(error),
            elevated_override: false,
            reason: Some(reason),
        }
    }

    /// Whether this result is a decision (as opposed to an infrastructure
    /// failure that prevented one).
    pub fn is_decision(&self) -> bool {
        match &self.error {
            None => true,
            Some(err) => matches!(
                err,
                GuardError::Authorization | GuardError::Authentication(_)
            ),
        }
    }

    pub fn into_result(self) -> GuardResult<AccessibleResource> {
        match (self.resource, self.error) {
            (Some(resource), None) if self.allowed => Ok(resource),
            (_, Some(err)) => Err(err),
            _ => Err(GuardError::Authorization),
        }
    }
}

/// Central authorization engine.
#[derive(Clone)]
pub struct AuthorizationEngine {
    resources: Arc<dyn ResourceStore>,
    audit: AuditTrail,
}

impl AuthorizationEngine {
    pub fn new(resources: Arc<dyn ResourceStore>, audit: AuditTrail) -> Self {
        Self { resources, audit }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Decide whether the caller may perform `action` on the resource. Does
    /// not write to the audit trail; see [`authorize`](Self::authorize).
    pub async fn check_resource_access(
        &self,
        ctx: &SecurityContext,
        resource_type: ResourceType,
        resource_id: &str,
        action: Action,
    ) -> ResourceAccessResult {
        let (tenant_id, role) = match ctx.require_identity() {
            Ok(identity) => identity,
            Err(err) => return ResourceAccessResult::deny(err, "unauthenticated"),
        };

        if !role_permits(role, resource_type, action) {
            return ResourceAccessResult::deny(GuardError::Authorization, "role");
        }

        let loaded = match resource_type {
            ResourceType::Schedule => self
                .resources
                .find_schedule_scoped(tenant_id, resource_id)
                .await
                .map(|s| s.map(AccessibleResource::Schedule)),
            ResourceType::Property => self
                .resources
                .find_property_scoped(tenant_id, resource_id)
                .await
                .map(|p| p.map(AccessibleResource::Property)),
        };

        let resource = match loaded {
            Ok(Some(resource)) => resource,
            Ok(None) => return ResourceAccessResult::deny(GuardError::Authorization, "not_found"),
            Err(err) => {
                error!(
                    request_id = ctx.request_id(),
                    resource_type = %resource_type,
                    error = %err,
                    "Resource lookup failed"
                );
                return ResourceAccessResult::deny(GuardError::Store(err), "store");
            }
        };

        if resource.is_owned_by(ctx, role) {
            ResourceAccessResult::allow(resource, false)
        } else if role.is_elevated() {
            ResourceAccessResult::allow(resource, true)
        } else {
            ResourceAccessResult::deny(GuardError::Authorization, "ownership")
        }
    }

    /// Check access and write exactly one audit entry for the decision.
    pub async fn authorize(
        &self,
        ctx: &SecurityContext,
        resource_type: ResourceType,
        resource_id: &str,
        action: Action,
    ) -> GuardResult<AccessibleResource> {
        let result = self
            .check_resource_access(ctx, resource_type, resource_id, action)
            .await;

        if result.is_decision() {
            let mut entry =
                AuditLogEntry::new(ctx, resource_type, resource_id, action, result.allowed)
                    .elevated(result.elevated_override);
            if let Some(reason) = result.reason {
                entry = entry.reason(reason);
            }
            self.audit.record(entry).await?;
        }

        result.into_result()
    }

    pub async fn authorize_schedule(
        &self,
        ctx: &SecurityContext,
        schedule_id: &str,
        action: Action,
    ) -> GuardResult<Schedule> {
        match self
            .authorize(ctx, ResourceType::Schedule, schedule_id, action)
            .await?
        {
            AccessibleResource::Schedule(s) => Ok(s),
            AccessibleResource::Property(_) => Err(GuardError::internal("resource type mismatch")),
        }
    }

    pub async fn authorize_property(
        &self,
        ctx: &SecurityContext,
        property_id: &str,
        action: Action,
    ) -> GuardResult<Property> {
        match self
            .authorize(ctx, ResourceType::Property, property_id, action)
            .await?
        {
            AccessibleResource::Property(p) => Ok(p),
            AccessibleResource::Schedule(_) => Err(GuardError::internal("resource type mismatch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScheduleStatus, Session};
    use crate::store::InMemoryStore;
    use chrono::{Duration, Utc};

    fn ctx(user: &str, role: Role, member: Option<&str>, tenant: &str) -> SecurityContext {
        SecurityContext::authenticated(
            "req-1",
            &Session {
                user_id: user.to_string(),
                role,
                team_member_id: member.map(str::to_string),
                tenant_id: tenant.to_string(),
                expires_at: Utc::now() + Duration::hours(1),
            },
        )
    }

    fn schedule() -> Schedule {
        Schedule {
            id: "sch-1".to_string(),
            tenant_id: "t-1".to_string(),
            property_id: "p-1".to_string(),
            owner_user_id: "u-manager".to_string(),
            assigned_team_member_id: Some("tm-1".to_string()),
            status: ScheduleStatus::Released,
            lock_version: 1,
            checkout_at: Utc::now(),
            notes: None,
            guest_name: None,
            guest_email: None,
            guest_phone: None,
            price_cents: None,
            door_code: None,
            history: Vec::new(),
        }
    }

    fn property() -> Property {
        Property {
            id: "p-1".to_string(),
            tenant_id: "t-1".to_string(),
            owner_user_id: "u-manager".to_string(),
            name: "Beach house".to_string(),
            address: None,
            team_member_ids: vec!["tm-1".to_string()],
            access_instructions: None,
            owner_document: None,
            owner_phone: None,
            ical_url: None,
        }
    }

    async fn engine() -> (AuthorizationEngine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.insert_schedule(schedule()).await;
        store.insert_property(property()).await;
        let engine = AuthorizationEngine::new(store.clone(), AuditTrail::new(store.clone()));
        (engine, store)
    }

    #[test]
    fn test_permission_matrix() {
        assert!(role_permits(Role::Admin, ResourceType::Property, Action::Delete));
        assert!(role_permits(Role::Manager, ResourceType::Schedule, Action::Transition));
        assert!(!role_permits(Role::Manager, ResourceType::Schedule, Action::Delete));
        assert!(!role_permits(Role::Manager, ResourceType::Property, Action::Transition));
        assert!(role_permits(Role::Cleaner, ResourceType::Schedule, Action::Transition));
        assert!(!role_permits(Role::Cleaner, ResourceType::Schedule, Action::Update));
        assert!(!role_permits(Role::Cleaner, ResourceType::Property, Action::Update));
    }

    #[tokio::test]
    async fn test_owner_and_assignee_allowed() {
        let (engine, _) = engine().await;

        let manager = ctx("u-manager", Role::Manager, None, "t-1");
        let r = engine
            .check_resource_access(&manager, ResourceType::Schedule, "sch-1", Action::Update)
            .await;
        assert!(r.allowed);
        assert!(!r.elevated_override);

        let cleaner = ctx("u-cleaner", Role::Cleaner, Some("tm-1"), "t-1");
        let r = engine
            .check_resource_access(&cleaner, ResourceType::Property, "p-1", Action::Read)
            .await;
        assert!(r.allowed);
    }

    #[tokio::test]
    async fn test_non_owner_denied_generically() {
        let (engine, _) = engine().await;

        let other_manager = ctx("u-other", Role::Manager, None, "t-1");
        let r = engine
            .check_resource_access(&other_manager, ResourceType::Schedule, "sch-1", Action::Read)
            .await;
        assert!(!r.allowed);
        assert_eq!(r.error.unwrap().public_message(), "Forbidden");

        let other_cleaner = ctx("u-c2", Role::Cleaner, Some("tm-2"), "t-1");
        let r = engine
            .check_resource_access(&other_cleaner, ResourceType::Schedule, "sch-1", Action::Transition)
            .await;
        assert!(!r.allowed);
    }

    #[tokio::test]
    async fn test_cleaner_without_team_member_id_denied() {
        let (engine, _) = engine().await;
        let cleaner = ctx("u-cleaner", Role::Cleaner, None, "t-1");
        let r = engine
            .check_resource_access(&cleaner, ResourceType::Schedule, "sch-1", Action::Read)
            .await;
        assert!(!r.allowed);
    }

    #[tokio::test]
    async fn test_cross_tenant_looks_like_missing() {
        let (engine, _) = engine().await;
        let admin_elsewhere = ctx("u-admin", Role::Admin, None, "t-2");

        let foreign = engine
            .check_resource_access(&admin_elsewhere, ResourceType::Schedule, "sch-1", Action::Read)
            .await;
        let missing = engine
            .check_resource_access(&admin_elsewhere, ResourceType::Schedule, "nope", Action::Read)
            .await;

        assert!(!foreign.allowed && !missing.allowed);
        assert_eq!(
            foreign.error.unwrap().public_message(),
            missing.error.unwrap().public_message()
        );
    }

    #[tokio::test]
    async fn test_admin_override_is_audited() {
        let (engine, store) = engine().await;
        let admin = ctx("u-admin", Role::Admin, None, "t-1");

        let schedule = engine
            .authorize_schedule(&admin, "sch-1", Action::Transition)
            .await
            .unwrap();
        assert_eq!(schedule.id, "sch-1");

        let entries = store.audit_entries().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].allowed);
        assert!(entries[0].elevated_override);
    }

    #[tokio::test]
    async fn test_every_decision_audited_once() {
        let (engine, store) = engine().await;
        let stranger = ctx("u-x", Role::Manager, None, "t-1");

        let err = engine
            .authorize(&stranger, ResourceType::Schedule, "sch-1", Action::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Authorization));

        let role_denied = ctx("u-cleaner", Role::Cleaner, Some("tm-1"), "t-1");
        let _ = engine
            .authorize(&role_denied, ResourceType::Schedule, "sch-1", Action::Delete)
            .await;

        let entries = store.audit_entries().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| !e.allowed));
        assert_eq!(entries[0].reason.as_deref(), Some("ownership"));
        assert_eq!(entries[1].reason.as_deref(), Some("role"));
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_denial() {
        let (engine, store) = engine().await;
        store.set_unavailable(true);
        let admin = ctx("u-admin", Role::Admin, None, "t-1");

        let err = engine
            .authorize(&admin, ResourceType::Schedule, "sch-1", Action::Read)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
