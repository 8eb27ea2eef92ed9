//! Per-request security context.
//!
//! A [`SecurityContext`] is built exactly once per request by the secure
//! handler wrapper, passed by reference through the pipeline and dropped when
//! the response is written. It has no setters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthFailure, GuardError, GuardResult};
use crate::model::Session;

/// Caller role. Closed set; every permission decision matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Cleaner,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Manager, Role::Cleaner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Cleaner => "cleaner",
        }
    }

    /// Admins may override ownership checks (always audited).
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "cleaner" => Ok(Self::Cleaner),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Generate a fresh request identifier.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identity of the caller for the lifetime of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    request_id: String,
    user_id: Option<String>,
    role: Option<Role>,
    team_member_id: Option<String>,
    tenant_id: Option<String>,
}

impl SecurityContext {
    /// Context for an endpoint that does not require authentication.
    pub fn anonymous(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
            role: None,
            team_member_id: None,
            tenant_id: None,
        }
    }

    /// Context for a caller whose bearer token resolved to `session`.
    pub fn authenticated(request_id: impl Into<String>, session: &Session) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: Some(session.user_id.clone()),
            role: Some(session.role),
            team_member_id: session.team_member_id.clone(),
            tenant_id: Some(session.tenant_id.clone()),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn team_member_id(&self) -> Option<&str> {
        self.team_member_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Subject recorded in audit entries and logs.
    pub fn subject(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }

    /// Tenant and role of an authenticated caller.
    pub fn require_identity(&self) -> GuardResult<(&str, Role)> {
        match (self.tenant_id.as_deref(), self.role) {
            (Some(tenant), Some(role)) => Ok((tenant, role)),
            _ => Err(GuardError::Authentication(AuthFailure::MissingHeader)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn session() -> Session {
        Session {
            user_id: "u-1".to_string(),
            role: Role::Cleaner,
            team_member_id: Some("tm-1".to_string()),
            tenant_id: "t-1".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_authenticated_context_carries_session() {
        let ctx = SecurityContext::authenticated("req-1", &session());
        assert_eq!(ctx.request_id(), "req-1");
        assert_eq!(ctx.user_id(), Some("u-1"));
        assert_eq!(ctx.role(), Some(Role::Cleaner));
        assert_eq!(ctx.team_member_id(), Some("tm-1"));
        assert_eq!(ctx.tenant_id(), Some("t-1"));
        assert_eq!(ctx.subject(), "u-1");
        assert!(ctx.require_identity().is_ok());
    }

    #[test]
    fn test_anonymous_context_has_no_identity() {
        let ctx = SecurityContext::anonymous("req-2");
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.subject(), "anonymous");
        assert!(matches!(
            ctx.require_identity(),
            Err(GuardError::Authentication(_))
        ));
    }

    #[test]
    fn test_role_parsing() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("owner".parse::<Role>().is_err());
        assert!(Role::Admin.is_elevated());
        assert!(!Role::Manager.is_elevated());
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
    }
}
