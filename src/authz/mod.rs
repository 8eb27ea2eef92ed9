//! Resource authorization, the schedule state machine and the audit trail.

pub mod access;
pub mod audit;
pub mod transitions;

pub use access::{
    role_permits, AccessibleResource, Action, AuthorizationEngine, ResourceAccessResult,
    ResourceType,
};
pub use audit::{AuditLogEntry, AuditTrail};
pub use transitions::{
    allowed_targets, find_transition, validate_state_transition, StateTransition,
    TransitionValidation, TRANSITIONS,
};
