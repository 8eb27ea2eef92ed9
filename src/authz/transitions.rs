//! Schedule state machine.
//!
//! [`TRANSITIONS`] is the only place legal edges are declared. Edges move
//! strictly forward one step at a time; each carries the roles allowed to
//! take it. Ownership (for example "the assigned cleaner") is enforced by the
//! access check that precedes validation.

use crate::authz::access::ResourceType;
use crate::context::Role;
use crate::error::GuardError;
use crate::model::ScheduleStatus;

/// One legal edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub resource_type: ResourceType,
    pub from: ScheduleStatus,
    pub to: ScheduleStatus,
    pub allowed_roles: &'static [Role],
}

impl StateTransition {
    pub fn permits(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }
}

pub const TRANSITIONS: [StateTransition; 3] = [
    StateTransition {
        resource_type: ResourceType::Schedule,
        from: ScheduleStatus::Waiting,
        to: ScheduleStatus::Released,
        allowed_roles: &[Role::Manager, Role::Admin],
    },
    StateTransition {
        resource_type: ResourceType::Schedule,
        from: ScheduleStatus::Released,
        to: ScheduleStatus::Cleaning,
        allowed_roles: &[Role::Cleaner, Role::Admin],
    },
    StateTransition {
        resource_type: ResourceType::Schedule,
        from: ScheduleStatus::Cleaning,
        to: ScheduleStatus::Completed,
        allowed_roles: &[Role::Cleaner, Role::Admin],
    },
];

/// Result of validating a requested transition.
#[derive(Debug, Clone)]
pub struct TransitionValidation {
    pub valid: bool,
    /// `InvalidTransition` for a missing edge, `ForbiddenTransition` for a
    /// present edge the role may not take
    pub error: Option<GuardError>,
}

impl TransitionValidation {
    pub fn into_result(self) -> Result<(), GuardError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn find_transition(
    resource_type: ResourceType,
    from: ScheduleStatus,
    to: ScheduleStatus,
) -> Option<&'static StateTransition> {
    TRANSITIONS
        .iter()
        .find(|t| t.resource_type == resource_type && t.from == from && t.to == to)
}

pub fn validate_state_transition(
    resource_type: ResourceType,
    from: ScheduleStatus,
    to: ScheduleStatus,
    role: Role,
) -> TransitionValidation {
    let error = match find_transition(resource_type, from, to) {
        None => Some(GuardError::InvalidTransition { from, to }),
        Some(edge) if !edge.permits(role) => {
            Some(GuardError::ForbiddenTransition { from, to, role })
        }
        Some(_) => None,
    };

    TransitionValidation {
        valid: error.is_none(),
        error,
    }
}

/// States `role` may move a resource to from `from`.
pub fn allowed_targets(
    resource_type: ResourceType,
    from: ScheduleStatus,
    role: Role,
) -> Vec<ScheduleStatus> {
    TRANSITIONS
        .iter()
        .filter(|t| t.resource_type == resource_type && t.from == from && t.permits(role))
        .map(|t| t.to)
        .collect()
}
