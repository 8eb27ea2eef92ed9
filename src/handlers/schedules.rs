//! Schedule and property endpoints.
//!
//! - `PATCH /api/schedules/status` - move a schedule along its lifecycle
//! - `GET /api/schedules/:id` - role-filtered schedule
//! - `GET /api/properties/:id` - role-filtered property
//!
//! Every route goes through the secure handler wrapper; the business logic
//! lives in the [`SecuredHandler`] implementations below.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::authz::{
    validate_state_transition, Action, AuditLogEntry, AuthorizationEngine, ResourceType,
};
use crate::context::SecurityContext;
use crate::error::{GuardError, GuardResult};
use crate::locking::OptimisticUpdater;
use crate::model::{ScheduleStatus, ScheduleUpdate};
use crate::security::masking::filter_sensitive_data;
use crate::security::sanitize::check_text;
use crate::security::wrapper::{GuardRequest, SecuredHandler, ValidatedRequest};
use crate::server::AppState;

/// Body of `PATCH /api/schedules/status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStatusRequest {
    pub id: String,
    pub status: ScheduleStatus,
    pub expected_version: u64,
}

impl ChangeStatusRequest {
    fn from_body(body: &Value) -> GuardResult<Self> {
        let request: Self = serde_json::from_value(body.clone()).map_err(|_| {
            GuardError::validation(
                "Expected {id, status, expectedVersion} with status one of \
                 waiting, released, cleaning, completed",
            )
        })?;
        if request.id.trim().is_empty() {
            return Err(GuardError::validation("id is required"));
        }
        if request.expected_version == 0 {
            return Err(GuardError::validation("expectedVersion must be >= 1"));
        }
        Ok(request)
    }
}

/// Schedule state change: access check, version check, transition check,
/// conditional update.
#[derive(Clone)]
pub struct ChangeStatusHandler {
    engine: AuthorizationEngine,
    updater: OptimisticUpdater,
}

impl ChangeStatusHandler {
    pub fn new(engine: AuthorizationEngine, updater: OptimisticUpdater) -> Self {
        Self { engine, updater }
    }
}

#[async_trait]
impl SecuredHandler for ChangeStatusHandler {
    async fn handle(&self, ctx: &SecurityContext, request: ValidatedRequest) -> GuardResult<Value> {
        let body = ChangeStatusRequest::from_body(request.json()?)?;
        let (_, role) = ctx.require_identity()?;

        let schedule = self
            .engine
            .authorize_schedule(ctx, &body.id, Action::Transition)
            .await?;

        if schedule.lock_version != body.expected_version {
            return Err(GuardError::VersionConflict {
                expected: body.expected_version,
                current: Some(schedule.lock_version),
            });
        }

        let (from, to) = (schedule.status, body.status);
        let validation = validate_state_transition(ResourceType::Schedule, from, to, role);
        self.engine
            .audit()
            .record(
                AuditLogEntry::new(
                    ctx,
                    ResourceType::Schedule,
                    &schedule.id,
                    Action::Transition,
                    validation.valid,
                )
                .reason(format!("transition:{from}->{to}")),
            )
            .await?;
        validation.into_result()?;

        let updated = self
            .updater
            .update_with_lock(
                ctx,
                &schedule.id,
                &ScheduleUpdate::status(to),
                body.expected_version,
                json!({ "requestId": ctx.request_id(), "role": role }),
            )
            .await
            .into_result()?;

        info!(
            request_id = ctx.request_id(),
            schedule_id = %updated.id,
            from = %from,
            to = %to,
            version = updated.lock_version,
            "Schedule status changed"
        );

        let value = serde_json::to_value(&updated)
            .map_err(|e| GuardError::internal(format!("failed to serialize schedule: {e}")))?;
        Ok(filter_sensitive_data(value, role, ResourceType::Schedule))
    }
}

/// Role-filtered read of one schedule or property.
#[derive(Clone)]
pub struct ReadResourceHandler {
    engine: AuthorizationEngine,
    resource_type: ResourceType,
}

impl ReadResourceHandler {
    pub fn new(engine: AuthorizationEngine, resource_type: ResourceType) -> Self {
        Self {
            engine,
            resource_type,
        }
    }
}

#[async_trait]
impl SecuredHandler for ReadResourceHandler {
    async fn handle(&self, ctx: &SecurityContext, request: ValidatedRequest) -> GuardResult<Value> {
        let id = request.param("id")?;
        check_text(id)?;
        let (_, role) = ctx.require_identity()?;

        let resource = self
            .engine
            .authorize(ctx, self.resource_type, id, Action::Read)
            .await?;
        Ok(filter_sensitive_data(
            resource.to_json()?,
            role,
            self.resource_type,
        ))
    }
}

fn guard_request(
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> GuardRequest {
    GuardRequest::new(method, headers, body)
        .with_client_ip(connect.map(|ConnectInfo(addr)| addr.ip()))
}

/// `PATCH /api/schedules/status`
pub async fn change_schedule_status(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let endpoint = &state.endpoints.change_status;
    state
        .guard
        .run(
            &endpoint.policy,
            guard_request(method, headers, body, connect),
            &endpoint.handler,
        )
        .await
}

/// `GET /api/schedules/:id`
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let endpoint = &state.endpoints.read_schedule;
    let request = guard_request(method, headers, body, connect).with_param("id", id);
    state
        .guard
        .run(&endpoint.policy, request, &endpoint.handler)
        .await
}

/// `GET /api/properties/:id`
pub async fn get_property(
    State(state): State<AppState>,
    Path(id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let endpoint = &state.endpoints.read_property;
    let request = guard_request(method, headers, body, connect).with_param("id", id);
    state
        .guard
        .run(&endpoint.policy, request, &endpoint.handler)
        .await
}
