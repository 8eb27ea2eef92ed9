//! Optimistic concurrency updater.
//!
//! A mutation presents the `lock_version` it last read. The store applies it
//! and bumps the version in one atomic compare-and-swap; a stale version is a
//! no-op reported as [`GuardError::VersionConflict`]. Of N concurrent updates
//! presenting the same version, exactly one wins.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::context::SecurityContext;
use crate::error::{GuardError, GuardResult};
use crate::model::{HistoryStamp, Schedule, ScheduleUpdate};
use crate::store::{CasOutcome, ResourceStore};

/// Outcome of [`OptimisticUpdater::update_with_lock`].
#[derive(Debug, Clone)]
pub struct LockedUpdateResult {
    pub success: bool,
    pub data: Option<Schedule>,
    pub error: Option<GuardError>,
}

impl LockedUpdateResult {
    fn applied(schedule: Schedule) -> Self {
        Self {
            success: true,
            data: Some(schedule),
            error: None,
        }
    }

    fn failed(error: GuardError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> GuardResult<Schedule> {
        match (self.data, self.error) {
            (Some(schedule), None) => Ok(schedule),
            (_, Some(err)) => Err(err),
            (None, None) => Err(GuardError::internal("update produced no result")),
        }
    }
}

#[derive(Clone)]
pub struct OptimisticUpdater {
    resources: Arc<dyn ResourceStore>,
}

impl OptimisticUpdater {
    pub fn new(resources: Arc<dyn ResourceStore>) -> Self {
        Self { resources }
    }

    /// Apply `updates` to the schedule if its stored version still equals
    /// `expected_version`. `context` is stored on the history entry.
    pub async fn update_with_lock(
        &self,
        ctx: &SecurityContext,
        schedule_id: &str,
        updates: &ScheduleUpdate,
        expected_version: u64,
        context: Value,
    ) -> LockedUpdateResult {
        let tenant_id = match ctx.require_identity() {
            Ok((tenant_id, _)) => tenant_id,
            Err(err) => return LockedUpdateResult::failed(err),
        };

        if updates.is_empty() {
            return LockedUpdateResult::failed(GuardError::validation("Nothing to update"));
        }

        let stamp = HistoryStamp {
            actor: ctx.subject().to_string(),
            at: Utc::now(),
            context,
        };

        let outcome = self
            .resources
            .compare_and_swap_schedule(tenant_id, schedule_id, expected_version, updates, stamp)
            .await;

        match outcome {
            Ok(CasOutcome::Applied(schedule)) => {
                debug!(
                    request_id = ctx.request_id(),
                    schedule_id,
                    version = schedule.lock_version,
                    "Schedule updated"
                );
                LockedUpdateResult::applied(schedule)
            }
            Ok(CasOutcome::VersionMismatch { current }) => {
                debug!(
                    request_id = ctx.request_id(),
                    schedule_id,
                    expected_version,
                    current,
                    "Lost optimistic update race"
                );
                LockedUpdateResult::failed(GuardError::VersionConflict {
                    expected: expected_version,
                    current: Some(current),
                })
            }
            Ok(CasOutcome::Missing) => LockedUpdateResult::failed(GuardError::Authorization),
            Err(err) => LockedUpdateResult::failed(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Role;
    use crate::model::{ScheduleStatus, Session};
    use crate::store::InMemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn ctx(tenant: &str) -> SecurityContext {
        SecurityContext::authenticated(
            "req-1",
            &Session {
                user_id: "u-admin".to_string(),
                role: Role::Admin,
                team_member_id: None,
                tenant_id: tenant.to_string(),
                expires_at: Utc::now() + Duration::hours(1),
            },
        )
    }

    async fn updater() -> (OptimisticUpdater, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_schedule(Schedule {
                id: "sch-1".to_string(),
                tenant_id: "t-1".to_string(),
                property_id: "p-1".to_string(),
                owner_user_id: "u-manager".to_string(),
                assigned_team_member_id: None,
                status: ScheduleStatus::Waiting,
                lock_version: 1,
                checkout_at: Utc::now(),
                notes: None,
                guest_name: None,
                guest_email: None,
                guest_phone: None,
                price_cents: None,
                door_code: None,
                history: Vec::new(),
            })
            .await;
        (OptimisticUpdater::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_appends_history() {
        let (updater, _) = updater().await;

        let result = updater
            .update_with_lock(
                &ctx("t-1"),
                "sch-1",
                &ScheduleUpdate::status(ScheduleStatus::Released),
                1,
                json!({"reason": "guests left"}),
            )
            .await;

        assert!(result.success);
        let schedule = result.into_result().unwrap();
        assert_eq!(schedule.lock_version, 2);
        assert_eq!(schedule.status, ScheduleStatus::Released);
        assert_eq!(schedule.history[0].actor, "u-admin");
        assert_eq!(schedule.history[0].context["reason"], "guests left");
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict_and_no_op() {
        let (updater, store) = updater().await;

        let result = updater
            .update_with_lock(
                &ctx("t-1"),
                "sch-1",
                &ScheduleUpdate::status(ScheduleStatus::Released),
                7,
                Value::Null,
            )
            .await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(GuardError::VersionConflict {
                expected: 7,
                current: Some(1)
            })
        ));
        let stored = store.schedule_unscoped("sch-1").await.unwrap();
        assert_eq!(stored.lock_version, 1);
        assert_eq!(stored.status, ScheduleStatus::Waiting);
    }

    #[tokio::test]
    async fn test_foreign_tenant_cannot_update() {
        let (updater, _) = updater().await;
        let result = updater
            .update_with_lock(
                &ctx("t-2"),
                "sch-1",
                &ScheduleUpdate::status(ScheduleStatus::Released),
                1,
                Value::Null,
            )
            .await;
        assert!(matches!(result.error, Some(GuardError::Authorization)));
    }

    #[tokio::test]
    async fn test_empty_update_rejected() {
        let (updater, _) = updater().await;
        let result = updater
            .update_with_lock(&ctx("t-1"), "sch-1", &ScheduleUpdate::default(), 1, Value::Null)
            .await;
        assert!(matches!(result.error, Some(GuardError::Validation(_))));
    }
}
