//! Shared fixtures for the integration tests.
//!
//! One tenant (`t-1`) with a manager, a cleaner and an admin, plus a second
//! tenant (`t-2`) whose manager must never see `t-1` data.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tower::ServiceExt;

use turnover_guard::context::Role;
use turnover_guard::model::{Property, Schedule, ScheduleStatus, Session};
use turnover_guard::{router, AppState, GuardConfig, InMemoryStore};

pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub const MANAGER_TOKEN: &str = "tok-manager";
pub const CLEANER_TOKEN: &str = "tok-cleaner";
pub const ADMIN_TOKEN: &str = "tok-admin";
pub const OTHER_TENANT_TOKEN: &str = "tok-other-tenant";
pub const EXPIRED_TOKEN: &str = "tok-expired";

pub fn session(user_id: &str, role: Role, tenant_id: &str, team_member_id: Option<&str>) -> Session {
    Session {
        user_id: user_id.to_string(),
        role,
        team_member_id: team_member_id.map(str::to_string),
        tenant_id: tenant_id.to_string(),
        expires_at: Utc::now() + ChronoDuration::hours(1),
    }
}

pub fn schedule(id: &str, status: ScheduleStatus, version: u64) -> Schedule {
    Schedule {
        id: id.to_string(),
        tenant_id: "t-1".to_string(),
        property_id: "p-1".to_string(),
        owner_user_id: "u-manager".to_string(),
        assigned_team_member_id: Some("tm-1".to_string()),
        status,
        lock_version: version,
        checkout_at: Utc::now(),
        notes: Some("Extra towels".to_string()),
        guest_name: Some("Joana".to_string()),
        guest_email: Some("joana.guest@example.com".to_string()),
        guest_phone: Some("+55 11 91234-5678".to_string()),
        price_cents: Some(15_000),
        door_code: Some("4321".to_string()),
        history: Vec::new(),
    }
}

pub fn property() -> Property {
    Property {
        id: "p-1".to_string(),
        tenant_id: "t-1".to_string(),
        owner_user_id: "u-manager".to_string(),
        name: "Beach flat".to_string(),
        address: Some("Rua do Mar 10".to_string()),
        team_member_ids: vec!["tm-1".to_string()],
        access_instructions: Some("Lockbox by the gate".to_string()),
        owner_document: Some("123.456.789-09".to_string()),
        owner_phone: Some("+55 11 99876-5432".to_string()),
        ical_url: Some("https://calendar.example.com/p-1.ics".to_string()),
    }
}

/// Store with every fixture session, `p-1` and a `waiting` schedule `sch-1`.
pub async fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store
        .insert_session(MANAGER_TOKEN, session("u-manager", Role::Manager, "t-1", None))
        .await;
    store
        .insert_session(
            CLEANER_TOKEN,
            session("u-cleaner", Role::Cleaner, "t-1", Some("tm-1")),
        )
        .await;
    store
        .insert_session(ADMIN_TOKEN, session("u-admin", Role::Admin, "t-1", None))
        .await;
    store
        .insert_session(
            OTHER_TENANT_TOKEN,
            session("u-intruder", Role::Manager, "t-2", None),
        )
        .await;

    let mut expired = session("u-manager", Role::Manager, "t-1", None);
    expired.expires_at = Utc::now() - ChronoDuration::minutes(1);
    store.insert_session(EXPIRED_TOKEN, expired).await;

    store.insert_property(property()).await;
    store
        .insert_schedule(schedule("sch-1", ScheduleStatus::Waiting, 1))
        .await;
    store
}

pub fn config() -> GuardConfig {
    GuardConfig::new(WEBHOOK_SECRET).with_rate_limit(Duration::from_secs(3600), 100)
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
}

pub async fn app_with(config: GuardConfig) -> TestApp {
    let store = seeded_store().await;
    let state = AppState::new(config, store.clone()).expect("valid config");
    TestApp {
        app: router(state.clone()),
        state,
        store,
    }
}

pub async fn app() -> TestApp {
    app_with(config()).await
}

/// Response as seen by the client.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        self.send(request(Method::GET, uri, token, Body::empty())).await
    }

    pub async fn change_status(
        &self,
        token: &str,
        id: &str,
        status: &str,
        expected_version: u64,
    ) -> TestResponse {
        let body = serde_json::json!({
            "id": id,
            "status": status,
            "expectedVersion": expected_version,
        });
        self.send(request(
            Method::PATCH,
            "/api/schedules/status",
            Some(token),
            Body::from(body.to_string()),
        ))
        .await
    }
}

pub fn request(method: Method, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(body).expect("valid request")
}
