//! Secure handler wrapper.
//!
//! Every guarded endpoint runs through [`SecureHandler::run`]:
//!
//! ```text
//! method check ──> rate limit ──> auth ──> sanitize ──> handler
//!      │               │           │          │            │
//!     405             429       401|429      400      data | error
//!                                                          │
//!              envelope + hardened headers + one masked log line
//! ```
//!
//! Failed authentications are also charged to a per-address bucket that is
//! checked before the token is looked up, so guessing distinct tokens runs
//! into a 429 even though each guess hashes to a fresh credential bucket.
//!
//! Everything after the method check is bounded by the handler timeout.
//! Handlers return `GuardResult<Value>`; the wrapper owns status codes,
//! headers and the JSON envelope, so no handler can leak an internal error
//! string to the caller.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use tracing::Level;

use super::auth::AuthValidator;
use super::headers::SecurityHeaders;
use super::masking::secure_log;
use super::rate_limit::{derive_key, failed_auth_key, KeyStrategy, RateLimitConfig, RateLimiter};
use super::sanitize::{parse_json_body, SanitizerLimits};
use crate::context::{new_request_id, SecurityContext};
use crate::error::{ApiEnvelope, GuardError, GuardResult};
use crate::metrics::GuardMetrics;

/// How the request body reaches the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Parsed and sanitized by the wrapper
    Json,
    /// Size-checked only; the handler verifies and parses the raw bytes
    Raw,
}

/// Shape of a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// `{success, data, requestId}`
    Envelope,
    /// Handler output as-is (webhook acknowledgements)
    Bare,
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub config: RateLimitConfig,
    pub key: KeyStrategy,
}

/// Declared policy of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub name: &'static str,
    pub require_auth: bool,
    pub rate_limit: Option<RateLimitPolicy>,
    pub allowed_methods: Vec<Method>,
    pub body: BodyMode,
    pub response: ResponseMode,
}

impl EndpointPolicy {
    pub fn new(name: &'static str, allowed_methods: impl Into<Vec<Method>>) -> Self {
        Self {
            name,
            require_auth: false,
            rate_limit: None,
            allowed_methods: allowed_methods.into(),
            body: BodyMode::Json,
            response: ResponseMode::Envelope,
        }
    }

    pub fn authenticated(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn rate_limited(mut self, config: RateLimitConfig, key: KeyStrategy) -> Self {
        self.rate_limit = Some(RateLimitPolicy { config, key });
        self
    }

    pub fn raw_body(mut self) -> Self {
        self.body = BodyMode::Raw;
        self
    }

    pub fn bare_response(mut self) -> Self {
        self.response = ResponseMode::Bare;
        self
    }

    fn allow_header(&self) -> String {
        let mut methods: Vec<&str> = self.allowed_methods.iter().map(Method::as_str).collect();
        if !self.allowed_methods.contains(&Method::OPTIONS) {
            methods.push("OPTIONS");
        }
        methods.join(", ")
    }
}

/// Transport-independent view of an inbound request.
#[derive(Debug, Clone)]
pub struct GuardRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub params: HashMap<String, String>,
    pub client_ip: Option<IpAddr>,
}

impl GuardRequest {
    pub fn new(method: Method, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            headers,
            body,
            params: HashMap::new(),
            client_ip: None,
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }
}

/// Request after the wrapper's checks.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub params: HashMap<String, String>,
    pub raw_body: Bytes,
    /// Sanitized JSON body (`BodyMode::Json` only)
    pub body: Option<Value>,
}

impl ValidatedRequest {
    pub fn param(&self, name: &str) -> GuardResult<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| GuardError::validation(format!("Missing path parameter: {name}")))
    }

    pub fn json(&self) -> GuardResult<&Value> {
        self.body
            .as_ref()
            .ok_or_else(|| GuardError::validation("Request body required"))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Business logic behind a guarded endpoint.
#[async_trait]
pub trait SecuredHandler: Send + Sync {
    async fn handle(&self, ctx: &SecurityContext, request: ValidatedRequest) -> GuardResult<Value>;
}

/// Per-request facts collected for the response and log line.
#[derive(Default)]
struct Trace {
    subject: Option<String>,
    headers: Vec<(&'static str, String)>,
}

/// Runs guarded endpoints.
#[derive(Clone)]
pub struct SecureHandler {
    limiter: RateLimiter,
    auth: AuthValidator,
    limits: SanitizerLimits,
    timeout: Duration,
    metrics: Arc<GuardMetrics>,
}

impl SecureHandler {
    pub fn new(
        limiter: RateLimiter,
        auth: AuthValidator,
        limits: SanitizerLimits,
        timeout: Duration,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            limiter,
            auth,
            limits,
            timeout,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<GuardMetrics> {
        &self.metrics
    }

    /// Run `handler` under `policy` and produce the HTTP response.
    pub async fn run(
        &self,
        policy: &EndpointPolicy,
        request: GuardRequest,
        handler: &dyn SecuredHandler,
    ) -> Response {
        let started = Instant::now();
        let request_id = new_request_id();
        let method = request.method.clone();
        let mut trace = Trace::default();

        if method == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            SecurityHeaders::apply(response.headers_mut(), &request_id);
            insert_allow(&mut response, policy);
            return response;
        }

        let result = if !policy.allowed_methods.contains(&method) {
            Err(GuardError::MethodNotAllowed(method.to_string()))
        } else {
            let pipeline = self.pipeline(policy, &request_id, request, handler, &mut trace);
            match tokio::time::timeout(self.timeout, pipeline).await {
                Ok(result) => result,
                Err(_) => Err(GuardError::Timeout(self.timeout.as_millis() as u64)),
            }
        };

        let elapsed = started.elapsed();
        let (status, code, body) = match &result {
            Ok(data) => {
                let body = match policy.response {
                    ResponseMode::Envelope => {
                        serde_json::to_value(ApiEnvelope::ok(data.clone(), &request_id))
                            .unwrap_or(Value::Null)
                    }
                    ResponseMode::Bare => data.clone(),
                };
                (StatusCode::OK, None, body)
            }
            Err(err) => {
                let body = serde_json::to_value(err.into_envelope(&request_id))
                    .unwrap_or(Value::Null);
                (err.status_code(), Some(err.code()), body)
            }
        };

        self.metrics.record_request(status, code, elapsed);
        log_outcome(policy, &method, &request_id, &trace, status, &result, elapsed);

        let mut response = (status, Json(body)).into_response();
        SecurityHeaders::apply(response.headers_mut(), &request_id);
        SecurityHeaders::apply_dynamic(response.headers_mut(), &trace.headers);
        if status == StatusCode::METHOD_NOT_ALLOWED {
            insert_allow(&mut response, policy);
        }
        response
    }

    async fn pipeline(
        &self,
        policy: &EndpointPolicy,
        request_id: &str,
        request: GuardRequest,
        handler: &dyn SecuredHandler,
        trace: &mut Trace,
    ) -> GuardResult<Value> {
        if let Some(limit) = &policy.rate_limit {
            let key = derive_key(policy.name, &limit.key, &request.headers, request.client_ip);
            let decision = self.limiter.check_rate_limit(&key, &limit.config).await?;
            let now = Utc::now();
            trace.headers = decision.headers(now);
            if !decision.allowed {
                return Err(decision.to_error(now));
            }
        }

        let ctx = if policy.require_auth {
            self.authenticate(policy, request_id, &request, trace).await?
        } else {
            SecurityContext::anonymous(request_id)
        };
        trace.subject = ctx.user_id().map(str::to_string);

        let body = match policy.body {
            BodyMode::Json => parse_json_body(&request.body, &self.limits)?,
            BodyMode::Raw => {
                if request.body.len() > self.limits.max_body_bytes {
                    return Err(GuardError::validation("Request body too large"));
                }
                None
            }
        };

        let validated = ValidatedRequest {
            method: request.method,
            headers: request.headers,
            params: request.params,
            raw_body: request.body,
            body,
        };

        handler.handle(&ctx, validated).await
    }
}

impl SecureHandler {
    /// Validate the bearer token, bounded by the failed-auth bucket of the
    /// caller's address when the endpoint is rate limited.
    async fn authenticate(
        &self,
        policy: &EndpointPolicy,
        request_id: &str,
        request: &GuardRequest,
        trace: &mut Trace,
    ) -> GuardResult<SecurityContext> {
        let failures = policy
            .rate_limit
            .as_ref()
            .map(|limit| (failed_auth_key(policy.name, request.client_ip), limit.config));

        if let Some((key, config)) = &failures {
            let now = Utc::now();
            let decision = self.limiter.peek_at(key, config, now).await?;
            if !decision.allowed {
                trace.headers = decision.headers(now);
                return Err(decision.to_error(now));
            }
        }

        let header = request
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        match self.auth.validate(request_id, header).await {
            Ok(ctx) => Ok(ctx),
            Err(err @ GuardError::Authentication(_)) => {
                if let Some((key, config)) = &failures {
                    self.limiter.check_rate_limit(key, config).await?;
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

fn insert_allow(response: &mut Response, policy: &EndpointPolicy) {
    if let Ok(value) = HeaderValue::from_str(&policy.allow_header()) {
        response
            .headers_mut()
            .insert(axum::http::header::ALLOW, value);
    }
}

fn log_outcome(
    policy: &EndpointPolicy,
    method: &Method,
    request_id: &str,
    trace: &Trace,
    status: StatusCode,
    result: &GuardResult<Value>,
    elapsed: Duration,
) {
    let subject = trace.subject.as_deref().unwrap_or("anonymous");
    let status_code = status.as_u16().to_string();
    let duration_ms = format!("{:.3}", elapsed.as_secs_f64() * 1000.0);
    let mut fields = vec![
        ("request_id", request_id.to_string()),
        ("endpoint", policy.name.to_string()),
        ("method", method.to_string()),
        ("subject", subject.to_string()),
        ("status", status_code),
    ];

    let (level, message) = match result {
        Ok(_) => {
            fields.push(("outcome", "ok".to_string()));
            (Level::INFO, "request handled")
        }
        Err(err) if err.is_server_error() => {
            fields.push(("outcome", err.code().to_string()));
            fields.push(("error", err.to_string()));
            (Level::ERROR, "request failed")
        }
        Err(err) => {
            fields.push(("outcome", err.code().to_string()));
            (Level::WARN, "request rejected")
        }
    };
    fields.push(("duration_ms", duration_ms));

    let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
    secure_log(level, message, &borrowed);
}
