//! CORS policy for the API.
//!
//! - **Origins**: localhost / 127.0.0.1 / [::1] on any port, plus the
//!   origins listed in `TURNOVER_ALLOWED_ORIGINS` (exact match)
//! - **Methods**: GET, POST, PATCH, OPTIONS
//! - **Request headers**: Authorization, Content-Type, X-Webhook-Signature,
//!   X-Webhook-Timestamp
//! - **Exposed headers**: X-Request-Id and the rate limit headers
//! - **Max Age**: 3600 seconds for preflight caching

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub const ALLOWED_METHODS: [Method; 4] = [Method::GET, Method::POST, Method::PATCH, Method::OPTIONS];

/// Default max age for preflight cache (1 hour)
pub const DEFAULT_MAX_AGE_SECS: u64 = 3600;

fn allowed_headers() -> [HeaderName; 4] {
    [
        AUTHORIZATION,
        CONTENT_TYPE,
        HeaderName::from_static("x-webhook-signature"),
        HeaderName::from_static("x-webhook-timestamp"),
    ]
}

fn exposed_headers() -> [HeaderName; 5] {
    [
        HeaderName::from_static("x-request-id"),
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderName::from_static("x-ratelimit-reset"),
        RETRY_AFTER,
    ]
}

/// CORS configuration options.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Exact origins allowed in addition to localhost
    pub allowed_origins: Vec<String>,
    /// Whether localhost origins are allowed (default: true)
    pub allow_localhost: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_localhost: true,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }
}

impl CorsConfig {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self {
            allowed_origins: allowed_origins
                .into_iter()
                .map(|o| o.trim().trim_end_matches('/').to_lowercase())
                .filter(|o| !o.is_empty())
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Only the configured origins; no localhost.
    pub fn with_strict_origins(mut self) -> Self {
        self.allow_localhost = false;
        self
    }

    pub fn is_allowed(&self, origin: &HeaderValue) -> bool {
        if self.allow_localhost && is_localhost_origin(origin) {
            return true;
        }
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        let origin = origin.to_lowercase();
        self.allowed_origins.iter().any(|o| *o == origin)
    }
}

/// Build the CORS layer for `config`.
pub fn cors_layer(config: CorsConfig) -> CorsLayer {
    let max_age = Duration::from_secs(config.max_age_secs);
    let config = Arc::new(config);
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            config.is_allowed(origin)
        }))
        .allow_methods(ALLOWED_METHODS)
        .allow_headers(allowed_headers())
        .expose_headers(exposed_headers())
        .max_age(max_age)
}

/// Whether `origin` is `http(s)://localhost`, `127.0.0.1` or `[::1]` with an
/// optional non-zero port.
pub fn is_localhost_origin(origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let origin = origin.to_lowercase();

    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        match v6.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => return false,
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if !matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return false;
    }
    match port {
        None => true,
        Some(port) => port.parse::<u16>().is_ok_and(|p| p > 0),
    }
}
