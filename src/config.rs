//! Runtime configuration.
//!
//! Loaded once at startup from `TURNOVER_*` environment variables. Tests and
//! embedders build a [`GuardConfig`] directly with [`GuardConfig::new`] and
//! the `with_*` overrides.

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::{CipherError, FieldCipher};
use crate::security::rate_limit::RateLimitConfig;
use crate::security::sanitize::SanitizerLimits;
use crate::webhook::idempotency::DEFAULT_TTL;

/// Longest ledger retention accepted from configuration (one year)
pub const MAX_IDEMPOTENCY_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Startup configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TURNOVER_WEBHOOK_SECRET is not set")]
    MissingWebhookSecret,

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("TURNOVER_FIELD_KEY is unusable: {0}")]
    FieldKey(#[from] CipherError),
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

/// Guard configuration
#[derive(Clone)]
pub struct GuardConfig {
    pub webhook_secret: String,
    pub rate_limit: RateLimitConfig,
    pub idempotency_ttl: Duration,
    pub clock_skew_tolerance_secs: i64,
    pub webhook_max_age_secs: i64,
    pub webhook_require_timestamp: bool,
    pub handler_timeout: Duration,
    pub max_body_bytes: usize,
    /// Extra CORS origins; localhost is always allowed
    pub allowed_origins: Vec<String>,
    /// Base64 AES-256 key for field encryption
    pub field_key: Option<String>,
    pub bind_all: bool,
}

impl std::fmt::Debug for GuardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardConfig")
            .field("webhook_secret", &"[REDACTED]")
            .field("rate_limit", &self.rate_limit)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("clock_skew_tolerance_secs", &self.clock_skew_tolerance_secs)
            .field("webhook_max_age_secs", &self.webhook_max_age_secs)
            .field("webhook_require_timestamp", &self.webhook_require_timestamp)
            .field("handler_timeout", &self.handler_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("allowed_origins", &self.allowed_origins)
            .field("field_key", &self.field_key.as_ref().map(|_| "[REDACTED]"))
            .field("bind_all", &self.bind_all)
            .finish()
    }
}

impl GuardConfig {
    /// Defaults for everything except the webhook secret.
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            rate_limit: RateLimitConfig::new(Duration::from_millis(60_000), 100),
            idempotency_ttl: DEFAULT_TTL,
            clock_skew_tolerance_secs: 30,
            webhook_max_age_secs: 300,
            webhook_require_timestamp: false,
            handler_timeout: Duration::from_millis(10_000),
            max_body_bytes: SanitizerLimits::default().max_body_bytes,
            allowed_origins: Vec::new(),
            field_key: None,
            bind_all: false,
        }
    }

    pub fn with_rate_limit(mut self, window: Duration, max_requests: u32) -> Self {
        self.rate_limit = RateLimitConfig::new(window, max_requests);
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_clock_skew_tolerance(mut self, secs: i64) -> Self {
        self.clock_skew_tolerance_secs = secs;
        self
    }

    pub fn with_webhook_max_age(mut self, secs: i64) -> Self {
        self.webhook_max_age_secs = secs;
        self
    }

    pub fn with_require_timestamp(mut self, required: bool) -> Self {
        self.webhook_require_timestamp = required;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn with_field_key(mut self, key_base64: impl Into<String>) -> Self {
        self.field_key = Some(key_base64.into());
        self
    }

    pub fn with_bind_all(mut self, bind_all: bool) -> Self {
        self.bind_all = bind_all;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// - `TURNOVER_WEBHOOK_SECRET` (required)
    /// - `TURNOVER_RATE_LIMIT_WINDOW_MS` (default: 60000)
    /// - `TURNOVER_RATE_LIMIT_MAX_REQUESTS` (default: 100)
    /// - `TURNOVER_IDEMPOTENCY_TTL_SECS` (default: 604800)
    /// - `TURNOVER_CLOCK_SKEW_TOLERANCE_SECS` (default: 30)
    /// - `TURNOVER_WEBHOOK_MAX_AGE_SECS` (default: 300)
    /// - `TURNOVER_WEBHOOK_REQUIRE_TIMESTAMP` (default: false)
    /// - `TURNOVER_HANDLER_TIMEOUT_MS` (default: 10000)
    /// - `TURNOVER_MAX_BODY_BYTES` (default: 65536)
    /// - `TURNOVER_ALLOWED_ORIGINS` (comma-separated)
    /// - `TURNOVER_FIELD_KEY` (base64, 32 bytes)
    /// - `TURNOVER_BIND_ALL` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`GuardConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("TURNOVER_WEBHOOK_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingWebhookSecret)?;
        if secret.len() < 16 {
            warn!("SECURITY WARNING: TURNOVER_WEBHOOK_SECRET is shorter than 16 characters");
        }

        let defaults = Self::new(secret);

        let window_ms: u64 = parse_or(&lookup, "TURNOVER_RATE_LIMIT_WINDOW_MS", 60_000)?;
        let max_requests: u32 = parse_or(&lookup, "TURNOVER_RATE_LIMIT_MAX_REQUESTS", 100)?;
        let ttl_secs: u64 = parse_or(
            &lookup,
            "TURNOVER_IDEMPOTENCY_TTL_SECS",
            defaults.idempotency_ttl.as_secs(),
        )?;
        let skew: i64 = parse_or(&lookup, "TURNOVER_CLOCK_SKEW_TOLERANCE_SECS", 30)?;
        let max_age: i64 = parse_or(&lookup, "TURNOVER_WEBHOOK_MAX_AGE_SECS", 300)?;
        let timeout_ms: u64 = parse_or(&lookup, "TURNOVER_HANDLER_TIMEOUT_MS", 10_000)?;
        let max_body: usize =
            parse_or(&lookup, "TURNOVER_MAX_BODY_BYTES", defaults.max_body_bytes)?;

        let origins = lookup("TURNOVER_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut config = defaults
            .with_rate_limit(Duration::from_millis(window_ms), max_requests)
            .with_idempotency_ttl(Duration::from_secs(ttl_secs))
            .with_clock_skew_tolerance(skew)
            .with_webhook_max_age(max_age)
            .with_require_timestamp(flag(&lookup, "TURNOVER_WEBHOOK_REQUIRE_TIMESTAMP"))
            .with_handler_timeout(Duration::from_millis(timeout_ms))
            .with_max_body_bytes(max_body)
            .with_allowed_origins(origins)
            .with_bind_all(flag(&lookup, "TURNOVER_BIND_ALL"));
        config.field_key = lookup("TURNOVER_FIELD_KEY").filter(|k| !k.trim().is_empty());

        config.validate()?;

        info!(
            window_ms,
            max_requests,
            idempotency_ttl_secs = ttl_secs,
            webhook_max_age_secs = max_age,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Reject values no deployment can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook_secret.trim().is_empty() {
            return Err(ConfigError::MissingWebhookSecret);
        }
        if self.rate_limit.max_requests == 0 {
            return Err(invalid(
                "TURNOVER_RATE_LIMIT_MAX_REQUESTS",
                "rate limit cannot be 0",
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(invalid("TURNOVER_RATE_LIMIT_WINDOW_MS", "window cannot be 0"));
        }
        if self.idempotency_ttl.is_zero() {
            return Err(invalid("TURNOVER_IDEMPOTENCY_TTL_SECS", "ttl cannot be 0"));
        }
        if self.idempotency_ttl > MAX_IDEMPOTENCY_TTL {
            return Err(invalid(
                "TURNOVER_IDEMPOTENCY_TTL_SECS",
                format!("ttl cannot exceed {} seconds", MAX_IDEMPOTENCY_TTL.as_secs()),
            ));
        }
        if self.clock_skew_tolerance_secs < 0 {
            return Err(invalid("TURNOVER_CLOCK_SKEW_TOLERANCE_SECS", "must be >= 0"));
        }
        if self.webhook_max_age_secs <= 0 {
            return Err(invalid("TURNOVER_WEBHOOK_MAX_AGE_SECS", "must be > 0"));
        }
        if self.handler_timeout.is_zero() {
            return Err(invalid("TURNOVER_HANDLER_TIMEOUT_MS", "timeout cannot be 0"));
        }
        if self.max_body_bytes == 0 {
            return Err(invalid("TURNOVER_MAX_BODY_BYTES", "limit cannot be 0"));
        }
        Ok(())
    }

    pub fn sanitizer_limits(&self) -> SanitizerLimits {
        SanitizerLimits::default().with_max_body_bytes(self.max_body_bytes)
    }

    /// Cipher for stored PII. Without a configured key, values sealed by
    /// this process cannot be read after a restart.
    pub fn field_cipher(&self) -> Result<FieldCipher, ConfigError> {
        match &self.field_key {
            Some(key) => Ok(FieldCipher::from_base64(key)?),
            None => {
                warn!("SECURITY WARNING: TURNOVER_FIELD_KEY not set; using an ephemeral key");
                Ok(FieldCipher::ephemeral())
            }
        }
    }

    pub fn bind_addr(&self) -> IpAddr {
        if self.bind_all {
            warn!("SECURITY: Binding to 0.0.0.0 (TURNOVER_BIND_ALL=true)");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| invalid(name, e.to_string()))
        }
        _ => Ok(default),
    }
}

fn flag<F>(lookup: &F, name: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}
