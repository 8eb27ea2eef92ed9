//! Fixed-window rate limiting.
//!
//! One bucket per key per window. The window start is aligned to multiples of
//! the window length, so every handler instance sharing a store agrees on the
//! bucket without coordination, and the increment itself is a single atomic
//! store call.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use http::{HeaderMap, HeaderName};
use sha2::{Digest, Sha256};

use crate::error::GuardError;
use crate::store::{RateLimitStore, StoreResult};

/// Budget for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(Duration::from_secs(60), max_requests)
    }

    fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }
}

/// How a request is mapped to a bucket key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Remote socket address
    ClientIp,
    /// Hash of a credential-bearing header (Authorization, webhook signature).
    /// Falls back to the client IP when the header is absent.
    Credential(HeaderName),
}

/// Derive the bucket key for a request. Credential values are hashed so raw
/// secrets never reach the store.
pub fn derive_key(
    scope: &str,
    strategy: &KeyStrategy,
    headers: &HeaderMap,
    client_ip: Option<IpAddr>,
) -> String {
    if let KeyStrategy::Credential(name) = strategy {
        if let Some(value) = headers.get(name) {
            let digest = Sha256::digest(value.as_bytes());
            return format!("{scope}:cred:{}", &hex::encode(digest)[..32]);
        }
    }

    match client_ip {
        Some(ip) => format!("{scope}:ip:{ip}"),
        None => format!("{scope}:anonymous"),
    }
}

/// Bucket charged with failed authentications from one address. Guessed
/// tokens each hash to a fresh credential bucket, so brute force is bounded
/// here instead.
pub fn failed_auth_key(scope: &str, client_ip: Option<IpAddr>) -> String {
    match client_ip {
        Some(ip) => format!("{scope}:auth-failures:ip:{ip}"),
        None => format!("{scope}:auth-failures:anonymous"),
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// End of the current window
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
}

impl RateLimitDecision {
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Convert a denial into the 429 error.
    pub fn to_error(&self, now: DateTime<Utc>) -> GuardError {
        GuardError::RateLimited {
            retry_after: self.retry_after(now),
            reset_at: self.reset_at,
            limit: self.limit,
        }
    }

    /// Rate limit headers
    pub fn headers(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if !self.allowed {
            headers.push((
                "Retry-After",
                self.retry_after(now).as_secs().max(1).to_string(),
            ));
        }
        headers
    }
}

/// Rate limiter backed by an atomic bucket store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub async fn check_rate_limit(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> StoreResult<RateLimitDecision> {
        self.check_rate_limit_at(key, config, Utc::now()).await
    }

    pub async fn check_rate_limit_at(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitDecision> {
        let (window_start, window_ms, reset_at) = window_bounds(config, now);

        let state = self
            .store
            .increment_with_ceiling(key, window_start, window_ms, config.max_requests)
            .await?;

        Ok(RateLimitDecision {
            allowed: state.admitted,
            remaining: config.max_requests.saturating_sub(state.count),
            reset_at,
            limit: config.max_requests,
        })
    }

    /// Decision for `key` without counting a request.
    pub async fn peek_at(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitDecision> {
        let (window_start, _, reset_at) = window_bounds(config, now);
        let count = self.store.bucket_count(key, window_start).await?;

        Ok(RateLimitDecision {
            allowed: count < config.max_requests,
            remaining: config.max_requests.saturating_sub(count),
            reset_at,
            limit: config.max_requests,
        })
    }

    /// Drop buckets from windows that ended more than one window ago.
    pub async fn cleanup(&self, window: Duration) -> StoreResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - window.as_millis() as i64;
        self.store.purge_buckets(cutoff).await
    }
}

/// Aligned window start, window length and window end for `now`.
fn window_bounds(config: &RateLimitConfig, now: DateTime<Utc>) -> (i64, u64, DateTime<Utc>) {
    let window_ms = config.window_ms();
    let now_ms = now.timestamp_millis();
    let window_start = now_ms - now_ms.rem_euclid(window_ms as i64);
    let reset_at = Utc
        .timestamp_millis_opt(window_start + window_ms as i64)
        .single()
        .unwrap_or(now);
    (window_start, window_ms, reset_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use http::HeaderValue;
    use std::net::Ipv4Addr;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryStore::new()))
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[tokio::test]
    async fn test_rate_limiter() {
        let limiter = limiter();
        let config = RateLimitConfig::per_minute(3);
        let now = at(1_700_000_000_000);

        for remaining in [2, 1, 0] {
            let d = limiter.check_rate_limit_at("k", &config, now).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, remaining);
        }

        let d = limiter.check_rate_limit_at("k", &config, now).await.unwrap();
        assert!(!d.allowed);
        assert!(d.reset_at > now);
    }

    #[tokio::test]
    async fn test_window_rollover_resets_counter() {
        let limiter = limiter();
        let config = RateLimitConfig::new(Duration::from_millis(1000), 1);

        assert!(limiter.check_rate_limit_at("k", &config, at(10_000)).await.unwrap().allowed);
        assert!(!limiter.check_rate_limit_at("k", &config, at(10_999)).await.unwrap().allowed);

        let d = limiter
            .check_rate_limit_at("k", &config, at(11_000))
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        let config = RateLimitConfig::per_minute(1);
        let now = at(0);

        assert!(limiter.check_rate_limit_at("a", &config, now).await.unwrap().allowed);
        assert!(!limiter.check_rate_limit_at("a", &config, now).await.unwrap().allowed);
        assert!(limiter.check_rate_limit_at("b", &config, now).await.unwrap().allowed);
    }

    #[test]
    fn test_credential_key_hashes_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-webhook-signature",
            HeaderValue::from_static("sha256=deadbeef"),
        );
        let strategy = KeyStrategy::Credential(HeaderName::from_static("x-webhook-signature"));
        let ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        let key = derive_key("webhook", &strategy, &headers, ip);
        assert!(key.starts_with("webhook:cred:"));
        assert!(!key.contains("deadbeef"));

        // Same credential from another address shares the bucket
        let other_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(key, derive_key("webhook", &strategy, &headers, other_ip));
    }

    #[test]
    fn test_key_falls_back_to_ip() {
        let headers = HeaderMap::new();
        let strategy = KeyStrategy::Credential(http::header::AUTHORIZATION);
        let ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(derive_key("api", &strategy, &headers, ip), "api:ip:127.0.0.1");
        assert_eq!(
            derive_key("api", &KeyStrategy::ClientIp, &headers, None),
            "api:anonymous"
        );
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let limiter = limiter();
        let config = RateLimitConfig::per_minute(2);
        let now = at(1_700_000_000_000);

        for _ in 0..5 {
            assert!(limiter.peek_at("k", &config, now).await.unwrap().allowed);
        }
        limiter.check_rate_limit_at("k", &config, now).await.unwrap();
        limiter.check_rate_limit_at("k", &config, now).await.unwrap();

        let peeked = limiter.peek_at("k", &config, now).await.unwrap();
        assert!(!peeked.allowed);
        assert_eq!(peeked.remaining, 0);
    }

    #[test]
    fn test_failed_auth_key_ignores_credentials() {
        let ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(failed_auth_key("api", ip), "api:auth-failures:ip:10.0.0.7");
        assert_eq!(failed_auth_key("api", None), "api:auth-failures:anonymous");
    }

    #[test]
    fn test_denied_decision_headers() {
        let now = at(0);
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: at(30_000),
            limit: 10,
        };
        let headers = decision.headers(now);
        let retry = headers.iter().find(|(n, _)| *n == "Retry-After").unwrap();
        assert_eq!(retry.1, "30");
        assert!(matches!(
            decision.to_error(now),
            GuardError::RateLimited { limit: 10, .. }
        ));
    }
}
