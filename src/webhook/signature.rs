//! Webhook signature verification and replay protection.
//!
//! The MAC is computed over the raw body bytes exactly as received, before
//! any JSON parsing. Accepted `X-Webhook-Signature` forms:
//!
//! - `sha256=<hex>` / `v1=<hex>` / `<hex>`: HMAC-SHA256 over the body
//! - `t=<unix>,v1=<hex>[,v1=<hex>]`: HMAC-SHA256 over `"<t>." + body`, which
//!   binds the timestamp into the MAC
//!
//! Freshness comes from the `t=` value or, failing that, from
//! `X-Webhook-Timestamp`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ReplayReason;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Decoded signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub timestamp: Option<String>,
    pub digests: Vec<Vec<u8>>,
}

/// Parse any accepted header form. `None` when nothing decodes.
pub fn parse_signature_header(header: &str) -> Option<ParsedSignature> {
    let header = header.trim();

    if header.contains(',') || header.starts_with("t=") {
        let mut timestamp = None;
        let mut digests = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value.trim().to_string()),
                Some(("v1", value)) => digests.push(hex::decode(value.trim()).ok()?),
                _ => {}
            }
        }
        if timestamp.is_none() || digests.is_empty() {
            return None;
        }
        return Some(ParsedSignature { timestamp, digests });
    }

    let hex_part = header
        .strip_prefix("sha256=")
        .or_else(|| header.strip_prefix("v1="))
        .unwrap_or(header);
    let digest = hex::decode(hex_part).ok()?;
    Some(ParsedSignature {
        timestamp: None,
        digests: vec![digest],
    })
}

/// HMAC-SHA256 over the body, optionally bound to a timestamp.
pub fn compute_signature(raw_body: &[u8], secret: &str, timestamp: Option<&str>) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
        mac.update(b".");
    }
    mac.update(raw_body);
    mac.finalize().into_bytes().to_vec()
}

/// `sha256=<hex>` header value for `raw_body`.
pub fn sign_payload(raw_body: &[u8], secret: &str) -> String {
    format!("sha256={}", hex::encode(compute_signature(raw_body, secret, None)))
}

/// `t=<unix>,v1=<hex>` header value for `raw_body`.
pub fn sign_payload_at(raw_body: &[u8], secret: &str, timestamp: i64) -> String {
    let ts = timestamp.to_string();
    format!(
        "t={ts},v1={}",
        hex::encode(compute_signature(raw_body, secret, Some(&ts)))
    )
}

/// Constant-time check of `signature_header` against the raw body.
pub fn verify_signature(raw_body: &[u8], signature_header: &str, secret: &str) -> bool {
    let Some(parsed) = parse_signature_header(signature_header) else {
        return false;
    };
    let expected = compute_signature(raw_body, secret, parsed.timestamp.as_deref());
    if expected.is_empty() {
        return false;
    }

    parsed
        .digests
        .iter()
        .any(|digest| bool::from(digest.as_slice().ct_eq(expected.as_slice())))
}

/// Seconds since the epoch; millisecond values are accepted too.
fn parse_timestamp(raw: &str) -> Result<i64, ReplayReason> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ReplayReason::MalformedTimestamp)?;
    if value <= 0 {
        return Err(ReplayReason::MalformedTimestamp);
    }
    Ok(if value > 100_000_000_000 { value / 1000 } else { value })
}

/// Reject timestamps older than `max_age_secs` or further in the future
/// than `skew_secs`.
pub fn check_timestamp(
    raw: &str,
    max_age_secs: i64,
    skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), ReplayReason> {
    let ts = parse_timestamp(raw)?;
    let age = now.timestamp() - ts;
    if age > max_age_secs {
        return Err(ReplayReason::StaleTimestamp);
    }
    if -age > skew_secs {
        return Err(ReplayReason::FutureTimestamp);
    }
    Ok(())
}

pub fn is_webhook_timestamp_valid(
    timestamp_header: &str,
    max_age_secs: i64,
    skew_secs: i64,
) -> bool {
    check_timestamp(timestamp_header, max_age_secs, skew_secs, Utc::now()).is_ok()
}

/// Signature plus freshness policy for one provider secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    max_age_secs: i64,
    skew_secs: i64,
    require_timestamp: bool,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("max_age_secs", &self.max_age_secs)
            .field("skew_secs", &self.skew_secs)
            .field("require_timestamp", &self.require_timestamp)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, max_age_secs: i64, skew_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            max_age_secs,
            skew_secs,
            require_timestamp: false,
        }
    }

    pub fn require_timestamp(mut self, required: bool) -> Self {
        self.require_timestamp = required;
        self
    }

    /// Signature first, then freshness.
    pub fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<(), ReplayReason> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or(ReplayReason::MissingSignature)?;

        if !verify_signature(raw_body, header, &self.secret) {
            return Err(ReplayReason::BadSignature);
        }

        let bound = parse_signature_header(header).and_then(|p| p.timestamp);
        let timestamp = bound.or_else(|| {
            headers
                .get(TIMESTAMP_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

        match timestamp {
            Some(ts) => check_timestamp(&ts, self.max_age_secs, self.skew_secs, now),
            None if self.require_timestamp => Err(ReplayReason::MissingTimestamp),
            None => Ok(()),
        }
    }
}
