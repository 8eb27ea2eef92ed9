//! Hardened response headers.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Security headers attached to every wrapped response.
pub struct SecurityHeaders;

impl SecurityHeaders {
    /// Standard security headers
    pub fn headers() -> Vec<(&'static str, &'static str)> {
        vec![
            // Prevent MIME type sniffing
            ("X-Content-Type-Options", "nosniff"),
            // Prevent clickjacking
            ("X-Frame-Options", "DENY"),
            // API responses never render as documents
            (
                "Content-Security-Policy",
                "default-src 'none'; frame-ancestors 'none'",
            ),
            ("Referrer-Policy", "no-referrer"),
            // Responses carry tenant data
            ("Cache-Control", "no-store"),
        ]
    }

    /// Insert the standard headers plus `X-Request-Id`.
    pub fn apply(headers: &mut HeaderMap, request_id: &str) {
        for (name, value) in Self::headers() {
            if let Ok(name) = HeaderName::try_from(name) {
                headers.insert(name, HeaderValue::from_static(value));
            }
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }
    }

    /// Insert dynamic headers such as `X-RateLimit-*` and `Retry-After`.
    pub fn apply_dynamic(headers: &mut HeaderMap, extra: &[(&'static str, String)]) {
        for (name, value) in extra {
            let Ok(name) = HeaderName::try_from(*name) else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
    }
}
