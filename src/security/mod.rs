//! Request security layers.
//!
//! The [`wrapper`] composes the others into one pipeline; each layer is also
//! usable on its own.

pub mod auth;
pub mod headers;
pub mod masking;
pub mod rate_limit;
pub mod sanitize;
pub mod wrapper;

pub use auth::{hash_token, parse_bearer, AuthValidator};
pub use headers::SecurityHeaders;
pub use masking::{filter_sensitive_data, mask_cpf, mask_email, mask_phone, secure_log};
pub use rate_limit::{
    derive_key, failed_auth_key, KeyStrategy, RateLimitConfig, RateLimitDecision, RateLimiter,
};
pub use sanitize::{
    check_text, check_value, parse_json_body, parse_signed_json_body, SanitizerLimits, Screening,
};
pub use wrapper::{
    BodyMode, EndpointPolicy, GuardRequest, RateLimitPolicy, ResponseMode, SecureHandler,
    SecuredHandler, ValidatedRequest,
};
