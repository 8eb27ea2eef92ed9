//! Input sanitizer and validator.
//!
//! Request bodies are parsed once, bounded in size and depth, and every
//! string (keys included) is screened for script injection, SQL injection
//! fragments and null bytes. Keys that target prototype pollution or NoSQL
//! operators are rejected outright.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{GuardError, GuardResult};

/// Bounds applied to every JSON body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizerLimits {
    pub max_body_bytes: usize,
    pub max_depth: usize,
    pub max_string_len: usize,
}

impl Default for SanitizerLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 64 * 1024,
            max_depth: 32,
            max_string_len: 10_000,
        }
    }
}

impl SanitizerLimits {
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}

const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "prototype", "constructor"];

fn script_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<\s*/?\s*(script|iframe|object|embed)\b|javascript\s*:|\bon[a-z]+\s*=")
            .expect("static regex")
    })
}

fn sql_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\bunion\s+(all\s+)?select\b|\bdrop\s+(table|database)\b|'\s*or\s+'?\d+'?\s*=\s*'?\d+|;\s*--|\bexec\s*\(",
        )
        .expect("static regex")
    })
}

/// How deeply string content is screened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screening {
    /// Structure plus markup and SQL patterns in every string
    Full,
    /// Size, depth, string length, key names and null bytes only. For bodies
    /// whose origin was already proven by a signature.
    Structural,
}

/// Parse and screen a request body.
///
/// An empty (or whitespace-only) body yields `None`.
pub fn parse_json_body(bytes: &[u8], limits: &SanitizerLimits) -> GuardResult<Option<Value>> {
    parse_screened(bytes, limits, Screening::Full)
}

/// Parse a signature-verified body. Provider payloads carry URLs and free
/// text that trip the markup patterns, so only structure is checked.
pub fn parse_signed_json_body(
    bytes: &[u8],
    limits: &SanitizerLimits,
) -> GuardResult<Option<Value>> {
    parse_screened(bytes, limits, Screening::Structural)
}

fn parse_screened(
    bytes: &[u8],
    limits: &SanitizerLimits,
    screening: Screening,
) -> GuardResult<Option<Value>> {
    if bytes.len() > limits.max_body_bytes {
        return Err(GuardError::validation("Request body too large"));
    }
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(bytes)
        .map_err(|_| GuardError::validation("Malformed JSON body"))?;

    check_at_depth(&value, limits, screening, 0)?;
    Ok(Some(value))
}

/// Screen an already-parsed value.
pub fn check_value(value: &Value, limits: &SanitizerLimits) -> GuardResult<()> {
    check_at_depth(value, limits, Screening::Full, 0)
}

fn check_at_depth(
    value: &Value,
    limits: &SanitizerLimits,
    screening: Screening,
    depth: usize,
) -> GuardResult<()> {
    if depth > limits.max_depth {
        return Err(GuardError::validation("Request body nested too deeply"));
    }

    match value {
        Value::String(s) => {
            if s.len() > limits.max_string_len {
                return Err(GuardError::validation("String field too long"));
            }
            screen_text(s, screening)
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_at_depth(item, limits, screening, depth + 1)),
        Value::Object(map) => {
            for (key, item) in map {
                check_key(key, screening)?;
                check_at_depth(item, limits, screening, depth + 1)?;
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

fn check_key(key: &str, screening: Screening) -> GuardResult<()> {
    if key.starts_with('$') || FORBIDDEN_KEYS.contains(&key) {
        return Err(GuardError::validation(format!("Field name not allowed: {key}")));
    }
    screen_text(key, screening)
}

fn screen_text(text: &str, screening: Screening) -> GuardResult<()> {
    match screening {
        Screening::Full => check_text(text),
        Screening::Structural if text.contains('\0') => {
            Err(GuardError::validation("Null bytes are not allowed"))
        }
        Screening::Structural => Ok(()),
    }
}

/// Reject strings carrying injection patterns.
pub fn check_text(text: &str) -> GuardResult<()> {
    if text.contains('\0') {
        return Err(GuardError::validation("Null bytes are not allowed"));
    }
    if script_pattern().is_match(text) {
        return Err(GuardError::validation("Potentially unsafe markup detected"));
    }
    if sql_pattern().is_match(text) {
        return Err(GuardError::validation("Potentially unsafe input detected"));
    }
    Ok(())
}

/// Required string field of a JSON object.
pub fn required_str<'a>(body: &'a Value, field: &str) -> GuardResult<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GuardError::validation(format!("Missing or invalid field: {field}")))
}
