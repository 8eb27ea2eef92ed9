//! PII masking and role-based field filtering.
//!
//! Masks keep enough structure for support triage (domain of an email, last
//! digits of a phone) and nothing else.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, error, info, warn, Level};

use crate::authz::ResourceType;
use crate::context::Role;

const REDACTED: &str = "[REDACTED]";

/// `joao.silva@example.com` -> `jo***@example.com`
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            let keep = if local.chars().count() > 2 { 2 } else { 1 };
            let prefix: String = local.chars().take(keep).collect();
            format!("{prefix}***@{domain}")
        }
        _ => "***".to_string(),
    }
}

/// `123.456.789-09` -> `***.456.789-**`
///
/// Anything that is not an 11-digit CPF is fully masked.
pub fn mask_cpf(cpf: &str) -> String {
    let digits: Vec<char> = cpf.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 11 {
        return "***".to_string();
    }
    let middle: String = digits[3..6].iter().collect();
    let tail: String = digits[6..9].iter().collect();
    format!("***.{middle}.{tail}-**")
}

/// Masks every digit but the last four, keeping separators:
/// `+55 (11) 98765-4321` -> `+** (**) *****-4321`
pub fn mask_phone(phone: &str) -> String {
    let total = phone.chars().filter(char::is_ascii_digit).count();
    let visible_from = if total > 4 { total - 4 } else { total };

    let mut seen = 0;
    phone
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen > visible_from {
                    return c;
                }
                '*'
            } else {
                c
            }
        })
        .collect()
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
    })
}

fn bearer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bbearer\s+[^\s,;]+").expect("static regex"))
}

fn url_credentials_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"://[^/\s:@]+:[^/\s@]+@").expect("static regex"))
}

/// Mask PII and credentials embedded in free text such as error messages.
pub fn scrub_text(text: &str) -> String {
    let text = url_credentials_pattern().replace_all(text, "://[REDACTED]@");
    let text = bearer_pattern().replace_all(&text, "Bearer [REDACTED]");
    email_pattern()
        .replace_all(&text, |caps: &Captures<'_>| mask_email(&caps[0]))
        .into_owned()
}

/// Mask a single log field by its key.
pub fn mask_field(key: &str, value: &str) -> String {
    let key = key.to_ascii_lowercase();
    if ["token", "secret", "password", "authorization", "signature", "key"]
        .iter()
        .any(|k| key.contains(k))
    {
        REDACTED.to_string()
    } else if key.contains("email") {
        mask_email(value)
    } else if key.contains("cpf") || key.contains("document") {
        mask_cpf(value)
    } else if key.contains("phone") {
        mask_phone(value)
    } else {
        scrub_text(value)
    }
}

/// Mask a set of log fields and render them as `key=value` pairs.
pub fn mask_fields(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={}", mask_field(k, v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Emit a log line with every sensitive field masked.
pub fn secure_log(level: Level, message: &str, fields: &[(&str, &str)]) {
    let fields = mask_fields(fields);
    match level {
        Level::ERROR => error!(target: "turnover_guard::security", fields = %fields, "{message}"),
        Level::WARN => warn!(target: "turnover_guard::security", fields = %fields, "{message}"),
        Level::INFO => info!(target: "turnover_guard::security", fields = %fields, "{message}"),
        _ => debug!(target: "turnover_guard::security", fields = %fields, "{message}"),
    }
}

/// Fields a role may not see, per resource type.
fn hidden_fields(role: Role, resource_type: ResourceType) -> &'static [&'static str] {
    match (role, resource_type) {
        (Role::Admin | Role::Manager, _) => &[],
        (Role::Cleaner, ResourceType::Schedule) => {
            &["guestEmail", "guestPhone", "priceCents", "ownerUserId"]
        }
        (Role::Cleaner, ResourceType::Property) => {
            &["ownerDocument", "ownerPhone", "icalUrl", "ownerUserId"]
        }
    }
}

/// Strip fields the role is not entitled to and mask PII that remains.
///
/// Works on the serialized (camelCase) form of a resource.
pub fn filter_sensitive_data(mut resource: Value, role: Role, resource_type: ResourceType) -> Value {
    let Some(map) = resource.as_object_mut() else {
        return resource;
    };

    for field in hidden_fields(role, resource_type) {
        map.remove(*field);
    }

    // Admins are not owners; they get triage-level views of owner PII.
    if role == Role::Admin {
        if let Some(Value::String(doc)) = map.get_mut("ownerDocument") {
            *doc = mask_cpf(doc);
        }
        if let Some(Value::String(email)) = map.get_mut("guestEmail") {
            *email = mask_email(email);
        }
    }

    resource
}
