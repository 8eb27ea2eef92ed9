//! Bearer-token authentication.
//!
//! Tokens are never stored or compared in plaintext: the store is keyed by
//! the SHA-256 hex of the token, so a lookup is an exact-match on a digest.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::context::SecurityContext;
use crate::error::{AuthFailure, GuardError, GuardResult};
use crate::store::SessionStore;

/// SHA-256 hex digest of a bearer token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, AuthFailure> {
    let header = header.ok_or(AuthFailure::MissingHeader)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AuthFailure::InvalidFormat)?
        .trim();

    if token.is_empty() {
        return Err(AuthFailure::InvalidFormat);
    }
    Ok(token)
}

/// Resolves bearer tokens to a [`SecurityContext`].
#[derive(Clone)]
pub struct AuthValidator {
    sessions: Arc<dyn SessionStore>,
}

impl AuthValidator {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    /// Validate the Authorization header and build the request context.
    pub async fn validate(
        &self,
        request_id: &str,
        auth_header: Option<&str>,
    ) -> GuardResult<SecurityContext> {
        self.validate_at(request_id, auth_header, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        request_id: &str,
        auth_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> GuardResult<SecurityContext> {
        let token = parse_bearer(auth_header).map_err(GuardError::Authentication)?;

        let session = match self.sessions.find_session(&hash_token(token)).await? {
            Some(session) => session,
            None => {
                warn!(request_id, "Invalid authentication token attempt");
                return Err(GuardError::Authentication(AuthFailure::InvalidToken));
            }
        };

        if session.expires_at <= now {
            debug!(request_id, user_id = %session.user_id, "Expired session presented");
            return Err(GuardError::Authentication(AuthFailure::Expired));
        }

        Ok(SecurityContext::authenticated(request_id, &session))
    }
}
