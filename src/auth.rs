//! Access-token authorization for controllers and callers, plus the admin-key
//! middleware guarding the statistics endpoints.
//!
//! Controllers present their channel access token on the `/Connector`
//! upgrade as `Authorization: Bearer <token>` (or `?token=` when the client
//! cannot set headers). HTTP callers present the same token to address that
//! channel.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::connector::SessionIdentifier;
use crate::error::{ConnectorError, Result};
use crate::repository::IdentityRepository;

/// Resolves access tokens to session identifiers through an [`IdentityRepository`].
#[derive(Clone)]
pub struct AccessTokenAuthorizer {
    repository: Arc<dyn IdentityRepository>,
}

impl AccessTokenAuthorizer {
    pub fn new(repository: Arc<dyn IdentityRepository>) -> Self {
        Self { repository }
    }

    /// Handshake check for a connecting controller. `Unauthorized` when the
    /// token is missing, unknown, or expired.
    pub async fn authorize(&self, token: Option<&str>) -> Result<SessionIdentifier> {
        let token = match token {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return Err(ConnectorError::Unauthorized),
        };
        let repository = self.repository.clone();
        let found = tokio::task::spawn_blocking(move || {
            repository.find_channel_by_access_token(&token)
        })
        .await
        .map_err(|e| ConnectorError::Repository(e.to_string()))??;

        found.ok_or(ConnectorError::Unauthorized)
    }

    /// Resolve the channel an HTTP caller addresses from its `Authorization` header.
    pub async fn resolve_caller(&self, headers: &HeaderMap) -> Result<SessionIdentifier> {
        self.authorize(bearer_token(headers)).await
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Axum middleware that rejects requests without a valid admin key.
/// The expected key is injected via the [`AdminKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but invalid, or no admin key configured
/// - `500 Internal Server Error`: [`AdminKey`] extension not found (misconfiguration)
pub async fn require_admin_key(request: Request, next: Next) -> Response {
    let admin_key = match request.extensions().get::<AdminKey>() {
        Some(key) => key.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    let Some(provided) = bearer_token(request.headers()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    let Some(expected) = admin_key else {
        warn!("Admin endpoint called but no admin key is configured");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Admin API disabled"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid admin key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension carrying the configured admin key (`None` = admin API disabled).
#[derive(Clone)]
pub struct AdminKey(pub Option<String>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{StaticChannel, StaticIdentityRepository};

    fn authorizer() -> AccessTokenAuthorizer {
        AccessTokenAuthorizer::new(Arc::new(StaticIdentityRepository::new(&[StaticChannel {
            identity_uid: "dev-1".into(),
            channel_uid: "default".into(),
            access_token: "tok".into(),
            valid_until: None,
        }])))
    }

    #[test]
    fn constant_time_eq_compares_full_keys() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok"));
        headers.insert("authorization", "Basic tok".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn authorize_resolves_known_token() {
        let id = authorizer().authorize(Some("tok")).await.unwrap();
        assert_eq!(id, SessionIdentifier::for_identity("dev-1"));
    }

    #[tokio::test]
    async fn authorize_rejects_missing_and_unknown_tokens() {
        let auth = authorizer();
        assert_eq!(auth.authorize(None).await, Err(ConnectorError::Unauthorized));
        assert_eq!(auth.authorize(Some("")).await, Err(ConnectorError::Unauthorized));
        assert_eq!(auth.authorize(Some("other")).await, Err(ConnectorError::Unauthorized));
    }
}
