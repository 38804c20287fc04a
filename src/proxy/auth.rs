//! Identity resolution for proxied and admin requests.
//!
//! An upstream middleware (session/JWT) may already have inserted a
//! `UserIdentity` extension; otherwise we accept, in priority order, an
//! `Authorization: Bearer <token>` header, an `x-api-key` header, or a
//! `key=<token>` query parameter for MCP clients that cannot set headers.
//! Tokens resolve through the access-token table.

use axum::{
    extract::{Query, State},
    middleware::Next,
    response::Response,
};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::proxy::error::{ProxyError, ProxyResult};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value {
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

/// The resolved caller identity, inserted into request extensions.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UserIdentity {
    pub user_id: i64,
    pub role: Role,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    pub key: Option<String>,
}

/// Pulls the bearer token out of the request, if any.
fn extract_token(headers: &HeaderMap, query: &AuthQuery) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let query_key = query.key.as_deref().map(str::trim).filter(|s| !s.is_empty());

    bearer.or(api_key).or(query_key).map(str::to_string)
}

/// Resolves a token against the store. A present-but-unknown token is a hard
/// 401; an absent token leaves the request anonymous for the dispatcher to
/// judge.
pub fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
    query: &AuthQuery,
) -> ProxyResult<Option<UserIdentity>> {
    let token = match extract_token(headers, query) {
        Some(token) => token,
        None => return Ok(None),
    };

    let store = state
        .store
        .read()
        .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))?;
    match store.resolve_token(&token) {
        Ok(Some(identity)) => Ok(Some(identity)),
        Ok(None) => {
            log::warn!(
                "Rejected unknown access token {}******",
                token.chars().take(4).collect::<String>()
            );
            Err(ProxyError::Unauthorized)
        }
        Err(e) => Err(ProxyError::Internal(e.to_string())),
    }
}

/// Axum middleware: resolves the identity once and stashes it in request
/// extensions. Requests whose token is invalid never reach a handler.
pub async fn identity_middleware(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    mut req: axum::extract::Request,
    next: Next,
) -> Result<Response, ProxyError> {
    if req.extensions().get::<UserIdentity>().is_none() {
        if let Some(identity) = resolve_identity(&state, req.headers(), &query)? {
            req.extensions_mut().insert(identity);
        }
    }
    Ok(next.run(req).await)
}

/// Guards the admin seam: the resolved identity must carry the admin role.
pub fn require_admin(identity: Option<&UserIdentity>) -> ProxyResult<UserIdentity> {
    match identity {
        Some(id) if id.role == Role::Admin => Ok(*id),
        _ => Err(ProxyError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            http::header::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn token_priority_is_bearer_then_header_then_query() {
        let mut headers = headers_with("authorization", "Bearer tok-a");
        headers.insert("x-api-key", "tok-b".parse().unwrap());
        let query = AuthQuery {
            key: Some("tok-c".into()),
        };
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("tok-a"));

        let headers = headers_with("x-api-key", "tok-b");
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("tok-b"));

        let headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, &query).as_deref(), Some("tok-c"));
        assert_eq!(extract_token(&headers, &AuthQuery::default()), None);
    }

    #[test]
    fn empty_tokens_are_ignored() {
        let headers = headers_with("authorization", "Bearer    ");
        assert_eq!(extract_token(&headers, &AuthQuery::default()), None);
    }

    #[test]
    fn admin_guard() {
        let admin = UserIdentity {
            user_id: 1,
            role: Role::Admin,
        };
        let user = UserIdentity {
            user_id: 2,
            role: Role::User,
        };
        assert!(require_admin(Some(&admin)).is_ok());
        assert!(require_admin(Some(&user)).is_err());
        assert!(require_admin(None).is_err());
    }
}
