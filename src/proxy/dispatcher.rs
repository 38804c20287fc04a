//! The proxy dispatcher: entry point for `/proxy/{service}/{*action}`.
//!
//! Per request: parse the action into a downstream direction, resolve the
//! service record, judge the caller, consult the rate limiter, resolve the
//! instance key (user-scoped when eligible overrides exist), obtain the
//! shared instance under single-flight, fetch the direction handler, rewrite
//! the URI to the inner endpoint path, and forward. Completion is recorded
//! asynchronously through the request meter.

use axum::{
    extract::{Path, Request, State},
    http::Uri,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt as _;

use crate::db::{ProxyRequestStat, ServiceRecord, ServiceType};
use crate::mcp::instance::SharedMcpInstance;
use crate::proxy::auth::UserIdentity;
use crate::proxy::cache::{global_key, user_key};
use crate::proxy::env::{needs_user_instance, resolve_env};
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::state::AppState;

/// Downstream transport direction selected by the action path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDirection {
    Sse,
    Http,
}

impl ProxyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyDirection::Sse => "sse",
            ProxyDirection::Http => "mcp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub direction: ProxyDirection,
    /// Inner endpoint path, leading slash restored (`/sse`, `/message`, `/mcp`).
    pub path: String,
    /// Query string carried by the action, if any.
    pub query: Option<String>,
}

/// Splits an action like `sse?x=1` into direction, path, and query. The
/// first path segment selects the direction; anything else is a 400.
pub fn parse_action(action: &str) -> ProxyResult<ParsedAction> {
    let (path_part, query) = match action.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (action, None),
    };
    let trimmed = path_part.trim_start_matches('/');
    let first = trimmed.split('/').next().unwrap_or("");

    let direction = match first {
        "sse" | "message" => ProxyDirection::Sse,
        "mcp" => ProxyDirection::Http,
        _ => return Err(ProxyError::BadAction(action.to_string())),
    };

    Ok(ParsedAction {
        direction,
        path: format!("/{}", trimmed),
        query: query.filter(|q| !q.is_empty()),
    })
}

/// Axum handler for all proxy traffic.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path((service_name, action)): Path<(String, String)>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let identity = req.extensions().get::<UserIdentity>().copied();

    let parsed = match parse_action(&action) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    let record = match resolve_service(&state, &service_name) {
        Ok(record) => record,
        Err(e) => return e.into_response(),
    };

    let user_id = match identity {
        Some(identity) => identity.user_id,
        None if state.settings.allow_anonymous => 0,
        None => return ProxyError::Unauthorized.into_response(),
    };

    if let Err(e) = state.meter.admit(&record, user_id) {
        // Denied admission leaves the counter untouched and is not recorded
        // as served traffic.
        return e.into_response();
    }

    let result = forward(&state, &record, user_id, &parsed, req).await;
    let (response, status) = match result {
        Ok(response) => {
            let status = response.status();
            (response, status)
        }
        Err(e) => {
            let status = e.status();
            (e.into_response(), status)
        }
    };

    state.meter.record(ProxyRequestStat {
        id: None,
        service_id: record.id,
        service_name: record.name.clone(),
        user_id,
        request_type: parsed.direction.as_str().to_string(),
        method,
        path: parsed.path.clone(),
        status_code: status.as_u16(),
        success: status.is_success(),
        elapsed_ms: started.elapsed().as_millis() as i64,
        created_at: None,
    });

    response
}

fn resolve_service(state: &AppState, name: &str) -> ProxyResult<ServiceRecord> {
    let store = state
        .store
        .read()
        .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))?;
    let record = store.get_service_by_name(name).map_err(|e| match e {
        crate::db::StoreError::NotFound(_) => ProxyError::ServiceNotFound(name.to_string()),
        other => ProxyError::Internal(other.to_string()),
    })?;
    if !record.enabled || record.deleted {
        return Err(ProxyError::ServiceDisabled(record.name));
    }
    Ok(record)
}

/// Resolves the instance key and effective environment for this caller.
fn resolve_instance_key(
    state: &AppState,
    record: &ServiceRecord,
    user_id: i64,
) -> ProxyResult<(String, Option<Vec<(String, String)>>)> {
    let overrides = if record.service_type == ServiceType::Stdio
        && record.allow_user_override
        && user_id != 0
    {
        let store = state
            .store
            .read()
            .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))?;
        store
            .get_user_env(record.id, user_id)
            .map_err(|e| ProxyError::Internal(e.to_string()))?
    } else {
        None
    };

    if needs_user_instance(record, overrides.is_some()) {
        Ok((
            user_key(user_id, record.id),
            resolve_env(record, overrides.as_ref()),
        ))
    } else {
        Ok((global_key(record.id), resolve_env(record, None)))
    }
}

async fn forward(
    state: &Arc<AppState>,
    record: &ServiceRecord,
    user_id: i64,
    parsed: &ParsedAction,
    mut req: Request,
) -> ProxyResult<Response> {
    let (key, env) = resolve_instance_key(state, record, user_id)?;

    let startup_timeout = state.settings.instance_startup_timeout;
    let factory_record = record.clone();
    let factory_key = key.clone();
    let instance = state
        .instances
        .get_or_create(&key, record.id, move || async move {
            SharedMcpInstance::start(factory_key, &factory_record, env, startup_timeout).await
        })
        .await
        .map_err(|e| ProxyError::StartupFailed {
            service: record.name.clone(),
            detail: e.to_string(),
        })?;

    let router = match parsed.direction {
        ProxyDirection::Sse => state.handlers.sse_router(&instance),
        ProxyDirection::Http => state.handlers.http_router(&instance),
    };

    // Message POSTs target the endpoint path advertised on the SSE stream,
    // which is the full external path; everything else is rewritten to the
    // inner endpoint.
    if !parsed.path.starts_with("/message") {
        rewrite_uri(&mut req, parsed)?;
    }

    match router.oneshot(req).await {
        Ok(response) => Ok(response),
        Err(never) => match never {},
    }
}

/// Points the request at the inner endpoint path, preserving the query
/// string byte-for-byte.
fn rewrite_uri(req: &mut Request, parsed: &ParsedAction) -> ProxyResult<()> {
    let query = req
        .uri()
        .query()
        .map(str::to_string)
        .or_else(|| parsed.query.clone());
    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{}?{}", parsed.path, q),
        _ => parsed.path.clone(),
    };

    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| ProxyError::Internal(format!("bad rewritten uri: {}", e)))?,
    );
    *req.uri_mut() =
        Uri::from_parts(parts).map_err(|e| ProxyError::Internal(format!("bad uri parts: {}", e)))?;
    Ok(())
}

/// Resolves the instance an incoming request would be served by, without
/// creating anything. Used by the health endpoint.
pub fn peek_global_instance(state: &AppState, service_id: i64) -> Option<Arc<SharedMcpInstance>> {
    state.instances.get(&global_key(service_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_selects_direction_and_preserves_path() {
        let parsed = parse_action("sse").unwrap();
        assert_eq!(parsed.direction, ProxyDirection::Sse);
        assert_eq!(parsed.path, "/sse");
        assert_eq!(parsed.query, None);

        let parsed = parse_action("message").unwrap();
        assert_eq!(parsed.direction, ProxyDirection::Sse);
        assert_eq!(parsed.path, "/message");

        let parsed = parse_action("mcp").unwrap();
        assert_eq!(parsed.direction, ProxyDirection::Http);
        assert_eq!(parsed.path, "/mcp");
    }

    #[test]
    fn action_query_round_trips() {
        let parsed = parse_action("sse?x=1").unwrap();
        assert_eq!(parsed.path, "/sse");
        assert_eq!(parsed.query.as_deref(), Some("x=1"));
        // Re-encoding produces a byte-equivalent request target.
        assert_eq!(
            format!("{}?{}", parsed.path, parsed.query.unwrap()),
            "/sse?x=1"
        );
    }

    #[test]
    fn leading_slash_is_trimmed() {
        let parsed = parse_action("/message?sessionId=abc").unwrap();
        assert_eq!(parsed.direction, ProxyDirection::Sse);
        assert_eq!(parsed.path, "/message");
        assert_eq!(parsed.query.as_deref(), Some("sessionId=abc"));
    }

    #[test]
    fn empty_and_unknown_actions_are_400() {
        assert!(matches!(parse_action(""), Err(ProxyError::BadAction(_))));
        assert!(matches!(parse_action("/"), Err(ProxyError::BadAction(_))));
        assert!(matches!(
            parse_action("events"),
            Err(ProxyError::BadAction(_))
        ));
        assert!(matches!(
            parse_action("mcpx"),
            Err(ProxyError::BadAction(_))
        ));
    }

    #[tokio::test]
    async fn unknown_services_404_and_disabled_services_503() {
        let state = crate::state::AppState::for_tests();
        assert!(matches!(
            resolve_service(&state, "ghost"),
            Err(ProxyError::ServiceNotFound(_))
        ));

        let id = {
            let store = state.store.read().unwrap();
            store
                .create_service(&ServiceRecord {
                    id: 0,
                    name: "echo".into(),
                    service_type: ServiceType::Stdio,
                    enabled: false,
                    deleted: false,
                    health_status: crate::db::HealthStatus::Unknown,
                    last_health_check: None,
                    health_details: None,
                    command: "bash".into(),
                    args_json: "[]".into(),
                    headers_json: "{}".into(),
                    default_envs_json: "{}".into(),
                    allow_user_override: false,
                    rpd_limit: 0,
                    request_timeout_s: None,
                    installer_user_id: None,
                    created_at: None,
                })
                .unwrap()
        };
        assert!(matches!(
            resolve_service(&state, "echo"),
            Err(ProxyError::ServiceDisabled(_))
        ));

        {
            let store = state.store.read().unwrap();
            store.set_service_enabled(id, true).unwrap();
        }
        assert!(resolve_service(&state, "echo").is_ok());

        // Soft deletion hides the row again.
        {
            let store = state.store.read().unwrap();
            store.soft_delete_service(id).unwrap();
        }
        assert!(matches!(
            resolve_service(&state, "echo"),
            Err(ProxyError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn user_with_override_gets_user_key_others_share_global() {
        use indexmap::IndexMap;

        let state = crate::state::AppState::for_tests();
        let service_id = {
            let store = state.store.read().unwrap();
            store
                .create_service(&ServiceRecord {
                    id: 0,
                    name: "echo".into(),
                    service_type: ServiceType::Stdio,
                    enabled: true,
                    deleted: false,
                    health_status: crate::db::HealthStatus::Unknown,
                    last_health_check: None,
                    health_details: None,
                    command: "bash".into(),
                    args_json: r#"["-c","cat"]"#.into(),
                    headers_json: "{}".into(),
                    default_envs_json: r#"{"X":"1"}"#.into(),
                    allow_user_override: true,
                    rpd_limit: 0,
                    request_timeout_s: None,
                    installer_user_id: None,
                    created_at: None,
                })
                .unwrap()
        };
        let record = state
            .store
            .read()
            .unwrap()
            .get_service(service_id)
            .unwrap();

        {
            let store = state.store.read().unwrap();
            let mut envs = IndexMap::new();
            envs.insert("X".to_string(), "2".to_string());
            store.set_user_env(service_id, 7, &envs).unwrap();
        }

        // User 7 has an override: user-scoped key with the merged env.
        let (key, env) = resolve_instance_key(&state, &record, 7).unwrap();
        assert_eq!(key, user_key(7, service_id));
        assert_eq!(
            env.unwrap(),
            vec![("X".to_string(), "2".to_string())]
        );

        // User 8 has none: global key with the defaults.
        let (key, env) = resolve_instance_key(&state, &record, 8).unwrap();
        assert_eq!(key, global_key(service_id));
        assert_eq!(env.unwrap(), vec![("X".to_string(), "1".to_string())]);

        // Anonymous traffic always shares the global instance.
        let (key, _) = resolve_instance_key(&state, &record, 0).unwrap();
        assert_eq!(key, global_key(service_id));
    }

    #[tokio::test]
    async fn override_ignored_when_policy_disallows() {
        use indexmap::IndexMap;

        let state = crate::state::AppState::for_tests();
        let service_id = {
            let store = state.store.read().unwrap();
            store
                .create_service(&ServiceRecord {
                    id: 0,
                    name: "locked".into(),
                    service_type: ServiceType::Stdio,
                    enabled: true,
                    deleted: false,
                    health_status: crate::db::HealthStatus::Unknown,
                    last_health_check: None,
                    health_details: None,
                    command: "bash".into(),
                    args_json: "[]".into(),
                    headers_json: "{}".into(),
                    default_envs_json: r#"{"X":"1"}"#.into(),
                    allow_user_override: false,
                    rpd_limit: 0,
                    request_timeout_s: None,
                    installer_user_id: None,
                    created_at: None,
                })
                .unwrap()
        };
        let record = state
            .store
            .read()
            .unwrap()
            .get_service(service_id)
            .unwrap();
        {
            let store = state.store.read().unwrap();
            let mut envs = IndexMap::new();
            envs.insert("X".to_string(), "2".to_string());
            store.set_user_env(service_id, 7, &envs).unwrap();
        }

        let (key, env) = resolve_instance_key(&state, &record, 7).unwrap();
        assert_eq!(key, global_key(service_id));
        assert_eq!(env.unwrap(), vec![("X".to_string(), "1".to_string())]);
    }
}
