//! Route assembly: the proxy surface, the admin seam, and the health read
//! endpoint.

use axum::{
    extract::{Path, State},
    middleware,
    response::IntoResponse,
    routing::{any, delete, get, post, put},
    Extension, Json, Router,
};
use http::StatusCode;
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::db::ServiceUpdate;
use crate::proxy::auth::{identity_middleware, require_admin, UserIdentity};
use crate::proxy::dispatcher::{self, peek_global_instance};
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::state::AppState;

/// Builds the full application router.
pub fn routes(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin_routes = Router::new()
        .route("/services/health", get(service_health))
        .route("/services/{id}/enable", post(enable_service))
        .route("/services/{id}/disable", post(disable_service))
        .route("/services/{id}/reconfigure", post(reconfigure_service))
        .route("/services/{id}", delete(uninstall_service))
        .route("/services/{id}/users/{user_id}/env", put(set_user_env));

    log_registered_routes();

    Router::new()
        .route("/", get(|| async { "one-mcp proxy is running." }))
        .route(
            "/favicon.ico",
            get(|| async { (StatusCode::NOT_FOUND, "") }),
        )
        .route("/proxy/{service}/{*action}", any(dispatcher::dispatch))
        .route("/proxy/{service}", any(bad_action))
        .nest("/api", admin_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            identity_middleware,
        ))
        .layer(cors)
        .with_state(state)
}

fn log_registered_routes() {
    log::info!("--- one-mcp routes registered ---");
    log::info!("[Proxy]");
    log::info!("  - GET  /proxy/{{service}}/sse");
    log::info!("  - POST /proxy/{{service}}/message");
    log::info!("  - GET|POST /proxy/{{service}}/mcp");
    log::info!("[Admin]");
    log::info!("  - GET    /api/services/health");
    log::info!("  - POST   /api/services/{{id}}/enable | /disable | /reconfigure");
    log::info!("  - DELETE /api/services/{{id}}");
    log::info!("  - PUT    /api/services/{{id}}/users/{{user_id}}/env");
    log::info!("---------------------------------");
}

fn admin(identity: Option<&Extension<UserIdentity>>) -> ProxyResult<UserIdentity> {
    require_admin(identity.map(|Extension(id)| id))
}

/// `/proxy/{service}` without an action selects no direction.
async fn bad_action() -> ProxyError {
    ProxyError::BadAction(String::new())
}

/// Per-service health snapshot: persisted fields plus live instance
/// diagnostics when one exists.
async fn service_health(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<UserIdentity>>,
) -> ProxyResult<impl IntoResponse> {
    admin(identity.as_ref())?;
    let services = state
        .store
        .read()
        .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))?
        .list_services()?;

    let rows: Vec<serde_json::Value> = services
        .iter()
        .map(|record| {
            let instance = peek_global_instance(&state, record.id);
            json!({
                "id": record.id,
                "name": record.name,
                "type": record.service_type.to_string(),
                "enabled": record.enabled,
                "healthStatus": record.health_status.as_str(),
                "lastHealthCheck": record.last_health_check,
                "healthDetails": record.health_details,
                "instance": instance.map(|i| json!({
                    "key": i.key(),
                    "createdAt": i.created_at(),
                    "capabilities": i.capabilities(),
                })),
            })
        })
        .collect();

    Ok(Json(json!({ "services": rows })))
}

async fn enable_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    identity: Option<Extension<UserIdentity>>,
) -> ProxyResult<impl IntoResponse> {
    admin(identity.as_ref())?;
    state.coordinator.enable(id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn disable_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    identity: Option<Extension<UserIdentity>>,
) -> ProxyResult<impl IntoResponse> {
    admin(identity.as_ref())?;
    state.coordinator.disable(id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn reconfigure_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    identity: Option<Extension<UserIdentity>>,
    Json(update): Json<ServiceUpdate>,
) -> ProxyResult<impl IntoResponse> {
    admin(identity.as_ref())?;
    state.coordinator.reconfigure(id, &update).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn uninstall_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    identity: Option<Extension<UserIdentity>>,
) -> ProxyResult<impl IntoResponse> {
    admin(identity.as_ref())?;
    state.coordinator.uninstall(id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Replaces one user's env override map and drains their instance so the
/// next request picks the new environment up.
async fn set_user_env(
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(i64, i64)>,
    identity: Option<Extension<UserIdentity>>,
    Json(envs): Json<IndexMap<String, String>>,
) -> ProxyResult<impl IntoResponse> {
    admin(identity.as_ref())?;
    {
        let store = state
            .store
            .read()
            .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))?;
        store
            .set_user_env(id, user_id, &envs)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
    }
    state.coordinator.reconfigure_user(id, user_id).await?;
    Ok(Json(json!({ "ok": true })))
}
