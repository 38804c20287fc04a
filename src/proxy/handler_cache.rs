//! Cached downstream endpoints, one per (instance key, direction).
//!
//! The SSE direction wraps the instance's server surface into rmcp's
//! `SseServer` router (`GET /sse` + `POST /message`); the HTTP direction
//! wraps it into a `StreamableHttpService` mounted at `/mcp`. Both directions
//! of one instance relay through the same backend client. The dispatcher
//! re-resolves the instance key on every request, so purging an entry here
//! together with its instance is what makes invalidation take effect.

use axum::Router;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::mcp::handler::ProxyServerHandler;
use crate::mcp::instance::SharedMcpInstance;

struct SseEntry {
    instance: Arc<SharedMcpInstance>,
    router: Router,
    /// Cancels the session loop; purging an entry closes its live streams.
    ct: CancellationToken,
}

struct HttpEntry {
    instance: Arc<SharedMcpInstance>,
    router: Router,
}

#[derive(Default)]
pub struct ProxyHandlerCache {
    sse: Mutex<HashMap<String, SseEntry>>,
    http: Mutex<HashMap<String, HttpEntry>>,
}

impl ProxyHandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the SSE-direction router for an instance, building it on
    /// first use. A cached entry bound to a different (stale) instance of
    /// the same key is torn down and rebuilt.
    pub fn sse_router(&self, instance: &Arc<SharedMcpInstance>) -> Router {
        let mut map = self.sse.lock().expect("handler cache lock");
        if let Some(entry) = map.get(instance.key()) {
            if Arc::ptr_eq(&entry.instance, instance) {
                return entry.router.clone();
            }
            entry.ct.cancel();
        }

        log::info!("Building SSE endpoint for {}", instance.key());
        let ct = CancellationToken::new();
        let config = SseServerConfig {
            // Never bound; the router is mounted by the dispatcher.
            bind: "0.0.0.0:0".parse().expect("dummy bind addr"),
            sse_path: "/sse".to_string(),
            // The endpoint event advertises this path verbatim, so it must
            // be the full external path clients can actually POST to. The
            // dispatcher forwards those POSTs without rewriting.
            post_path: format!("/proxy/{}/message", instance.service_name()),
            ct: ct.clone(),
            sse_keep_alive: Some(Duration::from_secs(30)),
        };
        let (sse_server, router) = SseServer::new(config);
        let handler_instance = instance.clone();
        let _service_ct =
            sse_server.with_service(move || ProxyServerHandler::new(handler_instance.clone()));

        map.insert(
            instance.key().to_string(),
            SseEntry {
                instance: instance.clone(),
                router: router.clone(),
                ct,
            },
        );
        router
    }

    /// Returns the HTTP-direction router (`/mcp`) for an instance, building
    /// it on first use.
    pub fn http_router(&self, instance: &Arc<SharedMcpInstance>) -> Router {
        let mut map = self.http.lock().expect("handler cache lock");
        if let Some(entry) = map.get(instance.key()) {
            if Arc::ptr_eq(&entry.instance, instance) {
                return entry.router.clone();
            }
        }

        log::info!("Building streamable-http endpoint for {}", instance.key());
        let handler_instance = instance.clone();
        let service: StreamableHttpService<ProxyServerHandler, LocalSessionManager> =
            StreamableHttpService::new(
                move || Ok(ProxyServerHandler::new(handler_instance.clone())),
                Arc::new(LocalSessionManager::default()),
                StreamableHttpServerConfig::default(),
            );
        let router = Router::new().nest_service("/mcp", service);

        map.insert(
            instance.key().to_string(),
            HttpEntry {
                instance: instance.clone(),
                router: router.clone(),
            },
        );
        router
    }

    /// Drops both directions for one instance key, cancelling live SSE
    /// sessions.
    pub fn purge_key(&self, key: &str) {
        if let Some(entry) = self.sse.lock().expect("handler cache lock").remove(key) {
            entry.ct.cancel();
        }
        self.http.lock().expect("handler cache lock").remove(key);
    }

    /// Drops every cached handler belonging to a service.
    pub fn purge_service(&self, service_id: i64) {
        let suffix = format!("-service-{}-shared", service_id);
        {
            let mut map = self.sse.lock().expect("handler cache lock");
            let keys: Vec<String> = map.keys().filter(|k| k.ends_with(&suffix)).cloned().collect();
            for key in keys {
                if let Some(entry) = map.remove(&key) {
                    entry.ct.cancel();
                }
            }
        }
        {
            let mut map = self.http.lock().expect("handler cache lock");
            map.retain(|k, _| !k.ends_with(&suffix));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caches_routers_per_instance_and_rebuilds_on_replacement() {
        let cache = ProxyHandlerCache::new();
        let instance = SharedMcpInstance::stub("global-service-1-shared", 1, "echo");

        let _first = cache.sse_router(&instance);
        assert_eq!(cache.sse.lock().unwrap().len(), 1);
        let _again = cache.sse_router(&instance);
        assert_eq!(cache.sse.lock().unwrap().len(), 1);

        // A fresh instance under the same key replaces the cached entry.
        let replacement = SharedMcpInstance::stub("global-service-1-shared", 1, "echo");
        let _rebuilt = cache.sse_router(&replacement);
        let map = cache.sse.lock().unwrap();
        assert_eq!(map.len(), 1);
        assert!(Arc::ptr_eq(
            &map.get("global-service-1-shared").unwrap().instance,
            &replacement
        ));
    }

    #[tokio::test]
    async fn purge_service_drops_both_directions() {
        let cache = ProxyHandlerCache::new();
        let global = SharedMcpInstance::stub("global-service-1-shared", 1, "echo");
        let user = SharedMcpInstance::stub("user-7-service-1-shared", 1, "echo");
        let other = SharedMcpInstance::stub("global-service-12-shared", 12, "other");

        let _ = cache.sse_router(&global);
        let _ = cache.sse_router(&user);
        let _ = cache.http_router(&global);
        let _ = cache.http_router(&other);

        cache.purge_service(1);
        assert!(cache.sse.lock().unwrap().is_empty());
        let http = cache.http.lock().unwrap();
        assert_eq!(http.len(), 1);
        assert!(http.contains_key("global-service-12-shared"));
    }
}
