//! The instance cache: at most one live shared instance per key, with
//! single-flight creation.
//!
//! A cold key under burst traffic must spawn exactly one backend. The map
//! mutex is held only for map mutation; creation itself runs under a per-key
//! async lock so concurrent callers for the same missing key queue behind
//! one factory run and then observe its result. Failed factories insert
//! nothing; the next caller retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::mcp::instance::SharedMcpInstance;
use crate::mcp::McpError;

/// Cache key for the service-default instance.
pub fn global_key(service_id: i64) -> String {
    format!("global-service-{}-shared", service_id)
}

/// Cache key for a per-user instance (stdio + allowed + present overrides).
pub fn user_key(user_id: i64, service_id: i64) -> String {
    format!("user-{}-service-{}-shared", user_id, service_id)
}

fn service_suffix(service_id: i64) -> String {
    format!("-service-{}-shared", service_id)
}

#[derive(Default)]
struct CacheInner {
    instances: HashMap<String, Arc<SharedMcpInstance>>,
    /// Per-key creation locks; an entry lives as long as its key is in use.
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Services with an invalidation or uninstall in flight; creation
    /// attempts are refused. Counted so the windows may nest.
    blocked_services: HashMap<i64, usize>,
}

pub struct McpInstanceCache {
    inner: Mutex<CacheInner>,
}

impl Default for McpInstanceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl McpInstanceCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Returns the cached instance or creates it via `factory` under
    /// single-flight semantics. The factory must not re-enter the cache.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        service_id: i64,
        factory: F,
    ) -> Result<Arc<SharedMcpInstance>, McpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<SharedMcpInstance>, McpError>>,
    {
        let build_lock = {
            let mut inner = self.inner.lock().expect("instance cache lock");
            if inner.blocked_services.contains_key(&service_id) {
                return Err(McpError::General(format!(
                    "service {} is being removed",
                    service_id
                )));
            }
            if let Some(existing) = inner.instances.get(key) {
                return Ok(existing.clone());
            }
            inner
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        // Everyone racing on this key queues here; the winner runs the
        // factory, the rest find the inserted instance on re-check.
        let _guard = build_lock.lock().await;

        {
            let inner = self.inner.lock().expect("instance cache lock");
            if inner.blocked_services.contains_key(&service_id) {
                return Err(McpError::General(format!(
                    "service {} is being removed",
                    service_id
                )));
            }
            if let Some(existing) = inner.instances.get(key) {
                return Ok(existing.clone());
            }
        }

        match factory().await {
            Ok(instance) => {
                let mut inner = self.inner.lock().expect("instance cache lock");
                // An invalidation may have raced the factory; refuse to
                // publish an instance built from a stale config.
                if !inner.blocked_services.contains_key(&service_id) {
                    inner.instances.insert(key.to_string(), instance.clone());
                    return Ok(instance);
                }
                drop(inner);
                let _ = instance.shutdown().await;
                Err(McpError::General(format!(
                    "service {} is being removed",
                    service_id
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Non-creating lookup.
    pub fn get(&self, key: &str) -> Option<Arc<SharedMcpInstance>> {
        self.inner
            .lock()
            .expect("instance cache lock")
            .instances
            .get(key)
            .cloned()
    }

    /// Whether a factory run for this key is currently in flight.
    pub fn is_building(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("instance cache lock");
        if inner.instances.contains_key(key) {
            return false;
        }
        match inner.locks.get(key) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// Atomically removes and returns one instance; the caller owns the
    /// shutdown.
    pub fn invalidate(&self, key: &str) -> Option<Arc<SharedMcpInstance>> {
        let mut inner = self.inner.lock().expect("instance cache lock");
        inner.locks.remove(key);
        inner.instances.remove(key)
    }

    /// Removes the global key and every user key of a service; returns the
    /// removed instances for shutdown.
    pub fn invalidate_service(&self, service_id: i64) -> Vec<Arc<SharedMcpInstance>> {
        let suffix = service_suffix(service_id);
        let mut inner = self.inner.lock().expect("instance cache lock");
        let keys: Vec<String> = inner
            .instances
            .keys()
            .filter(|k| k.ends_with(&suffix))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            inner.locks.remove(&key);
            if let Some(instance) = inner.instances.remove(&key) {
                removed.push(instance);
            }
        }
        inner
            .locks
            .retain(|k, _| !k.ends_with(&suffix));
        removed
    }

    /// Refuses instance creation for a service until the matching
    /// `unblock_service`. Blocks nest.
    pub fn block_service(&self, service_id: i64) {
        let mut inner = self.inner.lock().expect("instance cache lock");
        *inner.blocked_services.entry(service_id).or_insert(0) += 1;
    }

    pub fn unblock_service(&self, service_id: i64) {
        let mut inner = self.inner.lock().expect("instance cache lock");
        if let Some(count) = inner.blocked_services.get_mut(&service_id) {
            *count -= 1;
            if *count == 0 {
                inner.blocked_services.remove(&service_id);
            }
        }
    }

    /// Atomically checks that `service_id` is not blocked and, if so,
    /// publishes `instance` under `key`. Kept as a plain (non-async)
    /// method so the lock guard never has to live across an `.await`.
    fn try_publish(&self, service_id: i64, key: &str, instance: Arc<SharedMcpInstance>) -> bool {
        let mut inner = self.inner.lock().expect("instance cache lock");
        if inner.blocked_services.contains_key(&service_id) {
            return false;
        }
        inner.instances.insert(key.to_string(), instance);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("instance cache lock").instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
