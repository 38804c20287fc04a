//! Startup synchronizer: reconciles persisted service rows into the live
//! instance cache.
//!
//! At process start every enabled, non-deleted service gets a background
//! build of its global instance under the per-service startup deadline; a
//! failure marks the service unhealthy and never aborts startup. The same
//! pass repeats on the resync interval, which also picks up services enabled
//! after boot and rebuilds what the health monitor tore down.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::HealthStatus;
use crate::mcp::instance::SharedMcpInstance;
use crate::proxy::cache::global_key;
use crate::proxy::env::resolve_env;
use crate::state::AppState;

pub struct StartupSynchronizer {
    state: Arc<AppState>,
}

impl StartupSynchronizer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Warms the cache once, then resyncs periodically until cancellation.
    pub async fn run(self: Arc<Self>, ct: CancellationToken) {
        log::info!(
            "Startup synchronizer started, resync every {}s",
            self.state.settings.resync_interval.as_secs()
        );
        self.sync_once().await;

        let mut interval = tokio::time::interval(self.state.settings.resync_interval);
        interval.tick().await; // immediate tick consumed by the warm pass
        loop {
            tokio::select! {
                _ = interval.tick() => self.sync_once().await,
                _ = ct.cancelled() => {
                    log::info!("Startup synchronizer stopped");
                    return;
                }
            }
        }
    }

    /// Builds missing global instances for every active service, one
    /// background task per service.
    pub async fn sync_once(&self) {
        let services = {
            let store = match self.state.store.read() {
                Ok(store) => store,
                Err(e) => {
                    log::error!("Synchronizer lost the store lock: {}", e);
                    return;
                }
            };
            match store.list_active_services() {
                Ok(services) => services,
                Err(e) => {
                    log::error!("Synchronizer failed to list services: {}", e);
                    return;
                }
            }
        };

        for record in services {
            let key = global_key(record.id);
            if self.state.instances.get(&key).is_some() || self.state.instances.is_building(&key) {
                continue;
            }

            let state = self.state.clone();
            tokio::spawn(async move {
                let startup_timeout = state.settings.instance_startup_timeout;
                let env = resolve_env(&record, None);
                let factory_key = key.clone();
                let factory_record = record.clone();
                let result = state
                    .instances
                    .get_or_create(&key, record.id, move || async move {
                        SharedMcpInstance::start(factory_key, &factory_record, env, startup_timeout)
                            .await
                    })
                    .await;

                if let Err(e) = result {
                    log::warn!("Warm-up of service {} failed: {}", record.name, e);
                    if let Ok(store) = state.store.read() {
                        if let Err(e) = store.update_service_health(
                            record.id,
                            HealthStatus::Unhealthy,
                            Some(&format!("startup failed: {}", e)),
                        ) {
                            log::warn!("Failed to persist health of {}: {}", record.name, e);
                        }
                    }
                }
            });
        }
    }
}
