//! Lifecycle operations invoked by the admin layer: enable, disable,
//! reconfigure, per-user reconfigure, uninstall.
//!
//! Persistence failures fail the operation; instance shutdown failures are
//! logged and the operation still succeeds. Uninstall blocks new instance
//! creation for the service before the package removal starts and only
//! unblocks after the soft-delete, so no instance can be created from a row
//! that is about to disappear.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::db::{MainStore, ServiceRecord, ServiceUpdate};
use crate::proxy::cache::{user_key, McpInstanceCache};
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::proxy::handler_cache::ProxyHandlerCache;

/// Seam to the external package-installation subsystem. Removal runs inside
/// the uninstall invalidation window with a bounded deadline.
#[async_trait::async_trait]
pub trait PackageRemover: Send + Sync {
    async fn remove(&self, record: &ServiceRecord) -> Result<(), String>;
}

/// Default remover for deployments where packages are managed externally.
pub struct NoopRemover;

#[async_trait::async_trait]
impl PackageRemover for NoopRemover {
    async fn remove(&self, _record: &ServiceRecord) -> Result<(), String> {
        Ok(())
    }
}

pub struct LifecycleCoordinator {
    store: Arc<RwLock<MainStore>>,
    instances: Arc<McpInstanceCache>,
    handlers: Arc<ProxyHandlerCache>,
    remover: Arc<dyn PackageRemover>,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<RwLock<MainStore>>,
        instances: Arc<McpInstanceCache>,
        handlers: Arc<ProxyHandlerCache>,
        remover: Arc<dyn PackageRemover>,
    ) -> Self {
        Self {
            store,
            instances,
            handlers,
            remover,
        }
    }

    fn store(&self) -> ProxyResult<std::sync::RwLockReadGuard<'_, MainStore>> {
        self.store
            .read()
            .map_err(|e| ProxyError::Internal(format!("store lock poisoned: {}", e)))
    }

    /// Marks a service enabled. Instances are created on demand, so no cache
    /// work is needed.
    pub async fn enable(&self, service_id: i64) -> ProxyResult<()> {
        self.store()?.set_service_enabled(service_id, true)?;
        log::info!("Service {} enabled", service_id);
        Ok(())
    }

    /// Disables a service and drains everything it had running.
    pub async fn disable(&self, service_id: i64) -> ProxyResult<()> {
        self.store()?.set_service_enabled(service_id, false)?;
        self.teardown_service(service_id).await;
        log::info!("Service {} disabled", service_id);
        Ok(())
    }

    /// Applies a configuration change. Changes that affect how instances are
    /// built drain the live ones; the next request picks up the new config.
    pub async fn reconfigure(&self, service_id: i64, update: &ServiceUpdate) -> ProxyResult<()> {
        self.store()?.update_service(service_id, update)?;
        if update.affects_instances() {
            self.teardown_service(service_id).await;
            log::info!("Service {} reconfigured, instances drained", service_id);
        }
        Ok(())
    }

    /// Invalidates one user's instance of a service, leaving the global
    /// instance and every other user untouched.
    pub async fn reconfigure_user(&self, service_id: i64, user_id: i64) -> ProxyResult<()> {
        let key = user_key(user_id, service_id);
        self.handlers.purge_key(&key);
        if let Some(instance) = self.instances.invalidate(&key) {
            if let Err(e) = instance.shutdown().await {
                log::warn!("Shutdown of {} failed: {}", key, e);
            }
        }
        Ok(())
    }

    /// Disables, removes the package, and soft-deletes the row. New instance
    /// creation is refused for the whole window.
    pub async fn uninstall(&self, service_id: i64) -> ProxyResult<()> {
        self.instances.block_service(service_id);
        let result = self.uninstall_inner(service_id).await;
        self.instances.unblock_service(service_id);
        result
    }

    async fn uninstall_inner(&self, service_id: i64) -> ProxyResult<()> {
        let record = self.store()?.get_service(service_id)?;

        self.store()?.set_service_enabled(service_id, false)?;
        self.teardown_service(service_id).await;

        match tokio::time::timeout(Duration::from_secs(30), self.remover.remove(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Package removal for {} failed: {}", record.name, e),
            Err(_) => log::warn!("Package removal for {} timed out", record.name),
        }

        self.store()?.soft_delete_service(service_id)?;
        log::info!("Service {} uninstalled", record.name);
        Ok(())
    }

    /// Shuts down every instance of a service and purges its handlers.
    /// Creation is refused for the whole window so an in-flight build from
    /// the old configuration can never publish. Individual shutdown
    /// failures are logged, never propagated.
    async fn teardown_service(&self, service_id: i64) {
        self.instances.block_service(service_id);
        let removed = self.instances.invalidate_service(service_id);
        self.handlers.purge_service(service_id);
        for instance in removed {
            if let Err(e) = instance.shutdown().await {
                log::warn!("Shutdown of {} failed (leaked): {}", instance.key(), e);
            }
        }
        self.instances.unblock_service(service_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{HealthStatus, ServiceType};
    use crate::mcp::instance::SharedMcpInstance;
    use crate::proxy::cache::global_key;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingRemover {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PackageRemover for RecordingRemover {
        async fn remove(&self, record: &ServiceRecord) -> Result<(), String> {
            assert_eq!(record.name, "echo");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn coordinator_with_service() -> (Arc<LifecycleCoordinator>, Arc<RecordingRemover>, i64) {
        let store = Arc::new(RwLock::new(MainStore::open_in_memory().unwrap()));
        let service_id = store
            .read()
            .unwrap()
            .create_service(&ServiceRecord {
                id: 0,
                name: "echo".into(),
                service_type: ServiceType::Stdio,
                enabled: true,
                deleted: false,
                health_status: HealthStatus::Unknown,
                last_health_check: None,
                health_details: None,
                command: "bash".into(),
                args_json: "[]".into(),
                headers_json: "{}".into(),
                default_envs_json: "{}".into(),
                allow_user_override: true,
                rpd_limit: 0,
                request_timeout_s: None,
                installer_user_id: None,
                created_at: None,
            })
            .unwrap();
        let remover = Arc::new(RecordingRemover {
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(LifecycleCoordinator::new(
            store,
            Arc::new(McpInstanceCache::new()),
            Arc::new(ProxyHandlerCache::new()),
            remover.clone(),
        ));
        (coordinator, remover, service_id)
    }

    async fn seed_instance(coordinator: &LifecycleCoordinator, key: &str, service_id: i64) {
        let key_clone = key.to_string();
        coordinator
            .instances
            .get_or_create(key, service_id, || async move {
                Ok(SharedMcpInstance::stub(&key_clone, service_id, "echo"))
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disable_drains_all_instances() {
        let (coordinator, _, id) = coordinator_with_service();
        seed_instance(&coordinator, &global_key(id), id).await;
        seed_instance(&coordinator, &user_key(7, id), id).await;
        let global = coordinator.instances.get(&global_key(id)).unwrap();

        coordinator.disable(id).await.unwrap();

        assert!(coordinator.instances.is_empty());
        assert!(!global.is_ready());
        let record = coordinator.store().unwrap().get_service(id).unwrap();
        assert!(!record.enabled);
    }

    #[tokio::test]
    async fn reconfigure_user_leaves_other_keys_alone() {
        let (coordinator, _, id) = coordinator_with_service();
        seed_instance(&coordinator, &global_key(id), id).await;
        seed_instance(&coordinator, &user_key(7, id), id).await;
        seed_instance(&coordinator, &user_key(8, id), id).await;
        let user7 = coordinator.instances.get(&user_key(7, id)).unwrap();

        coordinator.reconfigure_user(id, 7).await.unwrap();

        assert!(!user7.is_ready());
        assert!(coordinator.instances.get(&user_key(7, id)).is_none());
        // The global instance and user 8 keep being served.
        assert!(coordinator.instances.get(&global_key(id)).unwrap().is_ready());
        assert!(coordinator.instances.get(&user_key(8, id)).unwrap().is_ready());
    }

    #[tokio::test]
    async fn reconfigure_drains_only_on_instance_affecting_changes() {
        let (coordinator, _, id) = coordinator_with_service();
        seed_instance(&coordinator, &global_key(id), id).await;

        // rpd change: no drain.
        coordinator
            .reconfigure(
                id,
                &ServiceUpdate {
                    rpd_limit: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(coordinator.instances.get(&global_key(id)).is_some());

        // Command change: drain.
        coordinator
            .reconfigure(
                id,
                &ServiceUpdate {
                    command: Some("python3".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(coordinator.instances.get(&global_key(id)).is_none());
    }

    #[tokio::test]
    async fn uninstall_removes_package_and_soft_deletes() {
        let (coordinator, remover, id) = coordinator_with_service();
        seed_instance(&coordinator, &global_key(id), id).await;

        coordinator.uninstall(id).await.unwrap();

        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.instances.is_empty());
        let record = coordinator.store().unwrap().get_service(id).unwrap();
        assert!(record.deleted);
        // Name lookups (the dispatcher path) now miss.
        assert!(coordinator
            .store()
            .unwrap()
            .get_service_by_name("echo")
            .is_err());
        // Creation is no longer blocked once the uninstall finished.
        seed_instance(&coordinator, &global_key(id), id).await;
    }
}
