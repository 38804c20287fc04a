//! Process-wide shared state.
//!
//! The instance and handler caches are process singletons created once at
//! startup and reached only through their narrow operations; nothing else in
//! the crate holds mutable globals.

use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::db::MainStore;
use crate::proxy::cache::McpInstanceCache;
use crate::proxy::handler_cache::ProxyHandlerCache;
use crate::proxy::lifecycle::{LifecycleCoordinator, NoopRemover, PackageRemover};
use crate::proxy::meter::RequestMeter;
use crate::settings::Settings;

pub struct AppState {
    pub settings: Settings,
    pub store: Arc<RwLock<MainStore>>,
    pub instances: Arc<McpInstanceCache>,
    pub handlers: Arc<ProxyHandlerCache>,
    pub meter: Arc<RequestMeter>,
    pub coordinator: Arc<LifecycleCoordinator>,
    /// Root token; cancelling it drains every background task.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(settings: Settings, store: MainStore) -> Arc<Self> {
        Self::with_remover(settings, store, Arc::new(NoopRemover))
    }

    pub fn with_remover(
        settings: Settings,
        store: MainStore,
        remover: Arc<dyn PackageRemover>,
    ) -> Arc<Self> {
        let store = Arc::new(RwLock::new(store));
        let meter = Arc::new(RequestMeter::new(store.clone(), settings.stat_queue_size));
        let instances = Arc::new(McpInstanceCache::new());
        let handlers = Arc::new(ProxyHandlerCache::new());
        let coordinator = Arc::new(LifecycleCoordinator::new(
            store.clone(),
            instances.clone(),
            handlers.clone(),
            remover,
        ));
        Arc::new(Self {
            settings,
            store,
            instances,
            handlers,
            meter,
            coordinator,
            shutdown: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        Self::new(
            Settings::default(),
            MainStore::open_in_memory().expect("in-memory store"),
        )
    }
}
