use std::sync::Arc;

use tokio::sync::RwLock;

use super::types::{BackendConfig, RunningClient};

/// Shared state for the transport-specific client implementations: the
/// immutable connection config and the slot for the running session.
pub struct McpClientCore {
    pub config: BackendConfig,
    pub service: Arc<RwLock<Option<RunningClient>>>,
}

impl McpClientCore {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            service: Arc::new(RwLock::new(None)),
        }
    }
}
