//! A shared MCP instance: one backend client paired with the server surface
//! exposed downstream.
//!
//! Instances are owned exclusively by the instance cache; every other holder
//! keeps an `Arc` and observes `ready` before use. Startup is one bounded
//! sequence (transport start, handshake, capability discovery) under a single
//! deadline; a failure at any point tears the partial client down so no
//! subprocess outlives the error.

use chrono::{DateTime, Utc};
use rmcp::model::{
    PromptsCapability, ResourcesCapability, ServerCapabilities, ServerInfo, ToolsCapability,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db::{ServiceRecord, ServiceType};
use crate::mcp::client::{
    BackendConfig, McpClient, McpClientResult, SseClient, StdioClient, StreamableHttpClient,
};
use crate::mcp::McpError;

/// Counts of the capability surfaces discovered at initialization. Purely
/// diagnostic; the live listings are always relayed from the backend.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CapabilitySnapshot {
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
    pub resource_templates: usize,
}

pub struct SharedMcpInstance {
    key: String,
    service_id: i64,
    service_name: String,
    client: Arc<dyn McpClient>,
    server_info: ServerInfo,
    capabilities: CapabilitySnapshot,
    ready: AtomicBool,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl SharedMcpInstance {
    /// Builds the backend client for a service record, runs the full startup
    /// sequence under `startup_timeout`, and returns the ready instance.
    ///
    /// The caller (the instance cache) inserts the instance only after this
    /// returns; a half-started instance is never observable.
    pub async fn start(
        key: String,
        record: &ServiceRecord,
        env: Option<Vec<(String, String)>>,
        startup_timeout: Duration,
    ) -> McpClientResult<Arc<Self>> {
        let config = backend_config(record, env)?;
        let client: Arc<dyn McpClient> = match record.service_type {
            ServiceType::Stdio => Arc::new(StdioClient::new(config)?),
            ServiceType::Sse => Arc::new(SseClient::new(config)?),
            ServiceType::StreamableHttp => Arc::new(StreamableHttpClient::new(config)?),
        };

        // One deadline spans transport start, MCP handshake, and capability
        // discovery; a nested timeout here could cancel the handshake while
        // the transport is still starting.
        let startup = async {
            client.start().await?;
            Ok::<_, McpError>(discover_capabilities(client.as_ref(), &record.name).await)
        };

        let capabilities = match tokio::time::timeout(startup_timeout, startup).await {
            Ok(Ok(caps)) => caps,
            Ok(Err(e)) => {
                let _ = client.stop().await;
                return Err(e);
            }
            Err(_) => {
                let _ = client.stop().await;
                return Err(McpError::Timeout(format!(
                    "service {} startup exceeded {}s",
                    record.name,
                    startup_timeout.as_secs()
                )));
            }
        };

        let server_info = client
            .peer_info()
            .await
            .unwrap_or_else(|| default_server_info(&record.name));

        log::info!(
            "Instance {} ready: {} tools, {} prompts, {} resources",
            key,
            capabilities.tools,
            capabilities.prompts,
            capabilities.resources
        );

        let instance = Arc::new(Self {
            key,
            service_id: record.id,
            service_name: record.name.clone(),
            client,
            server_info,
            capabilities,
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        });
        Ok(instance)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn service_id(&self) -> i64 {
        self.service_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn capabilities(&self) -> CapabilitySnapshot {
        self.capabilities
    }

    /// The backend's initialize result, served downstream by the proxy
    /// handler.
    pub fn server_info(&self) -> ServerInfo {
        self.server_info.clone()
    }

    pub fn client(&self) -> Arc<dyn McpClient> {
        self.client.clone()
    }

    /// Liveness probe with its own short deadline.
    pub async fn ping(&self, deadline: Duration) -> McpClientResult<()> {
        if !self.is_ready() {
            return Err(McpError::ClientNotRunning(self.service_name.clone()));
        }
        match tokio::time::timeout(deadline, self.client.ping()).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(format!(
                "ping of {} exceeded {}s",
                self.service_name,
                deadline.as_secs()
            ))),
        }
    }

    /// Closes the backend client. Safe to call more than once; only the
    /// first call does work. In-flight relays hold their own `Arc` and
    /// observe transport EOF instead of being interrupted mid-write.
    pub async fn shutdown(&self) -> McpClientResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.store(false, Ordering::Release);
        log::info!("Shutting down instance {}", self.key);
        self.client.stop().await
    }
}

fn backend_config(
    record: &ServiceRecord,
    env: Option<Vec<(String, String)>>,
) -> McpClientResult<BackendConfig> {
    let config = match record.service_type {
        ServiceType::Stdio => BackendConfig {
            name: record.name.clone(),
            protocol: record.service_type,
            command: Some(record.command.clone()),
            args: Some(
                record
                    .args()
                    .map_err(|e| McpError::ClientConfigError(e.to_string()))?,
            ),
            env,
            url: None,
            headers: None,
            timeout: None,
        },
        ServiceType::Sse | ServiceType::StreamableHttp => BackendConfig {
            name: record.name.clone(),
            protocol: record.service_type,
            command: None,
            args: None,
            env: None,
            url: Some(record.command.clone()),
            headers: Some(
                record
                    .headers()
                    .map_err(|e| McpError::ClientConfigError(e.to_string()))?,
            ),
            timeout: record.request_timeout_s,
        },
    };
    Ok(config)
}

/// Enumerates the backend's surfaces once for diagnostics. Absent optional
/// surfaces (prompts, resources, templates) yield zero counts, not errors.
async fn discover_capabilities(client: &dyn McpClient, name: &str) -> CapabilitySnapshot {
    let mut snapshot = CapabilitySnapshot::default();

    match client.list_tools(None).await {
        Ok(result) => snapshot.tools = result.tools.len(),
        Err(e) => log::info!("Service {} does not list tools: {}", name, e),
    }
    match client.list_prompts(None).await {
        Ok(result) => snapshot.prompts = result.prompts.len(),
        Err(e) => log::info!("Service {} does not list prompts: {}", name, e),
    }
    match client.list_resources(None).await {
        Ok(result) => snapshot.resources = result.resources.len(),
        Err(e) => log::info!("Service {} does not list resources: {}", name, e),
    }
    match client.list_resource_templates(None).await {
        Ok(result) => snapshot.resource_templates = result.resource_templates.len(),
        Err(e) => log::info!("Service {} does not list resource templates: {}", name, e),
    }

    snapshot
}

fn default_server_info(name: &str) -> ServerInfo {
    let mut info = ServerInfo::default();
    info.server_info.name = name.to_string();
    info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
    info.capabilities = ServerCapabilities {
        tools: Some(ToolsCapability::default()),
        prompts: Some(PromptsCapability::default()),
        resources: Some(ResourcesCapability::default()),
        ..Default::default()
    };
    info
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::mcp::client::RunningClient;
    use tokio::sync::RwLock;

    /// A client that never connects; lets tests build instances without a
    /// live backend.
    pub struct NullClient {
        config: BackendConfig,
        service: Arc<RwLock<Option<RunningClient>>>,
    }

    impl NullClient {
        pub fn new(name: &str) -> Self {
            Self {
                config: BackendConfig {
                    name: name.to_string(),
                    protocol: ServiceType::Stdio,
                    command: Some("true".into()),
                    args: Some(Vec::new()),
                    env: None,
                    url: None,
                    headers: None,
                    timeout: None,
                },
                service: Arc::new(RwLock::new(None)),
            }
        }
    }

    #[async_trait::async_trait]
    impl McpClient for NullClient {
        fn name(&self) -> &str {
            &self.config.name
        }

        fn config(&self) -> &BackendConfig {
            &self.config
        }

        fn service(&self) -> Arc<RwLock<Option<RunningClient>>> {
            self.service.clone()
        }

        async fn perform_connect(&self) -> McpClientResult<RunningClient> {
            Err(McpError::ClientStartError("null client".into()))
        }
    }

    impl SharedMcpInstance {
        /// Builds a ready instance around a `NullClient`, for cache and
        /// handler tests.
        pub(crate) fn stub(key: &str, service_id: i64, service_name: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                service_id,
                service_name: service_name.to_string(),
                client: Arc::new(NullClient::new(service_name)),
                server_info: default_server_info(service_name),
                capabilities: CapabilitySnapshot::default(),
                ready: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                created_at: Utc::now(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_maps_command_to_url_for_remote_types() {
        let record = ServiceRecord {
            id: 1,
            name: "up".into(),
            service_type: ServiceType::StreamableHttp,
            enabled: true,
            deleted: false,
            health_status: crate::db::HealthStatus::Unknown,
            last_health_check: None,
            health_details: None,
            command: "https://up.example/mcp".into(),
            args_json: "[]".into(),
            headers_json: r#"{"authorization":"Bearer x"}"#.into(),
            default_envs_json: "{}".into(),
            allow_user_override: false,
            rpd_limit: 0,
            request_timeout_s: Some(30),
            installer_user_id: None,
            created_at: None,
        };
        let config = backend_config(&record, None).unwrap();
        assert_eq!(config.url.as_deref(), Some("https://up.example/mcp"));
        assert_eq!(config.timeout, Some(30));
        assert!(config.command.is_none());
        assert_eq!(config.headers.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let instance = SharedMcpInstance::stub("global-service-1-shared", 1, "echo");
        assert!(instance.is_ready());
        instance.shutdown().await.unwrap();
        assert!(!instance.is_ready());
        // Second call is a no-op.
        instance.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn startup_failure_does_not_build_an_instance() {
        let record = ServiceRecord {
            id: 2,
            name: "broken".into(),
            service_type: ServiceType::Stdio,
            enabled: true,
            deleted: false,
            health_status: crate::db::HealthStatus::Unknown,
            last_health_check: None,
            health_details: None,
            command: "definitely-not-a-real-binary-xyz".into(),
            args_json: "[]".into(),
            headers_json: "{}".into(),
            default_envs_json: "{}".into(),
            allow_user_override: false,
            rpd_limit: 0,
            request_timeout_s: None,
            installer_user_id: None,
            created_at: None,
        };
        let result = SharedMcpInstance::start(
            "global-service-2-shared".into(),
            &record,
            None,
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }
}
