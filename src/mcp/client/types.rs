use indexmap::IndexMap;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, GetPromptRequestParam,
    GetPromptResult, Implementation, InitializeRequestParam, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
    ReadResourceRequestParam, ReadResourceResult, ServerInfo,
};
use rmcp::service::{Peer, RunningService};
use rmcp::RoleClient;
use tokio::sync::RwLock;

use std::sync::Arc;
use std::time::Duration;

use crate::db::ServiceType;
use crate::mcp::McpError;

/// The live rmcp client session for one backend.
pub type RunningClient = RunningService<RoleClient, InitializeRequestParam>;

pub type McpClientResult<T> = Result<T, McpError>;

/// Connection parameters for one backend MCP server, snapshotted from the
/// service record (plus the resolved environment) at instance-construction
/// time. Later record mutation never reaches a live client.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Service name, used in diagnostics only.
    pub name: String,
    pub protocol: ServiceType,

    /// Executable for stdio backends.
    pub command: Option<String>,
    /// Argument vector for stdio backends.
    pub args: Option<Vec<String>>,
    /// Effective environment for stdio backends, already merged and ordered.
    pub env: Option<Vec<(String, String)>>,

    /// Upstream URL for sse/streamable-http backends.
    pub url: Option<String>,
    /// Request headers sent upstream for sse/streamable-http backends.
    pub headers: Option<IndexMap<String, String>>,
    /// Per-request timeout for streamable-http backends, seconds.
    pub timeout: Option<u64>,
}

/// Builds the MCP client identity announced to every backend.
pub fn proxy_client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "one-mcp-proxy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("one-mcp".to_string()),
            website_url: None,
            icons: None,
        },
    }
}

/// Uniform MCP client over one backend transport.
///
/// `perform_connect` is transport-specific; everything else is shared. After
/// `start` succeeds the runtime calls (`list_tools`, `call_tool`, `ping`, ...)
/// are safe for concurrent use; `start` and `stop` themselves are not meant
/// to race and are serialized by the owning instance.
#[async_trait::async_trait]
pub trait McpClient: Send + Sync {
    /// Service name for diagnostics.
    fn name(&self) -> &str;

    fn config(&self) -> &BackendConfig;

    /// Shared slot holding the running session.
    fn service(&self) -> Arc<RwLock<Option<RunningClient>>>;

    /// Performs the transport-specific connection and MCP handshake, without
    /// storing the session. Called by the default `start`.
    async fn perform_connect(&self) -> McpClientResult<RunningClient>;

    /// Connects and publishes the running session. The caller imposes the
    /// overall deadline; no nested timeout is introduced here.
    async fn start(&self) -> McpClientResult<()> {
        let running = self.perform_connect().await?;
        *self.service().write().await = Some(running);
        Ok(())
    }

    /// Stops the running session. Idempotent; waits a bounded time for the
    /// transport to close, then lets drop force-terminate it (for stdio this
    /// kills the subprocess).
    async fn stop(&self) -> McpClientResult<()> {
        let slot = self.service();
        let mut guard = slot.write().await;
        if let Some(running) = guard.take() {
            match tokio::time::timeout(Duration::from_secs(5), running.cancel()).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(McpError::ClientStopError(e.to_string())),
                Err(_) => {
                    log::warn!(
                        "Backend {} did not shut down within 5s, forcing transport close",
                        self.name()
                    );
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }

    /// Clones the peer handle out of the session slot so runtime calls never
    /// hold the slot lock across an await; `stop` takes the write side and
    /// would otherwise wait behind a hung backend call.
    async fn peer(&self) -> McpClientResult<Peer<RoleClient>> {
        let slot = self.service();
        let guard = slot.read().await;
        guard
            .as_ref()
            .map(|running| running.peer().clone())
            .ok_or_else(|| McpError::ClientNotRunning(self.name().to_string()))
    }

    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> McpClientResult<ListToolsResult> {
        self.peer()
            .await?
            .list_tools(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    async fn call_tool(&self, request: CallToolRequestParam) -> McpClientResult<CallToolResult> {
        self.peer()
            .await?
            .call_tool(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> McpClientResult<ListPromptsResult> {
        self.peer()
            .await?
            .list_prompts(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    async fn get_prompt(&self, request: GetPromptRequestParam) -> McpClientResult<GetPromptResult> {
        self.peer()
            .await?
            .get_prompt(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> McpClientResult<ListResourcesResult> {
        self.peer()
            .await?
            .list_resources(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
    ) -> McpClientResult<ReadResourceResult> {
        self.peer()
            .await?
            .read_resource(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> McpClientResult<ListResourceTemplatesResult> {
        self.peer()
            .await?
            .list_resource_templates(request)
            .await
            .map_err(|e| McpError::ClientCallError(e.to_string()))
    }

    /// The backend's initialize result, if the session is live.
    async fn peer_info(&self) -> Option<ServerInfo> {
        match self.peer().await {
            Ok(peer) => peer.peer_info().cloned(),
            Err(_) => None,
        }
    }

    /// Liveness probe. rmcp exposes no dedicated client ping, so a tools
    /// listing is the cheapest request that exercises the full round trip.
    async fn ping(&self) -> McpClientResult<()> {
        self.list_tools(None).await.map(|_| ())
    }
}
