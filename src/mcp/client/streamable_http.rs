//! MCP client over the single-endpoint streamable-HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig, StreamableHttpClientTransport,
    },
    ServiceExt as _,
};
use tokio::sync::RwLock;

use crate::db::ServiceType;
use crate::mcp::McpError;

use super::core::McpClientCore;
use super::sse::build_upstream_http_client;
use super::types::{proxy_client_info, BackendConfig, McpClient, McpClientResult, RunningClient};

pub struct StreamableHttpClient {
    core: McpClientCore,
}

impl StreamableHttpClient {
    pub fn new(config: BackendConfig) -> McpClientResult<Self> {
        if config.protocol != ServiceType::StreamableHttp {
            return Err(McpError::ClientConfigError(format!(
                "StreamableHttpClient given a {} service",
                config.protocol
            )));
        }
        if config.url.as_deref().unwrap_or_default().trim().is_empty() {
            return Err(McpError::ClientConfigError(
                "streamable-http url must not be empty".to_string(),
            ));
        }
        Ok(StreamableHttpClient {
            core: McpClientCore::new(config),
        })
    }
}

#[async_trait::async_trait]
impl McpClient for StreamableHttpClient {
    fn name(&self) -> &str {
        &self.core.config.name
    }

    fn config(&self) -> &BackendConfig {
        &self.core.config
    }

    fn service(&self) -> Arc<RwLock<Option<RunningClient>>> {
        self.core.service.clone()
    }

    async fn perform_connect(&self) -> McpClientResult<RunningClient> {
        let config = &self.core.config;
        let url = config
            .url
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                McpError::ClientConfigError("streamable-http url must not be empty".into())
            })?;

        let request_timeout = config.timeout.map(Duration::from_secs);
        let http_client = build_upstream_http_client(config, request_timeout)?;

        let transport_config = StreamableHttpClientTransportConfig {
            uri: Arc::from(url),
            ..Default::default()
        };
        let transport = StreamableHttpClientTransport::with_client(http_client, transport_config);

        proxy_client_info().serve(transport).await.map_err(|e| {
            log::error!("Streamable-http handshake failed for {}: {}", config.name, e);
            McpError::ClientStartError(format!(
                "handshake with {} failed: {}",
                config.name, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_url() {
        let config = BackendConfig {
            name: "remote".into(),
            protocol: ServiceType::StreamableHttp,
            command: None,
            args: None,
            env: None,
            url: None,
            headers: None,
            timeout: Some(30),
        };
        assert!(StreamableHttpClient::new(config).is_err());
    }
}
