//! MCP client over the legacy SSE transport: a long-lived event stream for
//! server-to-client messages plus HTTP POST for the reverse direction.

use std::{sync::Arc, time::Duration};

use reqwest::{header, Client};
use rmcp::{
    transport::{
        common::client_side_sse::ExponentialBackoff, sse_client::SseClientConfig,
        SseClientTransport,
    },
    ServiceExt as _,
};
use tokio::sync::RwLock;

use crate::db::ServiceType;
use crate::mcp::McpError;

use super::core::McpClientCore;
use super::types::{proxy_client_info, BackendConfig, McpClient, McpClientResult, RunningClient};

pub struct SseClient {
    core: McpClientCore,
}

impl SseClient {
    pub fn new(config: BackendConfig) -> McpClientResult<Self> {
        if config.protocol != ServiceType::Sse {
            return Err(McpError::ClientConfigError(format!(
                "SseClient given a {} service",
                config.protocol
            )));
        }
        if config.url.as_deref().unwrap_or_default().trim().is_empty() {
            return Err(McpError::ClientConfigError(
                "sse url must not be empty".to_string(),
            ));
        }
        Ok(SseClient {
            core: McpClientCore::new(config),
        })
    }

    /// Builds the HTTP client carrying the configured upstream headers.
    fn build_http_client(&self) -> McpClientResult<Client> {
        build_upstream_http_client(&self.core.config, /* request_timeout */ None)
    }
}

#[async_trait::async_trait]
impl McpClient for SseClient {
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
            .ok_or_else(|| McpError::ClientConfigError("sse url must not be empty".into()))?;

        let http_client = self.build_http_client()?;
        let transport_config = SseClientConfig {
            sse_endpoint: url.into(),
            retry_policy: Arc::new(ExponentialBackoff {
                max_times: Some(3),
                base_duration: Duration::from_secs(2),
            }),
            ..SseClientConfig::default()
        };

        let transport = SseClientTransport::start_with_client(http_client, transport_config)
            .await
            .map_err(|e| {
                McpError::ClientStartError(format!(
                    "sse transport to {} failed: {}",
                    config.name, e
                ))
            })?;

        proxy_client_info().serve(transport).await.map_err(|e| {
            log::error!("SSE handshake failed for {}: {}", config.name, e);
            McpError::ClientStartError(format!(
                "handshake with {} failed: {}",
                config.name, e
            ))
        })
    }
}

/// Shared reqwest client construction for the remote transports: connect
/// timeout, optional per-request timeout, and the service's upstream headers.
pub(super) fn build_upstream_http_client(
    config: &BackendConfig,
    request_timeout: Option<Duration>,
) -> McpClientResult<Client> {
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(15));

    if let Some(timeout) = request_timeout {
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
    }

    if let Some(headers) = config.headers.as_ref() {
        let mut header_map = header::HeaderMap::new();
        for (key, value) in headers {
            let name = header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::ClientConfigError(format!("bad header {}: {}", key, e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| McpError::ClientConfigError(format!("bad header {}: {}", key, e)))?;
            header_map.insert(name, value);
        }
        if !header_map.is_empty() {
            builder = builder.default_headers(header_map);
        }
    }

    builder
        .build()
        .map_err(|e| McpError::ClientConfigError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn sse_config() -> BackendConfig {
        BackendConfig {
            name: "remote".into(),
            protocol: ServiceType::Sse,
            command: None,
            args: None,
            env: None,
            url: Some("https://up.example/sse".into()),
            headers: None,
            timeout: None,
        }
    }

    #[test]
    fn rejects_missing_url() {
        let mut config = sse_config();
        config.url = Some("".into());
        assert!(SseClient::new(config).is_err());
    }

    #[test]
    fn invalid_header_name_is_a_config_error() {
        let mut config = sse_config();
        let mut headers = IndexMap::new();
        headers.insert("bad header name".to_string(), "v".to_string());
        config.headers = Some(headers);
        assert!(matches!(
            build_upstream_http_client(&config, None),
            Err(McpError::ClientConfigError(_))
        ));
    }
}
