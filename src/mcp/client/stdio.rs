//! MCP client over a stdio subprocess.
//!
//! The child is spawned with the effective environment already merged by the
//! env resolver; its stdin/stdout carry MCP framed JSON. On Unix the child
//! gets its own process group so terminating it never signals the proxy.

use rmcp::{transport::TokioChildProcess, ServiceExt as _};
use std::sync::Arc;
use tokio::{process::Command, sync::RwLock};

use crate::db::ServiceType;
use crate::mcp::McpError;

use super::core::McpClientCore;
use super::types::{proxy_client_info, BackendConfig, McpClient, McpClientResult, RunningClient};

#[cfg(unix)]
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;

pub struct StdioClient {
    core: McpClientCore,
}

impl StdioClient {
    /// Validates the config and builds the client. The process is not
    /// spawned until `start`.
    pub fn new(config: BackendConfig) -> McpClientResult<Self> {
        if config.protocol != ServiceType::Stdio {
            return Err(McpError::ClientConfigError(format!(
                "StdioClient given a {} service",
                config.protocol
            )));
        }
        if config.command.as_deref().unwrap_or_default().trim().is_empty() {
            return Err(McpError::ClientConfigError(
                "stdio command must not be empty".to_string(),
            ));
        }
        Ok(StdioClient {
            core: McpClientCore::new(config),
        })
    }
}

#[async_trait::async_trait]
impl McpClient for StdioClient {
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
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| McpError::ClientConfigError("stdio command must not be empty".into()))?;

        log::info!("Spawning stdio backend for {}: {}", config.name, command);

        let mut cmd = Command::new(command);
        if let Some(args) = config.args.as_ref() {
            cmd.args(args.iter().filter_map(|s| {
                let s = s.trim();
                (!s.is_empty()).then_some(s)
            }));
        }
        if let Some(env) = config.env.as_ref() {
            cmd.envs(env.iter().filter_map(|(k, v)| {
                let k = k.trim();
                (!k.is_empty()).then_some((k, v.as_str()))
            }));
        }

        // A separate process group keeps child signals away from the proxy.
        #[cfg(unix)]
        cmd.process_group(0);

        let process = TokioChildProcess::new(cmd).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                McpError::ClientStartError(format!(
                    "command {} not found for service {}",
                    command, config.name
                ))
            } else {
                McpError::ClientStartError(format!(
                    "failed to spawn {} for service {}: {}",
                    command, config.name, e
                ))
            }
        })?;

        proxy_client_info().serve(process).await.map_err(|e| {
            log::error!("Stdio handshake failed for {}: {}", config.name, e);
            McpError::ClientStartError(format!(
                "handshake with {} failed: {}",
                config.name, e
            ))
        })
    }
}
