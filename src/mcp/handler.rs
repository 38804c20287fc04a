//! The downstream MCP server surface for one shared instance.
//!
//! Every session created by the SSE or streamable-HTTP server transport gets
//! a handler bound to the instance the dispatcher resolved; each MCP call is
//! relayed live to the backend client. Optional surfaces (prompts,
//! resources, templates) degrade to empty results when the backend lacks
//! them; tools and reads propagate backend failures to the caller.

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ErrorData, GetPromptRequestParam, GetPromptResult,
        InitializeRequestParam, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
        ListResourcesResult, ListToolsResult, PaginatedRequestParam, ReadResourceRequestParam,
        ReadResourceResult, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    ServerHandler,
};
use std::sync::Arc;

use crate::mcp::instance::SharedMcpInstance;

pub struct ProxyServerHandler {
    instance: Arc<SharedMcpInstance>,
}

impl ProxyServerHandler {
    pub fn new(instance: Arc<SharedMcpInstance>) -> Self {
        Self { instance }
    }

    fn not_ready(&self) -> ErrorData {
        ErrorData::internal_error(
            format!("service {} is shutting down", self.instance.service_name()),
            None,
        )
    }
}

impl ServerHandler for ProxyServerHandler {
    fn get_info(&self) -> ServerInfo {
        self.instance.server_info()
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        self.instance
            .client()
            .list_tools(request)
            .await
            .map_err(ErrorData::from)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        log::debug!(
            "Relaying tool call {} to service {}",
            request.name,
            self.instance.service_name()
        );
        self.instance
            .client()
            .call_tool(request)
            .await
            .map_err(ErrorData::from)
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        match self.instance.client().list_prompts(request).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(ListPromptsResult::default()),
        }
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        self.instance
            .client()
            .get_prompt(request)
            .await
            .map_err(ErrorData::from)
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        match self.instance.client().list_resources(request).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(ListResourcesResult::default()),
        }
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        self.instance
            .client()
            .read_resource(request)
            .await
            .map_err(ErrorData::from)
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, ErrorData> {
        if !self.instance.is_ready() {
            return Err(self.not_ready());
        }
        match self.instance.client().list_resource_templates(request).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(ListResourceTemplatesResult::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_the_instance_server_info() {
        let instance = SharedMcpInstance::stub("global-service-1-shared", 1, "echo");
        let handler = ProxyServerHandler::new(instance);
        let info = handler.get_info();
        assert_eq!(info.server_info.name, "echo");
        assert!(info.capabilities.tools.is_some());
    }
}
