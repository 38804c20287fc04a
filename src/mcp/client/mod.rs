mod core;
mod sse;
mod stdio;
mod streamable_http;
mod types;

pub use sse::SseClient;
pub use stdio::StdioClient;
pub use streamable_http::StreamableHttpClient;
pub use types::{proxy_client_info, BackendConfig, McpClient, McpClientResult, RunningClient};
