//! MCP protocol layer: backend clients over three transports, the shared
//! instance pairing a client with its downstream server surface, and the
//! relay handler.

pub mod client;
pub mod error;
pub mod handler;
pub mod instance;

pub use error::McpError;
