//! MCP client: JSON-RPC over stdio to many provider processes at once.
//!
//! This module handles:
//! - Spawning provider child processes and running the MCP handshake
//! - JSON-RPC 2.0 communication over process stdio
//! - One namespaced tool catalogue across every connected provider
//! - Routing namespaced tool calls back to the owning provider
//! - Orderly teardown (reverse connection order, no orphaned children)
//!
//! `McpHub` is the entry point; the rest is exposed for callers that want
//! to compose the pieces themselves.

pub mod aggregator;
pub mod client;
pub mod collaborators;
pub mod errors;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use aggregator::{Aggregation, ToolAggregator, ToolDescriptor, NAMESPACE_SEPARATOR};
pub use client::{IntegrationOverview, McpHub};
pub use collaborators::{CredentialBroker, IntegrationDirectory, IntegrationStatus, StaticCredentials};
pub use errors::{ConnectError, ExecError, McpError, NotConnectedError};
pub use registry::{ConnectionRegistry, ProviderStatus, SessionHandle, SessionState, ShutdownReport};
pub use router::ExecutionRouter;
pub use types::{ContentPart, LaunchSpec, ToolCallResult, ToolResult};
