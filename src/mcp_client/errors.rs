//! MCP client error types.
//!
//! `McpError` describes what went wrong talking to one provider process.
//! The remaining types are the typed results the caller-facing operations
//! return; each wraps an `McpError` as its cause where one exists.

use thiserror::Error;

/// Low-level failures while spawning, talking to, or stopping a provider.
#[derive(Debug, Error)]
pub enum McpError {
    /// The provider process could not be started.
    #[error("failed to spawn provider '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed or timed out.
    #[error("provider '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for provider '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The provider answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The provider answered, but the payload did not match the protocol.
    #[error("invalid response from provider '{server}': {reason}")]
    InvalidResponse { server: String, reason: String },

    /// The tool ran and reported failure (`isError: true`).
    #[error("tool '{tool}' reported an error: {message}")]
    ToolError { tool: String, message: String },

    /// A request did not complete in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The provider process went away mid-call.
    #[error("provider '{name}' crashed: {reason}")]
    ServerCrashed { name: String, reason: String },

    /// The session was closed locally; no request can reach the provider.
    #[error("session for provider '{name}' is closed")]
    SessionClosed { name: String },

    /// A connect was abandoned because the registry started shutting down.
    #[error("connect to provider '{name}' aborted: {reason}")]
    ConnectAborted { name: String, reason: String },

    /// The provider name cannot be used for namespacing.
    #[error("invalid provider name '{name}': {reason}")]
    InvalidProviderName { name: String, reason: String },

    /// The credential broker has nothing for this user and provider.
    #[error("user '{user_id}' has not authorized provider '{provider}'")]
    NotAuthorized { provider: String, user_id: String },

    /// Stopping the provider process failed.
    #[error("failed to shut down provider '{name}': {reason}")]
    ShutdownFailed { name: String, reason: String },
}

/// `connect` failed; the registry is unchanged for this provider.
#[derive(Debug, Error)]
#[error("failed to connect provider '{provider}': {cause}")]
pub struct ConnectError {
    pub provider: String,
    #[source]
    pub cause: McpError,
}

/// No Ready session exists for the requested provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider '{provider}' is not connected")]
pub struct NotConnectedError {
    pub provider: String,
}

/// Errors returned by tool execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The namespaced identifier has no provider separator.
    #[error("malformed tool name '{name}': expected '<provider>_<tool>'")]
    BadName { name: String },

    /// The owning provider is not (or no longer) connected.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[from] NotConnectedError),

    /// The provider failed to run the tool.
    #[error("tool '{tool}' failed: {cause}")]
    ToolFailed {
        tool: String,
        #[source]
        cause: McpError,
    },
}

impl ExecError {
    /// Whether reconnecting the provider could make a retry succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExecError::BadName { .. } => false,
            ExecError::ProviderUnavailable(_) => true,
            ExecError::ToolFailed { cause, .. } => matches!(
                cause,
                McpError::ServerCrashed { .. }
                    | McpError::TransportError { .. }
                    | McpError::Timeout { .. }
            ),
        }
    }
}
