//! Execution routing: namespaced tool name to owning provider.

use super::aggregator::split_namespaced;
use super::errors::{ExecError, McpError, NotConnectedError};
use super::registry::ConnectionRegistry;
use super::types::ToolResult;

/// Resolves namespaced tool calls against a registry.
pub struct ExecutionRouter;

impl ExecutionRouter {
    /// Run a tool and return its text output.
    ///
    /// The output is the lossy text projection of the provider's result
    /// (see [`ToolResult::text`]); use [`execute_raw`](Self::execute_raw)
    /// to keep non-text parts.
    pub async fn execute(
        registry: &ConnectionRegistry,
        namespaced_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ExecError> {
        let result = Self::execute_raw(registry, namespaced_name, arguments).await?;
        let dropped = result.non_text_parts();
        if dropped > 0 {
            tracing::debug!(
                tool = %namespaced_name,
                dropped,
                "non-text content parts dropped from tool output"
            );
        }
        Ok(result.text())
    }

    /// Run a tool and return the provider's full result.
    ///
    /// A result flagged `isError` by the provider is returned as
    /// `ExecError::ToolFailed` carrying the result's text.
    pub async fn execute_raw(
        registry: &ConnectionRegistry,
        namespaced_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ExecError> {
        let (provider, tool) =
            split_namespaced(namespaced_name).ok_or_else(|| ExecError::BadName {
                name: namespaced_name.to_string(),
            })?;

        let session = registry.get_session(provider)?;

        tracing::info!(provider = %provider, tool = %tool, "executing tool");
        let result = session
            .call_tool(tool, arguments)
            .await
            .map_err(|cause| call_failure(provider, namespaced_name, cause))?;

        if result.is_error {
            let message = result.text();
            tracing::warn!(provider = %provider, tool = %tool, error = %message, "tool reported failure");
            return Err(ExecError::ToolFailed {
                tool: namespaced_name.to_string(),
                cause: McpError::ToolError {
                    tool: tool.to_string(),
                    message,
                },
            });
        }

        Ok(result)
    }
}

/// A session closed between lookup and call means the provider was
/// disconnected, not that the tool failed.
fn call_failure(provider: &str, namespaced_name: &str, cause: McpError) -> ExecError {
    match cause {
        McpError::SessionClosed { .. } => ExecError::ProviderUnavailable(NotConnectedError {
            provider: provider.to_string(),
        }),
        cause => ExecError::ToolFailed {
            tool: namespaced_name.to_string(),
            cause,
        },
    }
}
