//! McpHub, the caller-facing API of the tool orchestration core.
//!
//! Owns one `ConnectionRegistry` and exposes connect, catalogue, execute
//! and shutdown. Callers never touch the registry's session map.

use std::time::Instant;

use serde::Serialize;

use super::aggregator::{Aggregation, ToolAggregator, ToolDescriptor};
use super::collaborators::{CredentialBroker, IntegrationDirectory, IntegrationStatus};
use super::errors::{ConnectError, ExecError, McpError};
use super::registry::{ConnectionRegistry, ProviderStatus, SessionState, ShutdownReport};
use super::router::ExecutionRouter;
use super::types::{LaunchSpec, ToolCallResult};
use crate::config::{McpServersConfig, TimeoutConfig};

/// Authorization and live-session view of one provider for one user.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationOverview {
    pub provider: String,
    pub authorization: IntegrationStatus,
    pub session: SessionState,
}

// ─── McpHub ──────────────────────────────────────────────────────────────────

/// Multi-provider tool hub.
pub struct McpHub {
    registry: ConnectionRegistry,
}

impl Default for McpHub {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

impl McpHub {
    /// Create a hub with an empty registry.
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(timeouts),
        }
    }

    /// Read-only access for components that take a registry directly.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect one provider. Already-connected providers are a no-op.
    pub async fn connect(&self, name: &str, spec: &LaunchSpec) -> Result<(), ConnectError> {
        self.registry.connect(name, spec).await
    }

    /// Connect every configured provider concurrently.
    ///
    /// Returns the providers that failed (partial startup is OK). Providers
    /// are registered in the order their handshakes complete.
    pub async fn connect_all(&self, config: &McpServersConfig) -> Vec<(String, ConnectError)> {
        let attempts = config
            .servers
            .iter()
            .map(|(name, spec)| async move { (name.clone(), self.registry.connect(name, spec).await) });

        let errors: Vec<(String, ConnectError)> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        tracing::info!(
            configured = config.servers.len(),
            connected = self.registry.len(),
            failed = errors.len(),
            "provider startup complete"
        );
        errors
    }

    /// Connect a provider with credentials the broker holds for `user_id`.
    ///
    /// Broker-provided variables override those already in `spec.env`.
    pub async fn connect_with_credentials(
        &self,
        name: &str,
        spec: &LaunchSpec,
        broker: &dyn CredentialBroker,
        user_id: &str,
    ) -> Result<(), ConnectError> {
        let credentials = broker
            .credentials(user_id, name)
            .await
            .map_err(|cause| ConnectError {
                provider: name.to_string(),
                cause,
            })?
            .ok_or_else(|| ConnectError {
                provider: name.to_string(),
                cause: McpError::NotAuthorized {
                    provider: name.to_string(),
                    user_id: user_id.to_string(),
                },
            })?;

        let mut spec = spec.clone();
        spec.env.extend(credentials);
        self.registry.connect(name, &spec).await
    }

    /// Close one provider.
    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        self.registry.disconnect(name).await
    }

    /// Close every provider, most recently connected first.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.registry.close_all().await
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Merged, namespaced catalogue of every connected provider.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        ToolAggregator::list_tools(&self.registry).await
    }

    /// Catalogue plus per-provider failures.
    pub async fn aggregate(&self) -> Aggregation {
        ToolAggregator::aggregate(&self.registry).await
    }

    /// Execute a namespaced tool and return its text output.
    pub async fn execute(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, ExecError> {
        ExecutionRouter::execute(&self.registry, namespaced_name, arguments).await
    }

    /// Execute a tool and fold the outcome into a structured status.
    pub async fn call_tool(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
    ) -> ToolCallResult {
        let start = Instant::now();
        let outcome = self.execute(namespaced_name, arguments).await;
        let execution_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(output) => ToolCallResult {
                tool_name: namespaced_name.to_string(),
                success: true,
                output: Some(output),
                error: None,
                execution_time_ms,
            },
            Err(e) => ToolCallResult {
                tool_name: namespaced_name.to_string(),
                success: false,
                output: None,
                error: Some(e.to_string()),
                execution_time_ms,
            },
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Live status of every provider the hub has seen.
    pub async fn status(&self) -> Vec<ProviderStatus> {
        self.registry.status().await
    }

    /// Combine a user's authorizations with the live session state.
    pub async fn integrations(
        &self,
        user_id: &str,
        providers: &[&str],
        directory: &dyn IntegrationDirectory,
    ) -> Vec<IntegrationOverview> {
        let mut overview = Vec::with_capacity(providers.len());
        for provider in providers {
            overview.push(IntegrationOverview {
                provider: provider.to_string(),
                authorization: directory.status(user_id, provider).await,
                session: self.registry.state(provider),
            });
        }
        overview
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::collaborators::StaticCredentials;

    #[tokio::test]
    async fn test_new_hub_is_empty() {
        let hub = McpHub::default();
        assert!(hub.registry().is_empty());
        assert!(hub.list_tools().await.is_empty());
        assert!(hub.status().await.is_empty());
        assert!(hub.shutdown().await.is_clean());
    }

    #[tokio::test]
    async fn test_call_tool_reports_structured_failure() {
        let hub = McpHub::default();
        let result = hub.call_tool("notoolname", serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.output.is_none());
        assert!(result.error.unwrap().contains("malformed"));

        let result = hub.call_tool("ghost_tool", serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_connect_all_collects_failures() {
        let hub = McpHub::default();
        let mut config = McpServersConfig::default();
        config
            .servers
            .insert("ghost".into(), LaunchSpec::new("/no/such/provider"));
        config
            .servers
            .insert("bad_name".into(), LaunchSpec::new("/no/such/provider"));

        let errors = hub.connect_all(&config).await;
        let names: Vec<&str> = errors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["bad_name", "ghost"]);
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_connect_with_credentials_requires_grant() {
        let hub = McpHub::default();
        let broker = StaticCredentials::new();
        let err = hub
            .connect_with_credentials("jira", &LaunchSpec::new("jira-mcp"), &broker, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err.cause, McpError::NotAuthorized { ref user_id, .. } if user_id == "alice"));
        assert_eq!(hub.registry().state("jira"), SessionState::Disconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_with_credentials_injects_env() {
        // Reports $JIRA_TOKEN as its server name so the test can see it.
        let script = r#"read -r line
id=$(printf '%s' "$line" | sed -e 's/^.*"id":\([0-9]*\).*$/\1/')
printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"%s"}}}\n' "$id" "$JIRA_TOKEN"
cat >/dev/null"#;
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg(script)
            .env("JIRA_TOKEN", "from-config");
        let broker = StaticCredentials::new().grant(
            "alice",
            "jira",
            [("JIRA_TOKEN".to_string(), "from-broker".to_string())],
        );

        let hub = McpHub::default();
        hub.connect_with_credentials("jira", &spec, &broker, "alice")
            .await
            .unwrap();

        let status = hub.status().await;
        assert_eq!(status[0].server_name.as_deref(), Some("from-broker"));

        let overview = hub.integrations("alice", &["jira", "slack"], &broker).await;
        assert_eq!(overview[0].authorization, IntegrationStatus::Connected);
        assert_eq!(overview[0].session, SessionState::Ready);
        assert_eq!(overview[1].authorization, IntegrationStatus::Disconnected);
        assert_eq!(overview[1].session, SessionState::Disconnected);

        assert!(hub.shutdown().await.is_clean());
    }
}
