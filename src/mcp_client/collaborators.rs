//! Contracts for the systems around the core.
//!
//! Authorization of third-party products and the per-user integration
//! status store live outside this crate. The hub only needs the two narrow
//! views below.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use super::errors::McpError;

/// Whether a user has authorized a provider, independent of any live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Connected,
    Disconnected,
}

/// Yields the environment a provider process needs to act for a user.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Env overrides for `provider` on behalf of `user_id`, or `None` when the
    /// user has not authorized it. Errors are broker-side failures.
    async fn credentials(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<HashMap<String, String>>, McpError>;
}

/// Tracks which providers each user has authorized.
#[async_trait]
pub trait IntegrationDirectory: Send + Sync {
    async fn status(&self, user_id: &str, provider: &str) -> IntegrationStatus;
}

/// In-memory broker and directory for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    grants: HashMap<(String, String), HashMap<String, String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user_id` authorized `provider` with the given env.
    pub fn grant(
        mut self,
        user_id: &str,
        provider: &str,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.grants.insert(
            (user_id.to_string(), provider.to_string()),
            env.into_iter().collect(),
        );
        self
    }
}

#[async_trait]
impl CredentialBroker for StaticCredentials {
    async fn credentials(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<HashMap<String, String>>, McpError> {
        Ok(self
            .grants
            .get(&(user_id.to_string(), provider.to_string()))
            .cloned())
    }
}

#[async_trait]
impl IntegrationDirectory for StaticCredentials {
    async fn status(&self, user_id: &str, provider: &str) -> IntegrationStatus {
        if self
            .grants
            .contains_key(&(user_id.to_string(), provider.to_string()))
        {
            IntegrationStatus::Connected
        } else {
            IntegrationStatus::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let broker = StaticCredentials::new().grant(
            "default_admin_user",
            "jira",
            [("JIRA_TOKEN".to_string(), "t0k3n".to_string())],
        );

        let env = broker
            .credentials("default_admin_user", "jira")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env["JIRA_TOKEN"], "t0k3n");
        assert!(broker
            .credentials("default_admin_user", "slack")
            .await
            .unwrap()
            .is_none());

        assert_eq!(
            broker.status("default_admin_user", "jira").await,
            IntegrationStatus::Connected
        );
        assert_eq!(
            broker.status("someone_else", "jira").await,
            IntegrationStatus::Disconnected
        );
    }
}
