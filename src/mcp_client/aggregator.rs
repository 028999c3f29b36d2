//! Tool aggregation: one catalogue across every connected provider.
//!
//! Each tool is exposed as `<provider>_<tool>` so identically named tools on
//! different providers never collide. The merged order is registration
//! order, then the order each provider reports its tools in.

use std::collections::HashSet;

use serde::Serialize;

use super::errors::McpError;
use super::registry::ConnectionRegistry;
use super::types::RemoteTool;

/// Joins provider name and tool name.
pub const NAMESPACE_SEPARATOR: char = '_';

/// Build the namespaced identifier for a provider's tool.
pub fn namespaced_name(provider: &str, tool: &str) -> String {
    format!("{provider}{NAMESPACE_SEPARATOR}{tool}")
}

/// Split a namespaced identifier at the first separator.
///
/// Returns `None` only when there is no separator. Empty halves are passed
/// through: an empty provider is never registered, and an empty tool name
/// is left for the provider to reject.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

// ─── ToolDescriptor ──────────────────────────────────────────────────────────

/// A provider tool as the agent loop sees it.
///
/// Built fresh on every aggregation; do not hold on to descriptors across
/// provider restarts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// `<provider>_<original_name>`.
    pub name: String,
    pub original_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub provider: String,
}

impl ToolDescriptor {
    fn from_remote(provider: &str, tool: RemoteTool) -> Self {
        Self {
            name: namespaced_name(provider, &tool.name),
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
            original_name: tool.name,
            provider: provider.to_string(),
        }
    }

    /// OpenAI function-calling shape.
    pub fn to_openai_tool(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }

    /// Anthropic tool-use shape.
    pub fn to_anthropic_tool(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}

// ─── Aggregation ─────────────────────────────────────────────────────────────

/// Merged catalogue plus the providers that could not deliver one.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub tools: Vec<ToolDescriptor>,
    pub failures: Vec<(String, McpError)>,
}

impl Aggregation {
    /// True when at least one provider failed to yield a catalogue.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Pulls and merges tool catalogues from a registry.
pub struct ToolAggregator;

impl ToolAggregator {
    /// Merged catalogue of every Ready provider. Providers whose catalogue
    /// fetch fails are logged and skipped.
    pub async fn list_tools(registry: &ConnectionRegistry) -> Vec<ToolDescriptor> {
        Self::aggregate(registry).await.tools
    }

    /// Like [`list_tools`](Self::list_tools), but also reports failures.
    ///
    /// Catalogues are fetched concurrently; results are merged in
    /// registration order regardless of which provider answers first.
    pub async fn aggregate(registry: &ConnectionRegistry) -> Aggregation {
        let sessions = registry.sessions();
        let fetches = sessions.iter().map(|session| async move {
            (session.name().to_string(), session.list_tools().await)
        });
        let results = futures::future::join_all(fetches).await;

        let mut aggregation = Aggregation::default();
        for (provider, result) in results {
            match result {
                Ok(remote_tools) => {
                    let before = aggregation.tools.len();
                    merge_provider_tools(&mut aggregation.tools, &provider, remote_tools);
                    tracing::debug!(
                        provider = %provider,
                        tools = aggregation.tools.len() - before,
                        "fetched tool catalogue"
                    );
                }
                Err(e) => {
                    tracing::error!(provider = %provider, error = %e, "error fetching tools, skipping provider");
                    aggregation.failures.push((provider, e));
                }
            }
        }

        tracing::info!(
            providers = sessions.len(),
            tools = aggregation.tools.len(),
            failed = aggregation.failures.len(),
            "aggregated tool catalogue"
        );
        aggregation
    }
}

fn merge_provider_tools(out: &mut Vec<ToolDescriptor>, provider: &str, tools: Vec<RemoteTool>) {
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.name.is_empty() {
            tracing::warn!(provider = %provider, "provider reported a tool with an empty name, skipping");
            continue;
        }
        if !seen.insert(tool.name.clone()) {
            tracing::warn!(provider = %provider, tool = %tool.name, "duplicate tool name, keeping the first");
            continue;
        }
        out.push(ToolDescriptor::from_remote(provider, tool));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
