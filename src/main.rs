//! Operator CLI for synapse-mcp.
//!
//! Connects every configured provider, runs one command against the merged
//! catalogue, and always tears the providers down before exiting.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use synapse_mcp::config::{find_config_path, load_servers_config};
use synapse_mcp::{init_tracing, LogOptions, McpHub};

/// CLI arguments for synapse-mcp
#[derive(Parser, Debug)]
#[command(name = "synapse-mcp")]
#[command(author, version, about = "Multi-provider MCP tool hub")]
#[command(long_about = r#"
Connects to every MCP provider in the config file and exposes their tools
under one namespace (<provider>_<tool>).

The config file is resolved in priority order:
1. --config <path>
2. $SYNAPSE_MCP_CONFIG
3. mcp-servers.json / mcp-servers.yaml in the current directory or a parent
4. <user config dir>/synapse-mcp/

Example:
  synapse-mcp tools
  synapse-mcp call jira_create_ticket --args '{"title":"Broken build"}'
  synapse-mcp --log-file status
"#)]
struct Cli {
    /// Path to the provider config file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Write logs to this directory instead of stderr
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Write logs to the platform data directory instead of stderr
    #[arg(long, global = true, conflicts_with = "log_dir")]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the merged tool catalogue as JSON
    Tools,
    /// Call one namespaced tool and print the result as JSON
    Call {
        /// Namespaced tool name, e.g. jira_create_ticket
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, value_name = "JSON", default_value = "{}")]
        args: String,
    },
    /// Print per-provider connection status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match (&cli.log_dir, cli.log_file) {
        (Some(dir), _) => Some(dir.clone()),
        (None, true) => Some(synapse_mcp::data_dir()),
        (None, false) => None,
    };
    init_tracing(&LogOptions {
        json: cli.json_logs,
        log_dir,
    })
    .context("failed to initialize logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_servers_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let hub = McpHub::new(config.timeouts);
    for (provider, err) in hub.connect_all(&config).await {
        tracing::warn!(provider = %provider, error = %err, "provider unavailable");
    }

    let outcome = run(&hub, cli.command).await;

    let report = hub.shutdown().await;
    for (provider, err) in &report.failures {
        tracing::warn!(provider = %provider, error = %err, "provider did not shut down cleanly");
    }

    outcome
}

async fn run(hub: &McpHub, command: Command) -> Result<()> {
    let output = match command {
        Command::Tools => {
            let tools = hub.list_tools().await;
            serde_json::to_string_pretty(&tools)?
        }
        Command::Call { tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = hub.call_tool(&tool, arguments).await;
            serde_json::to_string_pretty(&result)?
        }
        Command::Status => {
            let status = hub.status().await;
            serde_json::to_string_pretty(&status)?
        }
    };
    println!("{output}");
    Ok(())
}
