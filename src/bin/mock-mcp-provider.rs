//! Stub MCP provider for process-level tests.
//!
//! Speaks line-delimited JSON-RPC on stdio and exits when stdin closes.
//! Behavior is driven entirely by flags so one binary can play every
//! provider a test needs.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "mock-mcp-provider")]
struct Args {
    /// Server name reported in `initialize`
    #[arg(long, default_value = "mock")]
    name: String,

    /// Tools to advertise, comma separated
    #[arg(long, value_delimiter = ',', default_value = "echo")]
    tools: Vec<String>,

    /// Tools per `tools/list` page (0 = everything on one page)
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    /// Delay before answering `initialize`
    #[arg(long, default_value_t = 0)]
    init_delay_ms: u64,

    /// Exit with a message on stderr instead of answering `initialize`
    #[arg(long)]
    fail_init: bool,

    /// Answer `tools/list` with a JSON-RPC error
    #[arg(long)]
    fail_list: bool,

    /// Tool that reports `isError: true`
    #[arg(long)]
    error_tool: Option<String>,

    /// Tool that never answers
    #[arg(long)]
    hang_tool: Option<String>,

    /// Append this process's pid to the file on startup
    #[arg(long)]
    spawn_log: Option<PathBuf>,

    /// Append the arguments of every `tools/call`, in arrival order
    #[arg(long)]
    call_log: Option<PathBuf>,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.spawn_log {
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(log, "{}", std::process::id())?;
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            // Notification.
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method {
            "initialize" => {
                if args.fail_init {
                    eprintln!("mock provider refused to initialize");
                    std::process::exit(3);
                }
                std::thread::sleep(Duration::from_millis(args.init_delay_ms));
                ok(
                    &id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": args.name, "version": "0.0.1" }
                    }),
                )
            }
            "tools/list" if args.fail_list => err(&id, -32603, "catalogue unavailable"),
            "tools/list" => list_tools(&args, &id, &params),
            "tools/call" => {
                let tool = params["name"].as_str().unwrap_or_default();
                if let Some(path) = &args.call_log {
                    let mut log = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    writeln!(log, "{}", params["arguments"])?;
                }
                if args.hang_tool.as_deref() == Some(tool) {
                    continue;
                }
                call_tool(&args, &id, tool, &params["arguments"])
            }
            _ => err(&id, -32601, &format!("method not found: {method}")),
        };

        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }

    Ok(())
}

fn list_tools(args: &Args, id: &Value, params: &Value) -> Value {
    let start: usize = params["cursor"]
        .as_str()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let page = if args.page_size == 0 {
        args.tools.len()
    } else {
        args.page_size
    };
    let end = (start + page).min(args.tools.len());

    let tools: Vec<Value> = args.tools[start.min(end)..end]
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("{name} on {}", args.name),
                "inputSchema": { "type": "object" }
            })
        })
        .collect();

    let mut result = json!({ "tools": tools });
    if end < args.tools.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    ok(id, result)
}

fn call_tool(args: &Args, id: &Value, tool: &str, arguments: &Value) -> Value {
    if !args.tools.iter().any(|t| t == tool) {
        return err(id, -32602, &format!("unknown tool: {tool}"));
    }
    if args.error_tool.as_deref() == Some(tool) {
        return ok(
            id,
            json!({
                "content": [{ "type": "text", "text": format!("{tool} failed") }],
                "isError": true
            }),
        );
    }
    ok(
        id,
        json!({
            "content": [
                { "type": "text", "text": format!("{}.{tool}", args.name) },
                { "type": "image", "data": "iVBORw0KGgo=", "mimeType": "image/png" },
                { "type": "text", "text": arguments.to_string() }
            ]
        }),
    )
}

fn ok(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn err(id: &Value, code: i32, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
