//! Provider process sessions.
//!
//! A `Session` is one spawned provider process that has completed the
//! `initialize` handshake. It owns the child process and its JSON-RPC
//! transport; dropping it kills the process.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    InitializeResult, LaunchSpec, ListToolsResult, RemoteTool, ToolResult, PROTOCOL_VERSION,
};
use crate::config::TimeoutConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on `tools/list` pages followed for one catalogue.
const MAX_LIST_PAGES: usize = 64;

/// Stderr captured into a handshake failure is truncated to this many bytes.
const STDERR_CAPTURE_LIMIT: usize = 2000;

/// How long to wait for stderr after killing a failed process.
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A stderr line longer than this is logged in pieces.
const STDERR_LINE_LIMIT: usize = 8 * 1024;

// ─── Session ─────────────────────────────────────────────────────────────────

/// A running, initialized provider process.
pub struct Session {
    name: String,
    process: Mutex<Child>,
    pid: Option<u32>,
    transport: StdioTransport,
    init: InitializeResult,
    connected_at: DateTime<Utc>,
    timeouts: TimeoutConfig,
    stderr_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn a provider process and perform the initialization handshake.
    ///
    /// On failure every acquired resource is released before returning:
    /// the transport is closed, then the process is killed and reaped. The
    /// child is also marked kill-on-drop, so dropping this future mid-way
    /// (cancellation, an outer timeout) cannot leave an orphan behind.
    pub async fn spawn(
        name: &str,
        spec: &LaunchSpec,
        timeouts: TimeoutConfig,
    ) -> Result<Session, McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);
        if let Some(dir) = spec.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", spec.command),
        })?;
        let pid = child.id();

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                reap(&mut child, timeouts.shutdown()).await;
                return Err(McpError::SpawnFailed {
                    name: name.to_string(),
                    reason: "failed to capture stdio".into(),
                });
            }
        };
        // Drained from the start: a provider that fills the pipe before
        // answering `initialize` would otherwise block forever.
        let tail = StderrTail::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain_stderr(name.to_string(), s, tail.clone())));

        tracing::debug!(provider = %name, pid = ?pid, command = %spec.command, "spawned provider process");

        let transport = StdioTransport::new(name, stdin, stdout);

        let outcome = tokio::time::timeout(timeouts.init(), handshake(&transport, name)).await;
        let reason = match outcome {
            Ok(Ok(init)) => {
                return Ok(Session {
                    name: name.to_string(),
                    process: Mutex::new(child),
                    pid,
                    transport,
                    init,
                    connected_at: Utc::now(),
                    timeouts,
                    stderr_task,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("initialization timed out after {}ms", timeouts.init_ms),
        };

        // Roll back in reverse acquisition order: channel, then process.
        transport.close().await;
        drop(transport);
        reap(&mut child, timeouts.shutdown()).await;

        let stderr_ctx = collect_stderr_on_failure(stderr_task, &tail).await;
        if !stderr_ctx.is_empty() {
            tracing::warn!(provider = %name, stderr = %stderr_ctx, "provider stderr captured on failure");
        }

        Err(McpError::InitFailed {
            name: name.to_string(),
            reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// What the provider reported about itself during the handshake.
    pub fn server_info(&self) -> &InitializeResult {
        &self.init
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Check if the provider process is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.process.lock().await.try_wait(), Ok(None))
    }

    /// Fetch the provider's full tool catalogue, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let value = self.round_trip("tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(value).map_err(|e| McpError::InvalidResponse {
                    server: self.name.clone(),
                    reason: format!("bad tools/list result: {e}"),
                })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            provider = %self.name,
            pages = MAX_LIST_PAGES,
            "tools/list pagination limit reached, catalogue truncated"
        );
        Ok(tools)
    }

    /// Invoke one tool. A result with `is_error` set is still `Ok` here.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let value = self.round_trip("tools/call", Some(params)).await?;
        serde_json::from_value(value).map_err(|e| McpError::InvalidResponse {
            server: self.name.clone(),
            reason: format!("bad tools/call result: {e}"),
        })
    }

    /// Stop the provider: close stdin, wait for exit, kill if it lingers.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        self.transport.close().await;

        let mut process = self.process.lock().await;
        let outcome = match tokio::time::timeout(self.timeouts.shutdown(), process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(provider = %self.name, %status, "provider exited");
                Ok(())
            }
            Ok(Err(e)) => Err(McpError::ShutdownFailed {
                name: self.name.clone(),
                reason: format!("wait failed: {e}"),
            }),
            Err(_) => {
                tracing::warn!(
                    provider = %self.name,
                    grace_ms = self.timeouts.shutdown_ms,
                    "provider did not exit after stdin closed, killing"
                );
                process.kill().await.map_err(|e| McpError::ShutdownFailed {
                    name: self.name.clone(),
                    reason: format!("kill failed: {e}"),
                })
            }
        };

        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        outcome
    }

    async fn round_trip(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let response = tokio::time::timeout(
            self.timeouts.call(),
            self.transport.request(method, params),
        )
        .await
        .map_err(|_| McpError::Timeout {
            operation: format!("{method} on '{}'", self.name),
            timeout_ms: self.timeouts.call_ms,
        })?
        .map_err(|e| match e {
            McpError::TransportError { reason, .. } => McpError::ServerCrashed {
                name: self.name.clone(),
                reason,
            },
            other => other,
        })?;

        extract_result(response)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake.
async fn handshake(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;
    Ok(init)
}

// ─── Process helpers ─────────────────────────────────────────────────────────

/// Kill and reap a child we are abandoning.
async fn reap(child: &mut Child, grace: Duration) {
    let _ = child.start_kill();
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(pid = ?child.id(), "child did not exit after kill");
    }
}

/// Last bytes a provider wrote to stderr, kept for failure messages.
#[derive(Clone, Default)]
struct StderrTail {
    inner: Arc<std::sync::Mutex<TailBuffer>>,
}

#[derive(Default)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    truncated: bool,
}

impl StderrTail {
    fn push(&self, chunk: &[u8]) {
        let mut buf = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buf.bytes.extend(chunk);
        if buf.bytes.len() > STDERR_CAPTURE_LIMIT {
            let excess = buf.bytes.len() - STDERR_CAPTURE_LIMIT;
            buf.bytes.drain(..excess);
            buf.truncated = true;
        }
    }

    fn snapshot(&self) -> String {
        let buf = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (front, back) = buf.bytes.as_slices();
        let mut raw = Vec::with_capacity(buf.bytes.len());
        raw.extend_from_slice(front);
        raw.extend_from_slice(back);
        let text = String::from_utf8_lossy(&raw);
        if buf.truncated {
            format!("(truncated)...{text}")
        } else {
            text.into_owned()
        }
    }
}

/// Read a provider's stderr until EOF: keep the tail, log each line.
async fn drain_stderr(name: String, mut stderr: ChildStderr, tail: StderrTail) {
    let mut chunk = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        tail.push(&chunk[..n]);
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            log_stderr_line(&name, &line);
        }
        if pending.len() > STDERR_LINE_LIMIT {
            log_stderr_line(&name, &pending);
            pending.clear();
        }
    }

    if !pending.is_empty() {
        log_stderr_line(&name, &pending);
    }
}

fn log_stderr_line(name: &str, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end();
    if !text.is_empty() {
        tracing::debug!(provider = %name, "stderr: {text}");
    }
}

/// Wait briefly for the drain task to hit EOF, then return what it kept.
async fn collect_stderr_on_failure(task: Option<JoinHandle<()>>, tail: &StderrTail) -> String {
    if let Some(mut task) = task {
        if tokio::time::timeout(STDERR_READ_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
    }
    tail.snapshot()
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
