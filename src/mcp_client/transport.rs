//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with provider child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! One request is in flight per transport at a time. The exchange lock is
//! held from the write of a request until its response is read, so requests
//! reach the provider in submission order and replies are never interleaved.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

struct Channel {
    /// `None` once the transport has been closed.
    writer: Option<BoxedWriter>,
    reader: BoxedReader,
    /// Set while a line is being written. If the writing future is dropped
    /// half-way, the next write first terminates the partial line.
    mid_write: bool,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    channel: Mutex<Channel>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::from_io(server_name, stdin, stdout)
    }

    /// Create a transport over any byte-stream pair.
    pub fn from_io<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_name: server_name.to_string(),
            channel: Mutex::new(Channel {
                writer: Some(Box::new(writer)),
                reader: BufReader::new(reader),
                mid_write: false,
            }),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Lines that are not JSON-RPC responses (server log output, stale replies
    /// to abandoned requests) are skipped. Requests the provider sends to us
    /// are answered inline: `ping` gets an empty result, anything else
    /// `METHOD_NOT_FOUND`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let line = self.encode(&req, "request")?;

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = channel
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "server stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                tracing::trace!(provider = %self.server_name, line = trimmed, "skipping non-JSON line");
                continue;
            };

            if let Some(incoming) = value.get("method").and_then(|m| m.as_str()) {
                if let Some(incoming_id) = value.get("id").cloned() {
                    let reply = reply_to_incoming(incoming, incoming_id);
                    let reply_line = self.encode(&reply, "reply")?;
                    self.write_line(&mut channel, &reply_line).await?;
                }
                continue;
            }

            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        provider = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => continue,
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = self.encode(&notification, "notification")?;
        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await
    }

    /// Close the write half. The provider sees EOF on stdin.
    pub async fn close(&self) {
        let mut channel = self.channel.lock().await;
        if let Some(mut writer) = channel.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn encode<T: serde::Serialize>(&self, message: &T, what: &str) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize {what}: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, channel: &mut Channel, line: &str) -> Result<(), McpError> {
        let resync = channel.mid_write;
        let Some(writer) = channel.writer.as_mut() else {
            return Err(McpError::SessionClosed {
                name: self.server_name.clone(),
            });
        };

        channel.mid_write = true;
        if resync {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        }
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        channel.mid_write = false;
        Ok(())
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

fn reply_to_incoming(method: &str, id: serde_json::Value) -> serde_json::Value {
    if method == "ping" {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("client does not support '{method}'"),
            }
        })
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
