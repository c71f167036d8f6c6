//! Line-delimited JSON-RPC exchange with one provider process.
//!
//! One JSON object per line in each direction. A request holds the channel
//! from write until its response is read, so concurrent callers on the same
//! provider are served one at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Transport ───────────────────────────────────────────────────────────────

/// Both pipe ends, locked together so one exchange completes before the next.
struct Channel {
    /// `None` once the transport has been closed.
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

/// JSON-RPC transport over a provider's stdin/stdout.
pub struct StdioTransport {
    provider: String,
    next_id: AtomicU64,
    channel: Mutex<Channel>,
}

impl StdioTransport {
    pub fn new(provider: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            provider: provider.to_string(),
            next_id: AtomicU64::new(1),
            channel: Mutex::new(Channel {
                writer: Some(stdin),
                reader: BufReader::new(stdout),
            }),
        }
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.provider.clone(),
            reason,
        }
    }

    /// Write `method` as a request and read until its response arrives.
    ///
    /// Provider log lines, notifications and responses left over from a
    /// request that timed out are skipped. Requests the provider sends to us
    /// are answered in place (`ping` with an empty result, anything else with
    /// method-not-found) and never mistaken for our response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&request)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &json).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = channel
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| self.transport_error(format!("read from provider stdout: {e}")))?;
            if read == 0 {
                return Err(self.transport_error("provider closed its stdout".into()));
            }

            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(message) else {
                tracing::trace!(server = %self.provider, line = message, "ignoring non-JSON line");
                continue;
            };
            if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                self.answer_provider_request(&mut channel, method, value.get("id"))
                    .await?;
                continue;
            }

            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(response) if response.id == id => return Ok(response),
                Ok(response) => tracing::debug!(
                    server = %self.provider,
                    expected = id,
                    got = response.id,
                    "dropping response to an abandoned request"
                ),
                Err(_) => tracing::trace!(server = %self.provider, line = message, "ignoring non-response line"),
            }
        }
    }

    /// Write a notification; nothing is read back.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut json = serde_json::to_string(&notification)
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        json.push('\n');

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &json).await
    }

    /// Close the write half. The provider sees EOF on stdin.
    ///
    /// Waits for any in-flight exchange to finish first.
    pub async fn close(&self) {
        let mut channel = self.channel.lock().await;
        if let Some(mut writer) = channel.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Reply to a request the provider initiated. Notifications get nothing.
    async fn answer_provider_request(
        &self,
        channel: &mut Channel,
        method: &str,
        id: Option<&serde_json::Value>,
    ) -> Result<(), McpError> {
        let Some(id) = id else {
            tracing::trace!(server = %self.provider, method, "ignoring provider notification");
            return Ok(());
        };

        let reply = if method == "ping" {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            tracing::debug!(server = %self.provider, method, "rejecting provider request");
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": super::types::error_codes::METHOD_NOT_FOUND,
                    "message": format!("method not supported by gateway: {method}"),
                },
            })
        };

        let mut json = reply.to_string();
        json.push('\n');
        self.write_line(channel, &json).await
    }

    async fn write_line(&self, channel: &mut Channel, line: &str) -> Result<(), McpError> {
        let writer = channel
            .writer
            .as_mut()
            .ok_or_else(|| self.transport_error("transport is closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("write to provider stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("flush provider stdin: {e}")))
    }
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// The `result` of a response; an `error` object becomes `ServerError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    match (response.result, response.error) {
        (_, Some(error)) => Err(McpError::ServerError {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Err(McpError::ServerError {
            code: super::types::error_codes::INTERNAL_ERROR,
            message: "response carries neither result nor error".into(),
            data: None,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
