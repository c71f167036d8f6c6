//! Provider sessions.
//!
//! A session is a live, handshake-completed connection to one provider.
//! The `Connector` trait is how the gateway obtains sessions: the stdio
//! connector spawns real processes, tests plug in fakes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::config::ProviderConfig;
use super::content::CallToolResult;
use super::errors::McpError;
use super::lifecycle::{LaunchOutcome, ProcessSupervisor, ProviderProcess};
use super::transport::{extract_result, StdioTransport};
use super::types::{InitializeResult, ListToolsResult, McpToolDefinition, PROTOCOL_VERSION};

/// Upper bound on `tools/list` pages followed per provider.
const MAX_TOOL_PAGES: usize = 32;

/// Name announced in `clientInfo`.
const CLIENT_NAME: &str = "tool-gateway";

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Operations the gateway needs from a connected provider.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Fetch the provider's full tool list.
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Invoke a provider-local tool.
    ///
    /// A JSON-RPC error answer is returned as `McpError::ServerError`.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError>;

    /// Close the session. The provider sees EOF.
    async fn disconnect(&self) -> Result<(), McpError>;
}

/// Source of provider processes and sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Start every configured provider. Per-provider failures are collected.
    ///
    /// The gateway bounds this with the launch timeout, which can only fire
    /// at an await point: an implementation that blocks the thread is not
    /// interrupted.
    async fn launch(&self, configs: &BTreeMap<String, ProviderConfig>) -> LaunchOutcome;

    /// Open a session to one provider, using its process when there is one.
    async fn connect(
        &self,
        name: &str,
        config: &ProviderConfig,
        process: Option<&mut ProviderProcess>,
    ) -> Result<Arc<dyn ToolSession>, McpError>;

    /// Release whatever the connector holds across all sessions.
    async fn close_all(&self) -> Result<(), McpError>;
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// MCP session over a child process's stdio.
pub struct StdioSession {
    name: String,
    transport: StdioTransport,
}

impl StdioSession {
    /// Take the process's pipes and complete the MCP handshake.
    ///
    /// Sends `initialize`, then the `notifications/initialized` notification.
    /// Failures carry the tail of the provider's stderr when available.
    pub async fn connect(name: &str, process: &mut ProviderProcess) -> Result<Self, McpError> {
        let (stdin, stdout) = process.take_stdio().ok_or_else(|| McpError::InitFailed {
            name: name.to_string(),
            reason: "provider stdio already claimed".into(),
        })?;
        let transport = StdioTransport::new(name, stdin, stdout);
        let process: &ProviderProcess = process;

        let init_failed = |e: McpError, process: &ProviderProcess| McpError::InitFailed {
            name: name.to_string(),
            reason: format!("{e}{}", process.stderr_suffix()),
        };

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = match transport.request("initialize", Some(params)).await {
            Ok(response) => extract_result(response).map_err(|e| init_failed(e, process))?,
            Err(e) => return Err(init_failed(e, process)),
        };

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: name.to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| init_failed(e, process))?;

        let server_info = init.server_info.as_ref();
        tracing::info!(
            server = name,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            provider = server_info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
            version = server_info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
            "session established"
        );

        Ok(Self {
            name: name.to_string(),
            transport,
        })
    }

    fn discovery_failed(&self, reason: String) -> McpError {
        McpError::DiscoveryFailed {
            name: self.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl ToolSession for StdioSession {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self
                .transport
                .request("tools/list", params)
                .await
                .map_err(|e| self.discovery_failed(e.to_string()))?;
            let result = extract_result(response).map_err(|e| self.discovery_failed(e.to_string()))?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| self.discovery_failed(format!("malformed tools/list result: {e}")))?;

            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            server = %self.name,
            pages = MAX_TOOL_PAGES,
            tools = tools.len(),
            "tool listing hit the page limit, keeping what was fetched"
        );
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;
        let result = extract_result(response)?;
        Ok(CallToolResult::from_value(&result))
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.transport.close().await;
        tracing::debug!(server = %self.name, "session closed");
        Ok(())
    }
}

// ─── StdioConnector ──────────────────────────────────────────────────────────

/// Connector backed by real child processes.
pub struct StdioConnector {
    supervisor: ProcessSupervisor,
}

impl StdioConnector {
    pub fn new() -> Self {
        Self::with_supervisor(ProcessSupervisor::new())
    }

    pub fn with_supervisor(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

impl Default for StdioConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for StdioConnector {
    /// Spawning is synchronous and returns as soon as each child exists, so
    /// the launch timeout does not apply here. Slow provider startup is
    /// covered by the connect timeout instead.
    async fn launch(&self, configs: &BTreeMap<String, ProviderConfig>) -> LaunchOutcome {
        self.supervisor.launch(configs)
    }

    async fn connect(
        &self,
        name: &str,
        _config: &ProviderConfig,
        process: Option<&mut ProviderProcess>,
    ) -> Result<Arc<dyn ToolSession>, McpError> {
        let process = process.ok_or_else(|| McpError::InitFailed {
            name: name.to_string(),
            reason: "no running process".into(),
        })?;
        let session = StdioSession::connect(name, process).await?;
        Ok(Arc::new(session))
    }

    async fn close_all(&self) -> Result<(), McpError> {
        self.supervisor.stop_stderr_forwarding().await;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
