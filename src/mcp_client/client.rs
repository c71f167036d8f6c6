//! Gateway: high-level interface for tool discovery and execution.
//!
//! Orchestrates provider lifecycle, the merged tool catalog, and call
//! dispatch. This is the API the calling agent uses.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::config::{load_config, resolve_config_path, GatewayConfig, ProviderConfig};
use super::content::server_error_result;
use super::errors::McpError;
use super::lifecycle::{terminate, LaunchOutcome, ProviderProcess};
use super::registry::{split_namespaced, ToolCatalog};
use super::session::{Connector, StdioConnector, ToolSession};
use super::shutdown;
use super::types::{McpToolDefinition, ToolDeclaration, ToolResult};

// ─── Phase ───────────────────────────────────────────────────────────────────

/// Where the gateway is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ─── State & Reports ─────────────────────────────────────────────────────────

/// Everything that changes after construction. Never locked across a
/// provider round-trip.
pub(super) struct GatewayState {
    pub(super) phase: Phase,
    pub(super) sessions: BTreeMap<String, Arc<dyn ToolSession>>,
    pub(super) processes: BTreeMap<String, ProviderProcess>,
    pub(super) catalog: ToolCatalog,
    /// Completed initialization passes, whatever their outcome.
    pub(super) passes: u64,
}

impl GatewayState {
    fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
            sessions: BTreeMap::new(),
            processes: BTreeMap::new(),
            catalog: ToolCatalog::default(),
            passes: 0,
        }
    }
}

/// Outcome of an initialization pass.
#[derive(Debug, Default)]
pub struct InitReport {
    /// Providers with a live session.
    pub ready: Vec<String>,
    /// Providers that failed a step. A discovery failure also appears here
    /// although its session stays up with no tools.
    pub failures: Vec<(String, McpError)>,
    pub tool_count: usize,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub phase: Phase,
    /// Every provider in the config, in name order.
    pub configured: Vec<String>,
    /// Providers with a live session, in name order.
    pub ready: Vec<String>,
    /// Catalog entries per ready provider.
    pub tools_per_provider: BTreeMap<String, usize>,
    pub tool_count: usize,
}

/// Result of one provider's connect + discover step.
struct ConnectAttempt {
    name: String,
    process: Option<ProviderProcess>,
    session: Option<Arc<dyn ToolSession>>,
    tools: Vec<McpToolDefinition>,
    error: Option<McpError>,
}

// ─── McpGateway ──────────────────────────────────────────────────────────────

/// Multi-provider tool gateway.
///
/// Launches the configured providers, merges their tools into one
/// namespaced catalog, routes calls, and tears everything down on
/// `cleanup()`. All methods take `&self`; share it behind an `Arc`.
pub struct McpGateway<C: Connector = StdioConnector> {
    pub(super) config: GatewayConfig,
    pub(super) connector: C,
    pub(super) state: Mutex<GatewayState>,
    /// Serializes initialization passes.
    init_lock: Mutex<()>,
}

impl McpGateway<StdioConnector> {
    /// Gateway over real child processes.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_connector(config, StdioConnector::new())
    }

    /// Load the providers file at `path`.
    ///
    /// A bad file is logged and the gateway starts with zero providers.
    pub fn from_config_path(path: &Path) -> Self {
        let config = load_config(path).unwrap_or_else(|e| {
            tracing::error!(path = %path.display(), error = %e, "ignoring provider config");
            GatewayConfig::default()
        });
        Self::new(config)
    }

    /// Load the providers file from `MCP_CONFIG_PATH` or the config directory.
    pub fn from_env() -> Self {
        let path = resolve_config_path();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no provider config found, starting empty");
            return Self::new(GatewayConfig::default());
        }
        Self::from_config_path(&path)
    }
}

impl<C: Connector> McpGateway<C> {
    /// Gateway with a custom connector.
    pub fn with_connector(config: GatewayConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            state: Mutex::new(GatewayState::new()),
            init_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch providers, connect, and build the catalog.
    ///
    /// No-op while `Ready` or `Initializing`; allowed again after `Closed`.
    /// Individual provider failures only shrink the catalog.
    pub async fn initialize(&self) -> InitReport {
        let seen = {
            let state = self.state.lock().await;
            if matches!(state.phase, Phase::Ready | Phase::Initializing) {
                return current_report(&state);
            }
            state.passes
        };

        let _guard = self.init_lock.lock().await;
        {
            // Another caller ran a pass while we waited; that one counts.
            let state = self.state.lock().await;
            if state.passes != seen {
                return current_report(&state);
            }
        }
        self.initialize_locked().await
    }

    /// Caller must hold `init_lock`.
    async fn initialize_locked(&self) -> InitReport {
        {
            let mut state = self.state.lock().await;
            match state.phase {
                Phase::Ready | Phase::Initializing => return current_report(&state),
                Phase::ShuttingDown => {
                    tracing::warn!("initialize requested during shutdown, ignoring");
                    return InitReport::default();
                }
                Phase::Uninitialized | Phase::Closed => state.phase = Phase::Initializing,
            }
        }

        let start = Instant::now();
        let timeouts = &self.config.timeouts;
        let configs = &self.config.providers;
        tracing::info!(count = configs.len(), "initializing providers");

        // 1. Launch. The timeout only fires if the connector's launch awaits.
        let LaunchOutcome {
            mut processes,
            failures: launch_failures,
        } = match timeout(timeouts.launch(), self.connector.launch(configs)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(timeout_ms = timeouts.launch_ms, "provider launch timed out");
                LaunchOutcome {
                    processes: BTreeMap::new(),
                    failures: configs
                        .keys()
                        .map(|name| {
                            let err = McpError::SpawnFailed {
                                name: name.clone(),
                                reason: format!("launch timed out after {}ms", timeouts.launch_ms),
                            };
                            (name.clone(), err)
                        })
                        .collect(),
                }
            }
        };

        let launch_failed: HashSet<String> =
            launch_failures.iter().map(|(name, _)| name.clone()).collect();
        let mut failures = launch_failures;

        // 2. Connect + discover, bounded concurrency
        let connects: Vec<_> = configs
            .iter()
            .filter(|(name, _)| !launch_failed.contains(*name))
            .map(|(name, config)| {
                let process = processes.remove(name);
                self.connect_provider(name.clone(), config.clone(), process)
            })
            .collect();

        let attempts: Vec<ConnectAttempt> = stream::iter(connects)
            .buffer_unordered(self.config.max_concurrent_connects.max(1))
            .collect()
            .await;

        // 3. Sort out who made it
        let mut sessions = BTreeMap::new();
        let mut live_processes = BTreeMap::new();
        let mut tools_by_provider = BTreeMap::new();
        let mut orphans: Vec<ProviderProcess> = processes.into_values().collect();

        for attempt in attempts {
            if let Some(err) = attempt.error {
                failures.push((attempt.name.clone(), err));
            }
            match attempt.session {
                Some(session) => {
                    sessions.insert(attempt.name.clone(), session);
                    tools_by_provider.insert(attempt.name.clone(), attempt.tools);
                    if let Some(process) = attempt.process {
                        live_processes.insert(attempt.name, process);
                    }
                }
                None => orphans.extend(attempt.process),
            }
        }

        for (name, err) in &failures {
            tracing::warn!(server = %name, error = %err, "provider unavailable");
        }

        // Processes whose provider never connected are not kept around.
        futures::future::join_all(orphans.into_iter().map(|process| {
            terminate(process, timeouts.process_grace(), timeouts.process_kill())
        }))
        .await;

        // 4. Catalog, built once
        let catalog = ToolCatalog::build(&tools_by_provider);

        let mut state = self.state.lock().await;
        state.passes += 1;
        if state.phase != Phase::Initializing {
            let phase = state.phase;
            drop(state);
            tracing::warn!(%phase, "shutdown began during initialization, discarding new sessions");
            shutdown::teardown(&self.connector, timeouts, sessions, live_processes).await;
            return InitReport {
                ready: Vec::new(),
                failures,
                tool_count: 0,
            };
        }

        let report = InitReport {
            ready: sessions.keys().cloned().collect(),
            failures,
            tool_count: catalog.len(),
        };

        state.phase = if sessions.is_empty() {
            Phase::Uninitialized
        } else {
            Phase::Ready
        };
        state.sessions = sessions;
        state.processes = live_processes;
        state.catalog = catalog;

        tracing::info!(
            phase = %state.phase,
            ready = report.ready.len(),
            failed = report.failures.len(),
            tools = report.tool_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "initialization complete"
        );

        report
    }

    /// Open a session to one provider and list its tools.
    async fn connect_provider(
        &self,
        name: String,
        config: ProviderConfig,
        mut process: Option<ProviderProcess>,
    ) -> ConnectAttempt {
        let timeouts = &self.config.timeouts;
        let mut attempt = ConnectAttempt {
            name: name.clone(),
            process: None,
            session: None,
            tools: Vec::new(),
            error: None,
        };

        let connected = timeout(
            timeouts.connect(),
            self.connector.connect(&name, &config, process.as_mut()),
        )
        .await;

        let session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                attempt.process = process;
                attempt.error = Some(e);
                return attempt;
            }
            Err(_) => {
                let stderr = process
                    .as_ref()
                    .map(ProviderProcess::stderr_suffix)
                    .unwrap_or_default();
                attempt.process = process;
                attempt.error = Some(McpError::InitFailed {
                    name: name.clone(),
                    reason: format!("handshake timed out after {}ms{stderr}", timeouts.connect_ms),
                });
                return attempt;
            }
        };

        match timeout(timeouts.discovery(), session.list_tools()).await {
            Ok(Ok(tools)) => {
                tracing::info!(server = %name, tools = tools.len(), "provider ready");
                attempt.tools = tools;
            }
            Ok(Err(e)) => {
                attempt.error = Some(match e {
                    McpError::DiscoveryFailed { .. } => e,
                    other => McpError::DiscoveryFailed {
                        name: name.clone(),
                        reason: other.to_string(),
                    },
                });
            }
            Err(_) => {
                attempt.error = Some(McpError::DiscoveryFailed {
                    name: name.clone(),
                    reason: format!("tools/list timed out after {}ms", timeouts.discovery_ms),
                });
            }
        }

        attempt.process = process;
        attempt.session = Some(session);
        attempt
    }

    /// Make sure an initialization pass has run.
    ///
    /// Waits for an in-flight pass. Fails once shutdown has begun.
    async fn ensure_ready(&self) -> Result<(), McpError> {
        let (phase, seen) = {
            let state = self.state.lock().await;
            (state.phase, state.passes)
        };
        match phase {
            Phase::Ready => return Ok(()),
            Phase::ShuttingDown | Phase::Closed => {
                return Err(McpError::GatewayClosed {
                    phase: phase.to_string(),
                })
            }
            Phase::Uninitialized | Phase::Initializing => {}
        }

        let _guard = self.init_lock.lock().await;
        let (phase, passes) = {
            let state = self.state.lock().await;
            (state.phase, state.passes)
        };
        match phase {
            // A pass finished while we waited. Even if it ended with no
            // sessions, it answers this call.
            Phase::Uninitialized if passes != seen => Ok(()),
            Phase::Uninitialized => {
                self.initialize_locked().await;
                Ok(())
            }
            Phase::ShuttingDown | Phase::Closed => Err(McpError::GatewayClosed {
                phase: phase.to_string(),
            }),
            Phase::Ready | Phase::Initializing => Ok(()),
        }
    }

    // ─── Catalog ─────────────────────────────────────────────────────────

    /// The unified tool catalog. Triggers initialization on first use.
    pub async fn get_tool_declarations(&self) -> Vec<ToolDeclaration> {
        if let Err(e) = self.ensure_ready().await {
            tracing::debug!(error = %e, "no tool declarations available");
            return Vec::new();
        }
        self.state.lock().await.catalog.declarations().to_vec()
    }

    /// The catalog in OpenAI function-calling format.
    pub async fn openai_tools(&self) -> Vec<serde_json::Value> {
        if let Err(e) = self.ensure_ready().await {
            tracing::debug!(error = %e, "no tool declarations available");
            return Vec::new();
        }
        self.state.lock().await.catalog.to_openai_tools()
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a namespaced tool on its owning provider.
    ///
    /// Steps:
    /// 1. Initialize if needed (refused once shutdown began)
    /// 2. Resolve the owning provider and session
    /// 3. Send `tools/call` with the call timeout
    /// 4. Normalize the result into `{content, is_error}`
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        self.ensure_ready().await?;

        let (provider, tool, session) = self.resolve(name).await?;
        let start = Instant::now();
        let timeouts = &self.config.timeouts;

        let outcome = match timeout(timeouts.call(), session.call_tool(&tool, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                operation: format!("tools/call {name}"),
                timeout_ms: timeouts.call_ms,
            }),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let result = result.into_tool_result();
                tracing::info!(
                    server = %provider,
                    tool = %tool,
                    is_error = result.is_error,
                    elapsed_ms,
                    "tool call complete"
                );
                Ok(result)
            }
            Err(McpError::ServerError { code, message, .. }) => {
                tracing::warn!(server = %provider, tool = %tool, code, %message, elapsed_ms, "provider rejected tool call");
                Ok(server_error_result(code, &message))
            }
            Err(e) => {
                tracing::error!(server = %provider, tool = %tool, error = %e, elapsed_ms, "tool call failed");
                if matches!(e, McpError::TransportError { .. }) {
                    self.drop_lost_session(&provider, &session).await;
                }
                Err(McpError::ExecutionFailed {
                    server: provider,
                    tool,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Forget a session whose transport broke. Later calls to the provider
    /// fail with `ProviderUnavailable`; its process is left for `cleanup()`.
    async fn drop_lost_session(&self, provider: &str, session: &Arc<dyn ToolSession>) {
        let mut state = self.state.lock().await;
        let current = state.sessions.get(provider).is_some_and(|s| Arc::ptr_eq(s, session));
        if current {
            state.sessions.remove(provider);
            tracing::warn!(server = provider, "provider connection lost, marking unavailable");
        }
    }

    /// Find `(provider, local tool, session)` for a namespaced name.
    async fn resolve(
        &self,
        name: &str,
    ) -> Result<(String, String, Arc<dyn ToolSession>), McpError> {
        let state = self.state.lock().await;

        if matches!(state.phase, Phase::ShuttingDown | Phase::Closed) {
            return Err(McpError::GatewayClosed {
                phase: state.phase.to_string(),
            });
        }

        let Some(route) = state.catalog.routing().get(name) else {
            // Not in the catalog: distinguish a configured-but-down provider.
            if let Some((provider, tool)) = split_namespaced(name) {
                if self.config.providers.contains_key(provider)
                    && !state.sessions.contains_key(provider)
                {
                    return Err(McpError::ProviderUnavailable {
                        server: provider.to_string(),
                        tool: tool.to_string(),
                    });
                }
            }
            return Err(McpError::UnknownTool {
                name: name.to_string(),
            });
        };

        let session = state
            .sessions
            .get(&route.provider)
            .cloned()
            .ok_or_else(|| McpError::ProviderUnavailable {
                server: route.provider.clone(),
                tool: route.tool.clone(),
            })?;

        Ok((route.provider.clone(), route.tool.clone(), session))
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Current phase, providers, and tool count.
    pub async fn status(&self) -> GatewayStatus {
        let state = self.state.lock().await;
        GatewayStatus {
            phase: state.phase,
            configured: self.config.providers.keys().cloned().collect(),
            ready: state.sessions.keys().cloned().collect(),
            tools_per_provider: state
                .sessions
                .keys()
                .map(|name| (name.clone(), state.catalog.tools_for_provider(name)))
                .collect(),
            tool_count: state.catalog.len(),
        }
    }
}

fn current_report(state: &GatewayState) -> InitReport {
    InitReport {
        ready: state.sessions.keys().cloned().collect(),
        failures: Vec::new(),
        tool_count: state.catalog.len(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
