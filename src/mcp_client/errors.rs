//! Gateway error types.
//!
//! Initialization errors (`SpawnFailed`, `InitFailed`, `DiscoveryFailed`) are
//! contained per provider and only shrink the catalog. Call errors
//! (`UnknownTool`, `ProviderUnavailable`, `ExecutionFailed`, `GatewayClosed`)
//! are returned to whoever issued the call. Shutdown never returns an error;
//! its failures are recorded in a `ShutdownReport`.

use thiserror::Error;

/// Errors that can occur during gateway operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A provider process failed to start.
    #[error("failed to spawn provider '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The session could not be opened or the handshake did not complete.
    #[error("provider '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// The provider could not answer a tool listing.
    #[error("tool discovery failed for provider '{name}': {reason}")]
    DiscoveryFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for provider '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Provider returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the routing table.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// The owning provider is configured but has no live session.
    #[error("provider '{server}' is unavailable for tool '{tool}'")]
    ProviderUnavailable {
        server: String,
        tool: String,
    },

    /// The remote call itself failed.
    #[error("tool '{tool}' on provider '{server}' failed: {source}")]
    ExecutionFailed {
        server: String,
        tool: String,
        #[source]
        source: Box<McpError>,
    },

    /// An operation exceeded its time budget.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// The gateway is shutting down or closed and accepts no new calls.
    #[error("gateway is {phase}; no new tool calls are accepted")]
    GatewayClosed {
        phase: String,
    },

    /// Configuration error (unreadable, malformed, duplicate providers).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::InitFailed { .. } => "init_failed",
            Self::DiscoveryFailed { .. } => "discovery_failed",
            Self::TransportError { .. } => "transport_error",
            Self::ServerError { .. } => "server_error",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Timeout { .. } => "timeout",
            Self::GatewayClosed { .. } => "gateway_closed",
            Self::ConfigError { .. } => "config_error",
        }
    }

    /// Whether this error was produced by an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ExecutionFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_execution_failed_keeps_cause() {
        let err = McpError::ExecutionFailed {
            server: "calendar".into(),
            tool: "list_events".into(),
            source: Box::new(McpError::TransportError {
                server: "calendar".into(),
                reason: "broken pipe".into(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("list_events"));
        assert!(msg.contains("broken pipe"));
        let cause = err.source().expect("source attached");
        assert!(cause.to_string().contains("transport error"));
    }

    #[test]
    fn test_is_timeout_sees_through_execution_failed() {
        let err = McpError::ExecutionFailed {
            server: "a".into(),
            tool: "search".into(),
            source: Box::new(McpError::Timeout {
                operation: "tools/call".into(),
                timeout_ms: 10,
            }),
        };
        assert!(err.is_timeout());
        assert!(!McpError::UnknownTool { name: "x".into() }.is_timeout());
    }
}
