//! MCP gateway: JSON-RPC over stdio to a set of tool providers.
//!
//! This module handles:
//! - Loading the provider config (JSON or YAML, env interpolation)
//! - Spawning provider child processes and stopping them with escalation
//! - JSON-RPC 2.0 communication over process stdio
//! - Tool discovery and aggregation into one namespaced catalog
//! - Tool call routing and result normalization
//! - Bounded, reported shutdown

pub mod client;
pub mod config;
pub mod content;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{GatewayStatus, InitReport, McpGateway, Phase};
pub use config::{GatewayConfig, GatewayTimeouts, ProviderConfig};
pub use errors::McpError;
pub use registry::{namespaced_name, split_namespaced, ToolCatalog, NAMESPACE_SEPARATOR};
pub use session::{Connector, StdioConnector, ToolSession};
pub use shutdown::{CleanupAction, CleanupStep, ShutdownReport, StepOutcome};
pub use types::{McpToolDefinition, ToolDeclaration, ToolResult};
