//! Provider configuration loading and validation.
//!
//! Reads the providers file (`mcp_servers.json` by default, YAML when the
//! extension says so), resolves `${VAR}` references inside the parsed
//! `command`, `args`, `env` and `cwd` strings, and rejects documents
//! the gateway cannot route unambiguously: duplicate provider names, names
//! that would break namespacing, or entries without `command`/`args`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use super::errors::McpError;
use super::registry::NAMESPACE_SEPARATOR;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable overriding the providers file location.
pub const CONFIG_PATH_ENV: &str = "MCP_CONFIG_PATH";

/// File name looked up in the gateway config directory.
pub const DEFAULT_CONFIG_FILE: &str = "mcp_servers.json";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Launch specification for a single provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the provider process.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ProviderConfig {
    /// Substitute `${VAR}` references in every launch string.
    ///
    /// Runs on parsed values, so substituted text is never reinterpreted as
    /// JSON or YAML syntax.
    fn interpolate(&mut self) {
        self.command = interpolate_env_vars(&self.command);
        for arg in &mut self.args {
            *arg = interpolate_env_vars(arg);
        }
        for value in self.env.values_mut() {
            *value = interpolate_env_vars(value);
        }
        if let Some(cwd) = &mut self.cwd {
            *cwd = interpolate_env_vars(cwd);
        }
    }

    /// Convenience constructor for a provider without env overrides.
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

/// Per-operation time budgets, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayTimeouts {
    /// Spawning every configured provider.
    pub launch_ms: u64,
    /// Opening a session and completing the `initialize` handshake.
    pub connect_ms: u64,
    /// Listing one provider's tools (all pages).
    pub discovery_ms: u64,
    /// A single `tools/call`.
    pub call_ms: u64,
    /// Disconnecting one session during shutdown.
    pub session_close_ms: u64,
    /// Closing the connector's shared handles during shutdown.
    pub aggregate_close_ms: u64,
    /// Waiting for a process to exit after the graceful signal.
    pub process_grace_ms: u64,
    /// Waiting for a process to exit after the forceful kill.
    pub process_kill_ms: u64,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            launch_ms: 10_000,
            // ML-heavy providers can take a long time to import at startup.
            connect_ms: 30_000,
            discovery_ms: 15_000,
            call_ms: 30_000,
            session_close_ms: 2_000,
            aggregate_close_ms: 3_000,
            process_grace_ms: 5_000,
            process_kill_ms: 1_000,
        }
    }
}

impl GatewayTimeouts {
    pub fn launch(&self) -> Duration {
        Duration::from_millis(self.launch_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn session_close(&self) -> Duration {
        Duration::from_millis(self.session_close_ms)
    }

    pub fn aggregate_close(&self) -> Duration {
        Duration::from_millis(self.aggregate_close_ms)
    }

    pub fn process_grace(&self) -> Duration {
        Duration::from_millis(self.process_grace_ms)
    }

    pub fn process_kill(&self) -> Duration {
        Duration::from_millis(self.process_kill_ms)
    }

    /// Upper bound on `cleanup()` for the given number of sessions and processes.
    pub fn shutdown_bound(&self, sessions: u32, processes: u32) -> Duration {
        self.session_close() * sessions
            + self.aggregate_close()
            + (self.process_grace() + self.process_kill()) * processes
    }
}

/// Top-level providers file.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(
        alias = "mcpServers",
        alias = "servers",
        deserialize_with = "deserialize_unique_providers"
    )]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub timeouts: GatewayTimeouts,
    /// How many providers may be connecting at the same time.
    #[serde(default = "default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,
}

fn default_max_concurrent_connects() -> usize {
    8
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::with_providers(BTreeMap::new())
    }
}

impl GatewayConfig {
    /// A config with the given providers and default limits.
    pub fn with_providers(providers: BTreeMap<String, ProviderConfig>) -> Self {
        Self {
            providers,
            timeouts: GatewayTimeouts::default(),
            max_concurrent_connects: default_max_concurrent_connects(),
        }
    }
}

/// Document syntax of a providers file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick the format from the file extension (JSON unless `.yaml`/`.yml`).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the providers file location.
///
/// `MCP_CONFIG_PATH` wins when set and non-empty; otherwise the file lives in
/// the gateway's config directory.
pub fn resolve_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => crate::config_dir().join(DEFAULT_CONFIG_FILE),
    }
}

/// Load, interpolate, parse, and validate a providers file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw, ConfigFormat::from_path(path))?;

    tracing::info!(
        path = %path.display(),
        count = config.providers.len(),
        providers = ?config.providers.keys().collect::<Vec<_>>(),
        "loaded provider config"
    );

    Ok(config)
}

/// Parse a providers document, interpolate its launch strings, and validate.
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<GatewayConfig, McpError> {
    let mut config: GatewayConfig = match format {
        ConfigFormat::Json => serde_json::from_str(text).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?,
        ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?,
    };

    for provider in config.providers.values_mut() {
        provider.interpolate();
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &GatewayConfig) -> Result<(), McpError> {
    for (name, provider) in &config.providers {
        validate_provider_name(name).map_err(|reason| McpError::ConfigError { reason })?;

        if provider.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("provider '{name}' has an empty command"),
            });
        }
    }

    if config.max_concurrent_connects == 0 {
        return Err(McpError::ConfigError {
            reason: "max_concurrent_connects must be at least 1".into(),
        });
    }

    Ok(())
}

/// Check that a provider name keeps namespaced tool names unambiguous.
///
/// Allowed: ASCII letters, digits, `-`, and single `_` not at the end. The
/// namespace separator may not appear inside a name.
pub fn validate_provider_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("provider name must not be empty".into());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("provider name '{name}' contains invalid character '{bad}'"));
    }
    if name.contains(NAMESPACE_SEPARATOR) {
        return Err(format!(
            "provider name '{name}' must not contain '{NAMESPACE_SEPARATOR}'"
        ));
    }
    if name.ends_with('_') {
        return Err(format!("provider name '{name}' must not end with '_'"));
    }
    Ok(())
}

/// Deserialize the providers map, rejecting repeated names instead of
/// letting the last entry win.
fn deserialize_unique_providers<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, ProviderConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueProviders;

    impl<'de> Visitor<'de> for UniqueProviders {
        type Value = BTreeMap<String, ProviderConfig>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of provider name to launch specification")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut providers = BTreeMap::new();
            while let Some((name, config)) = access.next_entry::<String, ProviderConfig>()? {
                if providers.contains_key(&name) {
                    return Err(de::Error::custom(format!(
                        "duplicate provider name '{name}'"
                    )));
                }
                providers.insert(name, config);
            }
            Ok(providers)
        }
    }

    deserializer.deserialize_map(UniqueProviders)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "providers": {
            "home": {"command": "python3", "args": ["-m", "home_server"], "env": {"HASS_URL": "http://hub"}},
            "calendar": {"command": "npx", "args": ["calendar-mcp"]}
        }
    }"#;

    #[test]
    fn test_parse_valid_config() {
        let config = parse_config(SAMPLE, ConfigFormat::Json).unwrap();
        assert_eq!(config.providers.len(), 2);
        let home = &config.providers["home"];
        assert_eq!(home.command, "python3");
        assert_eq!(home.args, vec!["-m", "home_server"]);
        assert_eq!(home.env["HASS_URL"], "http://hub");
        assert!(config.providers["calendar"].env.is_empty());
        assert_eq!(config.timeouts, GatewayTimeouts::default());
        assert_eq!(config.max_concurrent_connects, 8);
    }

    #[test]
    fn test_mcp_servers_key_is_accepted() {
        let json = r#"{"mcpServers": {"reminders": {"command": "uvx", "args": ["reminders"]}}}"#;
        let config = parse_config(json, ConfigFormat::Json).unwrap();
        assert!(config.providers.contains_key("reminders"));
    }

    #[test]
    fn test_duplicate_provider_is_config_error() {
        let json = r#"{"providers": {
            "a": {"command": "x", "args": []},
            "a": {"command": "y", "args": []}
        }}"#;
        let err = parse_config(json, ConfigFormat::Json).unwrap_err();
        match err {
            McpError::ConfigError { reason } => assert!(reason.contains("duplicate provider name 'a'")),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_args_is_config_error() {
        let json = r#"{"providers": {"a": {"command": "x"}}}"#;
        let err = parse_config(json, ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_missing_command_is_config_error() {
        let json = r#"{"providers": {"a": {"args": []}}}"#;
        assert!(matches!(
            parse_config(json, ConfigFormat::Json),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_not_structured_data_is_config_error() {
        assert!(matches!(
            parse_config("providers = nope", ConfigFormat::Json),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_provider_name_rules() {
        assert!(validate_provider_name("home_assistant").is_ok());
        assert!(validate_provider_name("calendar-v2").is_ok());
        assert!(validate_provider_name("").is_err());
        assert!(validate_provider_name("a__b").is_err());
        assert!(validate_provider_name("trailing_").is_err());
        assert!(validate_provider_name("has space").is_err());
        assert!(validate_provider_name("dotted.name").is_err());
    }

    #[test]
    fn test_invalid_provider_name_rejected_on_parse() {
        let json = r#"{"providers": {"bad__name": {"command": "x", "args": []}}}"#;
        assert!(matches!(
            parse_config(json, ConfigFormat::Json),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_partial_timeouts_override() {
        let json = r#"{
            "providers": {},
            "timeouts": {"call_ms": 500},
            "max_concurrent_connects": 2
        }"#;
        let config = parse_config(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.timeouts.call(), Duration::from_millis(500));
        assert_eq!(config.timeouts.connect_ms, GatewayTimeouts::default().connect_ms);
        assert_eq!(config.max_concurrent_connects, 2);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let json = r#"{"providers": {}, "max_concurrent_connects": 0}"#;
        assert!(parse_config(json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
providers:
  social:
    command: node
    args: ["dist/index.js"]
    cwd: /opt/social
"#;
        let config = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.providers["social"].cwd.as_deref(), Some("/opt/social"));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a/servers.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a/servers.YML")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a/servers.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a/servers")), ConfigFormat::Json);
    }

    #[test]
    fn test_load_config_interpolates_env() {
        std::env::set_var("__TOOL_GATEWAY_TEST_TOKEN__", "secret-token");
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp_servers.json");
        std::fs::write(
            &path,
            r#"{"providers": {"home": {
                "command": "python3",
                "args": ["-m", "home"],
                "env": {"TOKEN": "${__TOOL_GATEWAY_TEST_TOKEN__}", "URL": "${__TOOL_GATEWAY_UNSET__:-http://localhost}"}
            }}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        let env = &config.providers["home"].env;
        assert_eq!(env["TOKEN"], "secret-token");
        assert_eq!(env["URL"], "http://localhost");
        std::env::remove_var("__TOOL_GATEWAY_TEST_TOKEN__");
    }

    #[test]
    fn test_interpolated_value_with_quotes_and_backslashes() {
        std::env::set_var("__TOOL_GATEWAY_TEST_SECRET__", r#"pa"ss\word"#);
        let json = r#"{"providers": {"vault": {
            "command": "vault-mcp",
            "args": ["--token=${__TOOL_GATEWAY_TEST_SECRET__}"],
            "env": {"TOKEN": "${__TOOL_GATEWAY_TEST_SECRET__}"}
        }}}"#;
        let yaml = "providers:\n  vault:\n    command: vault-mcp\n    args: []\n    cwd: \"C:\\\\${__TOOL_GATEWAY_TEST_SECRET__}\"\n";

        let from_json = parse_config(json, ConfigFormat::Json).unwrap();
        let vault = &from_json.providers["vault"];
        assert_eq!(vault.env["TOKEN"], r#"pa"ss\word"#);
        assert_eq!(vault.args, vec![r#"--token=pa"ss\word"#]);

        let from_yaml = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(
            from_yaml.providers["vault"].cwd.as_deref(),
            Some(r#"C:\pa"ss\word"#)
        );
        std::env::remove_var("__TOOL_GATEWAY_TEST_SECRET__");
    }

    #[test]
    fn test_interpolated_empty_command_is_rejected() {
        let json = r#"{"providers": {"a": {"command": "${__TOOL_GATEWAY_UNSET_COMMAND__}", "args": []}}}"#;
        assert!(matches!(
            parse_config(json, ConfigFormat::Json),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/mcp_servers.json")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_shutdown_bound() {
        let t = GatewayTimeouts {
            session_close_ms: 100,
            aggregate_close_ms: 50,
            process_grace_ms: 200,
            process_kill_ms: 20,
            ..GatewayTimeouts::default()
        };
        assert_eq!(t.shutdown_bound(2, 3), Duration::from_millis(200 + 50 + 660));
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/providers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/providers"));
    }
}
