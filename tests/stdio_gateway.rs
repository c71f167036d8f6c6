//! End-to-end tests against real provider processes.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use tool_gateway::mcp_client::{
    CleanupAction, GatewayConfig, McpError, McpGateway, Phase, ProviderConfig,
};

const ECHO_PROVIDER: &str = env!("CARGO_BIN_EXE_echo_provider");
const GATEWAY: &str = env!("CARGO_BIN_EXE_tool-gateway");

fn echo_and_missing() -> GatewayConfig {
    let mut echo = ProviderConfig::new(ECHO_PROVIDER, &[]);
    echo.env
        .insert("ECHO_PROVIDER_PREFIX".into(), "echo: ".into());

    let mut providers = BTreeMap::new();
    providers.insert("A".to_string(), echo);
    providers.insert(
        "B".to_string(),
        ProviderConfig::new("/nonexistent/tool-gateway-provider", &[]),
    );
    GatewayConfig::with_providers(providers)
}

#[tokio::test]
async fn test_gateway_over_real_processes() {
    let gateway = McpGateway::new(echo_and_missing());

    let report = gateway.initialize().await;
    assert_eq!(report.ready, vec!["A"]);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].1, McpError::SpawnFailed { .. }));

    let decls = gateway.get_tool_declarations().await;
    let names: Vec<&str> = decls.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["A__echo", "A__add", "A__fail"]);
    assert!(decls[0].parameters.get("$schema").is_none());
    assert!(decls[0].parameters.get("additionalProperties").is_none());
    assert_eq!(decls[0].parameters["required"], json!(["text"]));
    assert!(decls[1].parameters["properties"]["b"]
        .get("exclusiveMinimum")
        .is_none());

    let echoed = gateway
        .execute_tool("A__echo", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(echoed.content, "echo: hi");
    assert!(!echoed.is_error);

    let sum = gateway
        .execute_tool("A__add", json!({"a": 40, "b": 2}))
        .await
        .unwrap();
    assert_eq!(sum.content, "Execution output:\n42");

    let failed = gateway.execute_tool("A__fail", json!({})).await.unwrap();
    assert!(failed.is_error);
    assert_eq!(failed.content, "requested failure");

    let rejected = gateway.execute_tool("A__echo", json!({})).await.unwrap();
    assert!(rejected.is_error);
    assert_eq!(rejected.content, "[-32602] missing argument 'text'");

    let unavailable = gateway
        .execute_tool("B__anything", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(unavailable, McpError::ProviderUnavailable { .. }));

    let shutdown = gateway.cleanup().await;
    assert!(shutdown.is_clean(), "{shutdown:?}");
    let actions: Vec<CleanupAction> = shutdown.steps.iter().map(|s| s.action).collect();
    assert_eq!(
        actions,
        vec![
            CleanupAction::Disconnect,
            CleanupAction::CloseAll,
            CleanupAction::Terminate
        ]
    );
    assert_eq!(gateway.status().await.phase, Phase::Closed);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_provider() {
    let gateway = McpGateway::new(echo_and_missing());

    let calls = (0..8).map(|i| {
        let gateway = &gateway;
        async move {
            gateway
                .execute_tool("A__echo", json!({ "text": format!("call {i}") }))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().content, format!("echo: call {i}"));
    }

    gateway.cleanup().await;
}

#[tokio::test]
async fn test_host_binary_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config_path = tmp.path().join("providers.json");
    let config = json!({
        "mcpServers": {
            "echo": {"command": ECHO_PROVIDER, "args": []}
        }
    });
    std::fs::write(&config_path, config.to_string()).unwrap();

    let mut child = tokio::process::Command::new(GATEWAY)
        .arg(&config_path)
        .env("HOME", tmp.path())
        .env("XDG_DATA_HOME", tmp.path().join("data"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut responses = BufReader::new(child.stdout.take().unwrap()).lines();

    stdin
        .write_all(b"{\"op\":\"call\",\"name\":\"echo__echo\",\"arguments\":{\"text\":\"ping\"}}\n")
        .await
        .unwrap();
    let line = responses.next_line().await.unwrap().unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["ok"], true);
    assert_eq!(response["result"]["content"], "ping");

    stdin.write_all(b"{\"op\":\"status\"}\n").await.unwrap();
    let line = responses.next_line().await.unwrap().unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["status"]["phase"], "ready");
    assert_eq!(response["status"]["ready"], json!(["echo"]));

    drop(stdin);
    let status = tokio::time::timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("gateway exits after stdin closes")
        .unwrap();
    assert!(status.success());
}
