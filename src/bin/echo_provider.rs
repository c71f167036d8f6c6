//! Minimal stdio MCP provider.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout and offers three tools:
//! `echo` (text back, prefixed with `ECHO_PROVIDER_PREFIX` if set), `add`
//! (sum as an execution-output part) and `fail` (an `isError` result).
//! Exits when stdin closes.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let prefix = std::env::var("ECHO_PROVIDER_PREFIX").unwrap_or_default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    eprintln!("echo_provider: ready");

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("echo_provider: ignoring malformed line");
            continue;
        };
        // Notifications carry no id and get no answer.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };

        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "echo_provider", "version": env!("CARGO_PKG_VERSION")},
            })),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => call_tool(&params, &prefix),
            other => Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
        };

        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
        };

        let mut encoded = response.to_string();
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the given text",
            "inputSchema": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
                "additionalProperties": false
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number", "exclusiveMinimum": -1000000}
                },
                "required": ["a", "b"]
            }
        },
        {
            "name": "fail",
            "description": "Always report a tool-level error",
            "inputSchema": {"type": "object", "properties": {}}
        }
    ])
}

fn call_tool(params: &Value, prefix: &str) -> Result<Value, (i32, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or((INVALID_PARAMS, "missing argument 'text'".to_string()))?;
            Ok(json!({"content": [{"type": "text", "text": format!("{prefix}{text}")}]}))
        }
        "add" => {
            let sum = add(args.get("a"), args.get("b"))
                .ok_or((INVALID_PARAMS, "arguments 'a' and 'b' must be numbers".to_string()))?;
            Ok(json!({
                "content": [{"type": "execution_output", "outcome": "OUTCOME_OK", "output": sum}]
            }))
        }
        "fail" => Ok(json!({
            "content": [{"type": "text", "text": "requested failure"}],
            "isError": true
        })),
        other => Err((INVALID_PARAMS, format!("unknown tool: {other}"))),
    }
}

/// Integer sum when both are integers, float sum otherwise.
fn add(a: Option<&Value>, b: Option<&Value>) -> Option<String> {
    let (a, b) = (a?, b?);
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.checked_add(y).map(|s| s.to_string());
    }
    Some((a.as_f64()? + b.as_f64()?).to_string())
}
