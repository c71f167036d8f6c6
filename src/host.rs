//! Line-delimited JSON host loop.
//!
//! Each input line is one request, each output line one response:
//!
//! ```text
//! {"op":"list"}                                  → {"ok":true,"tools":[...]}
//! {"op":"list","format":"openai"}                → {"ok":true,"tools":[...]}
//! {"op":"call","name":"a__search","arguments":{}} → {"ok":true,"result":{...}}
//! {"op":"status"}                                → {"ok":true,"status":{...}}
//! ```
//!
//! Failures answer `{"ok":false,"kind":...,"error":...}`; the loop keeps going.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::mcp_client::{Connector, McpGateway};

/// A request from the host.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    List {
        #[serde(default)]
        format: ListFormat,
    },
    Call {
        name: String,
        #[serde(default = "empty_arguments")]
        arguments: Value,
    },
    Status,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFormat {
    #[default]
    Declarations,
    Openai,
}

fn empty_arguments() -> Value {
    json!({})
}

/// Answer a single request line.
pub async fn handle_line<C: Connector>(gateway: &McpGateway<C>, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return json!({
                "ok": false,
                "kind": "invalid_request",
                "error": format!("invalid request: {e}"),
            })
        }
    };

    match request {
        Request::List { format } => {
            let tools = match format {
                ListFormat::Declarations => json!(gateway.get_tool_declarations().await),
                ListFormat::Openai => Value::Array(gateway.openai_tools().await),
            };
            json!({"ok": true, "tools": tools})
        }
        Request::Call { name, arguments } => match gateway.execute_tool(&name, arguments).await {
            Ok(result) => json!({"ok": true, "result": result}),
            Err(e) => json!({"ok": false, "kind": e.kind(), "error": e.to_string()}),
        },
        Request::Status => json!({"ok": true, "status": gateway.status().await}),
    }
}

/// Serve requests from `input` until EOF, writing one response per line.
pub async fn serve<C, R, W>(gateway: &McpGateway<C>, input: R, mut output: W) -> anyhow::Result<()>
where
    C: Connector,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handle_line(gateway, line).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        output.write_all(encoded.as_bytes()).await?;
        output.flush().await?;
    }

    tracing::info!("host input closed");
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
