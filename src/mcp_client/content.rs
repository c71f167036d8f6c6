//! Normalization of provider call results.
//!
//! Providers answer `tools/call` with a list of typed content parts. The
//! gateway flattens them into a single `{content, is_error}` envelope so the
//! caller never sees provider-specific shapes.

use serde_json::Value;

use super::types::ToolResult;

// ─── Content Items ───────────────────────────────────────────────────────────

/// One typed part of a provider result.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentItem {
    Text(String),
    /// Base64 payload; only the MIME type is rendered.
    Image {
        mime_type: String,
        data: String,
    },
    Resource {
        uri: String,
        text: Option<String>,
        mime_type: Option<String>,
    },
    Code {
        language: String,
        body: String,
    },
    ExecutionOutput {
        outcome: String,
        output: String,
    },
    /// Anything unrecognized, kept verbatim.
    Unknown(Value),
}

impl ContentItem {
    /// Classify a raw content part by its `type` tag.
    pub fn from_value(value: &Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

        match kind {
            "text" => match str_field(value, &["text"]) {
                Some(text) => Self::Text(text),
                None => Self::Unknown(value.clone()),
            },
            "image" => Self::Image {
                mime_type: str_field(value, &["mimeType", "mime_type"]).unwrap_or_default(),
                data: str_field(value, &["data"]).unwrap_or_default(),
            },
            "resource" => {
                let resource = value.get("resource").unwrap_or(value);
                Self::Resource {
                    uri: str_field(resource, &["uri"]).unwrap_or_default(),
                    text: str_field(resource, &["text"]),
                    mime_type: str_field(resource, &["mimeType", "mime_type"]),
                }
            }
            "resource_link" => Self::Resource {
                uri: str_field(value, &["uri"]).unwrap_or_default(),
                text: None,
                mime_type: str_field(value, &["mimeType", "mime_type"]),
            },
            "code" | "executable_code" => Self::Code {
                language: str_field(value, &["language"])
                    .unwrap_or_default()
                    .to_lowercase(),
                body: str_field(value, &["code", "body", "text"]).unwrap_or_default(),
            },
            "execution_output" | "code_execution_result" => Self::ExecutionOutput {
                outcome: str_field(value, &["outcome"]).unwrap_or_default(),
                output: str_field(value, &["output", "text"]).unwrap_or_default(),
            },
            _ => Self::Unknown(value.clone()),
        }
    }

    /// Render this part as plain text.
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Image { mime_type, .. } => format!("[image: {mime_type}]"),
            Self::Resource { text: Some(text), .. } => text.clone(),
            Self::Resource { uri, .. } => format!("[resource: {uri}]"),
            Self::Code { language, body } => format!("```{language}\n{body}\n```"),
            Self::ExecutionOutput { outcome, output } => {
                if outcome.is_empty() || is_ok_outcome(outcome) {
                    format!("Execution output:\n{output}")
                } else {
                    format!("Execution output ({outcome}):\n{output}")
                }
            }
            Self::Unknown(raw) => raw.to_string(),
        }
    }
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn is_ok_outcome(outcome: &str) -> bool {
    matches!(
        outcome.to_ascii_lowercase().as_str(),
        "ok" | "success" | "outcome_ok"
    )
}

// ─── CallToolResult ──────────────────────────────────────────────────────────

/// Parsed `tools/call` result, before flattening.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallToolResult {
    pub content: Vec<ContentItem>,
    /// Bare `text` field some providers return instead of a content list.
    pub text: Option<String>,
    pub structured: Option<Value>,
    pub is_error: bool,
}

impl CallToolResult {
    /// Parse a raw JSON-RPC `result` object.
    pub fn from_value(value: &Value) -> Self {
        let content = value
            .get("content")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(ContentItem::from_value).collect())
            .unwrap_or_default();

        Self {
            content,
            text: value.get("text").and_then(Value::as_str).map(str::to_string),
            structured: value
                .get("structuredContent")
                .filter(|v| !v.is_null())
                .cloned(),
            is_error: value.get("isError").and_then(Value::as_bool).unwrap_or(false),
        }
    }

    /// Flatten into the caller-facing envelope.
    ///
    /// Content parts are rendered in order and joined with newlines. Without
    /// a content list, the bare `text` field is used, then `structuredContent`.
    pub fn into_tool_result(self) -> ToolResult {
        let content = if !self.content.is_empty() {
            self.content
                .iter()
                .map(ContentItem::render)
                .collect::<Vec<_>>()
                .join("\n")
        } else if let Some(text) = self.text {
            text
        } else if let Some(structured) = self.structured {
            structured.to_string()
        } else {
            String::new()
        };

        ToolResult {
            content,
            is_error: self.is_error,
        }
    }
}

/// Envelope for a JSON-RPC error answer to `tools/call`.
pub fn server_error_result(code: i32, message: &str) -> ToolResult {
    ToolResult {
        content: format!("[{code}] {message}"),
        is_error: true,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(raw: Value) -> ToolResult {
        CallToolResult::from_value(&raw).into_tool_result()
    }

    #[test]
    fn test_text_items_joined_with_newlines() {
        let result = normalize(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ]
        }));
        assert_eq!(result.content, "first\nsecond");
        assert!(!result.is_error);
    }

    #[test]
    fn test_execution_output_is_labeled() {
        let result = normalize(json!({
            "content": [{"type": "execution_output", "outcome": "OUTCOME_OK", "output": "42"}]
        }));
        assert_eq!(result.content, "Execution output:\n42");
    }

    #[test]
    fn test_failed_execution_mentions_outcome() {
        let item = ContentItem::from_value(&json!({
            "type": "code_execution_result",
            "outcome": "OUTCOME_FAILED",
            "output": "ZeroDivisionError"
        }));
        assert_eq!(
            item.render(),
            "Execution output (OUTCOME_FAILED):\nZeroDivisionError"
        );
    }

    #[test]
    fn test_code_is_fenced_with_language() {
        let result = normalize(json!({
            "content": [
                {"type": "text", "text": "Computed with:"},
                {"type": "executable_code", "language": "PYTHON", "code": "print(6*7)"}
            ]
        }));
        assert_eq!(result.content, "Computed with:\n```python\nprint(6*7)\n```");
    }

    #[test]
    fn test_unknown_item_rendered_as_json() {
        let raw = json!({"type": "chart", "series": [1, 2]});
        let item = ContentItem::from_value(&raw);
        assert_eq!(item, ContentItem::Unknown(raw.clone()));
        assert_eq!(item.render(), raw.to_string());
    }

    #[test]
    fn test_image_and_resource_items() {
        let result = normalize(json!({
            "content": [
                {"type": "image", "mimeType": "image/png", "data": "iVBORw0KGgo="},
                {"type": "resource", "resource": {"uri": "file:///notes.md", "text": "# Notes"}},
                {"type": "resource_link", "uri": "file:///big.bin"}
            ]
        }));
        assert_eq!(
            result.content,
            "[image: image/png]\n# Notes\n[resource: file:///big.bin]"
        );
    }

    #[test]
    fn test_bare_text_field_fallback() {
        let result = normalize(json!({"text": "plain answer"}));
        assert_eq!(result.content, "plain answer");
    }

    #[test]
    fn test_structured_content_fallback() {
        let result = normalize(json!({"content": [], "structuredContent": {"temp": 21}}));
        assert_eq!(result.content, r#"{"temp":21}"#);
    }

    #[test]
    fn test_is_error_propagated() {
        let result = normalize(json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        }));
        assert!(result.is_error);
        assert_eq!(result.content, "boom");
    }

    #[test]
    fn test_empty_result() {
        let result = normalize(json!({}));
        assert_eq!(result.content, "");
        assert!(!result.is_error);
    }

    #[test]
    fn test_server_error_envelope() {
        let result = server_error_result(-32602, "missing argument 'query'");
        assert_eq!(result.content, "[-32602] missing argument 'query'");
        assert!(result.is_error);
    }
}
