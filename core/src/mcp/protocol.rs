//! MCP wire protocol
//!
//! JSON-RPC 2.0 message types and the MCP payload shapes the client uses:
//! `initialize`, `tools/list`, `tools/call`, `resources/read`. Framing is
//! line-delimited JSON over the child process's stdio.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{HarveyError, Result};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
pub const CLIENT_NAME: &str = "harvey";

/// Outgoing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outgoing notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params: None,
        }
    }
}

/// Incoming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object; the code is preserved across the tool boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Parameters for `initialize`. No optional client capabilities (roots,
/// sampling, elicitation) are declared.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// One content item of a tool/resource result
#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub text: Option<String>,
}

/// `tools/call` result envelope
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "structuredContent")]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// Decode a `tools/call` result into the JSON payload the agent consumes.
/// Structured content wins; otherwise the text items are parsed as JSON.
pub fn extract_tool_payload(tool_name: &str, result: Value) -> Result<Value> {
    let parsed: CallToolResult =
        serde_json::from_value(result).map_err(|e| HarveyError::ToolInternal {
            name: tool_name.to_string(),
            message: format!("malformed tool result: {e}"),
            code: None,
        })?;

    if parsed.is_error {
        let message = joined_text(&parsed.content);
        return Err(HarveyError::ToolInternal {
            name: tool_name.to_string(),
            message: if message.is_empty() {
                "tool reported an error without a message".into()
            } else {
                message
            },
            code: None,
        });
    }

    if let Some(structured) = parsed.structured_content {
        return Ok(structured);
    }

    for item in &parsed.content {
        if let Some(text) = &item.text {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                if value.is_object() {
                    return Ok(value);
                }
            }
        }
    }

    let joined = joined_text(&parsed.content);
    if let Ok(value) = serde_json::from_str::<Value>(&joined) {
        if value.is_object() {
            return Ok(value);
        }
    }

    Err(HarveyError::ToolInternal {
        name: tool_name.to_string(),
        message: "tool did not return JSON content".into(),
        code: None,
    })
}

/// `resources/read` result envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceContent {
    pub uri: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub text: Option<String>,
}

/// Concatenate the text segments of a resource result.
pub fn extract_resource_text(result: Value) -> Result<String> {
    let parsed: ReadResourceResult =
        serde_json::from_value(result).map_err(|e| HarveyError::internal(format!(
            "malformed resource result: {e}"
        )))?;
    let text: Vec<String> = parsed
        .contents
        .into_iter()
        .filter_map(|content| content.text)
        .collect();
    Ok(text.join("\n").trim().to_string())
}

fn joined_text(items: &[ContentItem]) -> String {
    items
        .iter()
        .filter_map(|item| item.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_serialize_with_version_and_id() {
        let request = JsonRpcRequest::new(7, "tools/call", Some(json!({"name": "summary"})));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["id"], 7);
        assert_eq!(wire["method"], "tools/call");

        let notification = JsonRpcNotification::new("notifications/initialized");
        let wire = serde_json::to_value(&notification).unwrap();
        assert!(wire.get("id").is_none());
    }

    #[test]
    fn initialize_declares_no_optional_capabilities() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(params["capabilities"], json!({}));
        assert!(params["capabilities"].get("sampling").is_none());
    }

    #[test]
    fn tool_payload_prefers_structured_content() {
        let result = json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"cardinality": 12}
        });
        let payload = extract_tool_payload("subscriptions", result).unwrap();
        assert_eq!(payload["cardinality"], 12);
    }

    #[test]
    fn tool_payload_falls_back_to_json_text() {
        let result = json!({
            "content": [{"type": "text", "text": "{\"summary\": {\"numberOfFeatures\": 3}}"}]
        });
        let payload = extract_tool_payload("summary", result).unwrap();
        assert_eq!(payload["summary"]["numberOfFeatures"], 3);
    }

    #[test]
    fn tool_errors_and_non_json_content_are_rejected() {
        let result = json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        });
        let err = extract_tool_payload("optimal", result).unwrap_err();
        assert!(matches!(err, HarveyError::ToolInternal { message, .. } if message == "boom"));

        let result = json!({"content": [{"type": "text", "text": "not json"}]});
        assert!(extract_tool_payload("optimal", result).is_err());
    }

    #[test]
    fn resource_text_joins_segments() {
        let result = json!({
            "contents": [
                {"uri": "resource://pricing/specification", "mimeType": "text/markdown", "text": "# Pricing2Yaml"},
                {"text": "Features are declared under `features`."}
            ]
        });
        let text = extract_resource_text(result).unwrap();
        assert!(text.starts_with("# Pricing2Yaml"));
        assert!(text.contains("declared under"));
    }
}
