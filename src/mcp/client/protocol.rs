use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, LATEST_PROTOCOL_VERSION,
};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::config::servers::ServerDescriptor;
use crate::mcp::error::McpError;

pub(crate) fn requested_protocol_version(descriptor: &ServerDescriptor) -> String {
    descriptor
        .protocol_version
        .clone()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub(crate) fn client_details_for(descriptor: &ServerDescriptor) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "relais".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Relais MCP Client".to_string()),
            description: Some("Relais MCP client runtime".to_string()),
            icons: Vec::new(),
            website_url: Some("https://github.com/permacommons/relais".to_string()),
        },
        meta: None,
        protocol_version: requested_protocol_version(descriptor),
    }
}

/// Extracts the `result` of a reply, turning JSON-RPC errors into
/// [`McpError::Remote`].
pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(McpError::from_json)
        }
        ServerMessage::Error(error) => Err(McpError::from_rpc(&error.error)),
        ServerMessage::Request(_) => Err(McpError::Protocol(
            "Unexpected MCP server request in place of a response.".into(),
        )),
        ServerMessage::Notification(_) => Err(McpError::Protocol(
            "Unexpected MCP notification in place of a response.".into(),
        )),
    }
}

/// Initialize replies must at least name a protocol version.
pub(crate) fn check_initialize_result(value: &Value) -> Result<String, McpError> {
    value
        .get("protocolVersion")
        .and_then(Value::as_str)
        .filter(|version| !version.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| McpError::Protocol("Unexpected initialize response.".into()))
}

/// Outcome of `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub structured_content: Option<Map<String, Value>>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallOutcome {
    pub fn from_result(value: Value) -> Result<Self, McpError> {
        serde_json::from_value(value).map_err(McpError::from_json)
    }

    /// Text fragments joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Base64 payload for binary resources.
    #[serde(default)]
    pub blob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadResourceWire {
    #[serde(default)]
    contents: Vec<ResourceContents>,
}

pub(crate) fn parse_resource_contents(value: Value) -> Result<Vec<ResourceContents>, McpError> {
    serde_json::from_value::<ReadResourceWire>(value)
        .map(|wire| wire.contents)
        .map_err(McpError::from_json)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptResult {
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

pub(crate) fn parse_prompt_result(value: Value) -> Result<PromptResult, McpError> {
    let messages = value
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| McpError::Protocol("prompt result has no messages".into()))?
        .iter()
        .map(|message| {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string();
            let content = message.get("content").cloned().unwrap_or(Value::Null);
            let text = match content.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => content.to_string(),
            };
            PromptMessage { role, text }
        })
        .collect();
    Ok(PromptResult {
        description: value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_protocol_version_wins() {
        let mut descriptor = ServerDescriptor::stdio("files", "uvx");
        assert_eq!(
            client_details_for(&descriptor).protocol_version,
            LATEST_PROTOCOL_VERSION
        );
        descriptor.protocol_version = Some("2025-03-26".to_string());
        assert_eq!(
            client_details_for(&descriptor).protocol_version,
            "2025-03-26"
        );
    }

    #[test]
    fn initialize_without_version_is_rejected() {
        assert!(check_initialize_result(&json!({"protocolVersion": "2025-06-18"})).is_ok());
        assert!(check_initialize_result(&json!({"serverInfo": {}})).is_err());
    }

    #[test]
    fn tool_outcome_stitches_text_fragments() {
        let outcome = ToolCallOutcome::from_result(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "second"}
            ],
            "isError": false
        }))
        .expect("outcome");
        assert_eq!(outcome.text(), "first\nsecond");
        assert!(!outcome.is_error);
    }

    #[test]
    fn prompt_messages_flatten_to_text() {
        let result = parse_prompt_result(json!({
            "description": "Summaries",
            "messages": [{"role": "user", "content": {"type": "text", "text": "Summarize"}}]
        }))
        .expect("prompt");
        assert_eq!(result.messages[0].text, "Summarize");
        assert_eq!(result.description.as_deref(), Some("Summaries"));
    }

    #[test]
    fn resource_contents_parse() {
        let contents = parse_resource_contents(json!({
            "contents": [{"uri": "file:///a.txt", "mimeType": "text/plain", "text": "hi"}]
        }))
        .expect("contents");
        assert_eq!(contents[0].text.as_deref(), Some("hi"));
    }
}
