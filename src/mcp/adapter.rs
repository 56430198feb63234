//! Remote tools as catalog functions.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mcp::client::protocol::ToolCallOutcome;
use crate::mcp::client::RemoteClient;
use crate::mcp::error::{ErrorKind, McpError};
use crate::mcp::permissions::{PermissionEngine, Principal};
use crate::mcp::schema::SchemaValidator;
use crate::mcp::tool::RemoteTool;

pub const MCP_CATEGORY: &str = "mcp";
pub const ADAPTER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    PermissionDenied,
    NotAllowed,
    Disconnected,
    Timeout,
    Cancelled,
    UnknownFunction,
    /// The tool ran and reported an error itself.
    ToolError,
    Internal,
}

impl FailureKind {
    fn from_error(err: &McpError) -> Self {
        match err.kind() {
            ErrorKind::Validation => FailureKind::Validation,
            ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
            ErrorKind::NotAllowed => FailureKind::NotAllowed,
            ErrorKind::NotConnected | ErrorKind::Network => FailureKind::Disconnected,
            ErrorKind::Timeout => FailureKind::Timeout,
            ErrorKind::Shutdown => FailureKind::Cancelled,
            ErrorKind::Config | ErrorKind::Protocol | ErrorKind::Remote => FailureKind::Internal,
        }
    }
}

/// What a catalog function hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionResult {
    Success {
        text: String,
        data: Option<Map<String, Value>>,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl FunctionResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        FunctionResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FunctionResult::Success { .. })
    }

    pub fn text(&self) -> &str {
        match self {
            FunctionResult::Success { text, .. } => text,
            FunctionResult::Failure { message, .. } => message,
        }
    }
}

impl fmt::Display for FunctionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionResult::Success { text, .. } => write!(f, "{text}"),
            FunctionResult::Failure { kind, message } => write!(f, "{kind:?}: {message}"),
        }
    }
}

/// Per-call context from the dispatcher. Cancelling the token abandons the
/// remote call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancellation: CancellationToken,
}

/// The function-catalog contract.
#[async_trait]
pub trait CatalogFunction: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    async fn execute(
        &self,
        principal: &dyn Principal,
        context: &CallContext,
        arguments: Value,
    ) -> FunctionResult;

    fn has_permission(&self, principal: &dyn Principal) -> bool;

    fn is_enabled(&self) -> bool;

    fn category(&self) -> &str;
}

pub struct ToolAdapter {
    tool: RemoteTool,
    description: String,
    client: Arc<RemoteClient>,
    permissions: Option<Arc<PermissionEngine>>,
    validator: SchemaValidator,
}

impl fmt::Debug for ToolAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolAdapter")
            .field("name", &self.tool.full_name)
            .field("client", &self.tool.client_name)
            .finish()
    }
}

impl ToolAdapter {
    /// `tool.full_name` must already hold the resolved catalog key.
    pub fn new(
        tool: RemoteTool,
        client: Arc<RemoteClient>,
        permissions: Option<Arc<PermissionEngine>>,
    ) -> Self {
        let description = tagged_description(&tool);
        Self {
            tool,
            description,
            client,
            permissions,
            validator: SchemaValidator,
        }
    }

    pub fn tool(&self) -> &RemoteTool {
        &self.tool
    }

    pub fn client_name(&self) -> &str {
        &self.tool.client_name
    }

    pub fn client(&self) -> &Arc<RemoteClient> {
        &self.client
    }

    async fn call_remote(
        &self,
        context: &CallContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallOutcome, McpError> {
        tokio::select! {
            _ = context.cancellation.cancelled() => Err(McpError::Shutdown {
                client: self.tool.client_name.clone(),
            }),
            result = tokio::time::timeout(
                ADAPTER_CALL_TIMEOUT,
                self.client.call_tool(&self.tool.name, arguments),
            ) => result.unwrap_or_else(|_| Err(McpError::timeout("tools/call", ADAPTER_CALL_TIMEOUT))),
        }
    }
}

fn tagged_description(tool: &RemoteTool) -> String {
    let description = tool.description.trim();
    let description = if description.is_empty() {
        tool.title.as_deref().unwrap_or(&tool.name)
    } else {
        description
    };
    format!("[MCP:{}] {description}", tool.client_name)
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Success text is the joined text fragments; data holds the structured
/// content's fields plus every content item as `content_{i}`.
pub(crate) fn outcome_to_result(tool: &str, outcome: ToolCallOutcome) -> FunctionResult {
    let text = outcome.text();
    if outcome.is_error {
        let message = if text.trim().is_empty() {
            format!("MCP tool {tool} reported an error")
        } else {
            text
        };
        return FunctionResult::failure(FailureKind::ToolError, message);
    }

    let mut data = outcome.structured_content.unwrap_or_default();
    for (index, item) in outcome.content.iter().enumerate() {
        let Some(source) = item.as_object() else {
            continue;
        };
        let entry: Map<String, Value> = ["type", "text", "data", "mimeType"]
            .iter()
            .filter_map(|key| source.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect();
        if !entry.is_empty() {
            data.insert(format!("content_{index}"), Value::Object(entry));
        }
    }

    FunctionResult::Success {
        text: if text.trim().is_empty() {
            format!("MCP tool {tool} completed")
        } else {
            text
        },
        data: (!data.is_empty()).then_some(data),
    }
}

#[async_trait]
impl CatalogFunction for ToolAdapter {
    fn name(&self) -> &str {
        &self.tool.full_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        match &self.tool.input_schema {
            Some(schema @ Value::Object(_)) => schema.clone(),
            _ => empty_object_schema(),
        }
    }

    async fn execute(
        &self,
        principal: &dyn Principal,
        context: &CallContext,
        arguments: Value,
    ) -> FunctionResult {
        let name = self.name();
        let arguments = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => {
                return FunctionResult::failure(
                    FailureKind::Validation,
                    "Tool arguments must be a JSON object",
                )
            }
        };
        if let Err(reason) = self
            .validator
            .explain(&Value::Object(arguments.clone()), &self.parameters_schema())
        {
            debug!(tool = %name, reason = %reason, "Rejected MCP tool arguments");
            return FunctionResult::failure(
                FailureKind::Validation,
                format!("Invalid arguments for {name}: {reason}"),
            );
        }
        if !self.has_permission(principal) {
            return FunctionResult::failure(
                FailureKind::PermissionDenied,
                McpError::PermissionDenied {
                    principal: principal.display_name().to_string(),
                    tool: name.to_string(),
                }
                .to_string(),
            );
        }

        let started = Instant::now();
        match self.call_remote(context, arguments).await {
            Ok(outcome) => {
                debug!(
                    tool = %name,
                    principal = %principal.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    is_error = outcome.is_error,
                    "MCP tool call finished"
                );
                outcome_to_result(name, outcome)
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "MCP tool call failed");
                let message = match &err {
                    McpError::Remote { message, .. } => message.clone(),
                    _ => format!("MCP tool {name} failed: {err}"),
                };
                FunctionResult::failure(FailureKind::from_error(&err), message)
            }
        }
    }

    fn has_permission(&self, principal: &dyn Principal) -> bool {
        self.permissions
            .as_ref()
            .is_none_or(|engine| engine.check(principal, &self.tool))
    }

    fn is_enabled(&self) -> bool {
        self.client.is_connected()
    }

    fn category(&self) -> &str {
        MCP_CATEGORY
    }
}
