//! Message channels to MCP servers.
//!
//! A transport moves JSON-RPC messages and nothing else: deadlines, retries
//! and connection state belong to [`crate::mcp::client::RemoteClient`].
//! Dropping a pending `send_request` future releases its request slot, which
//! is how timeouts cancel in-flight calls.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::core::config::servers::ServerDescriptor;
use crate::mcp::client::MCP_METHOD_NOT_FOUND;
use crate::mcp::error::McpError;

pub mod http;
pub mod stdio;
pub mod streamable_http;

/// Server-initiated signals a transport forwards to the client manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ToolsListChanged { server: String },
    ResourcesListChanged { server: String },
    PromptsListChanged { server: String },
    /// The channel closed without being asked to.
    Closed { server: String },
}

impl TransportEvent {
    pub fn server(&self) -> &str {
        match self {
            TransportEvent::ToolsListChanged { server }
            | TransportEvent::ResourcesListChanged { server }
            | TransportEvent::PromptsListChanged { server }
            | TransportEvent::Closed { server } => server,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError>;

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError>;

    fn is_closed(&self) -> bool;

    /// Best effort; never fails.
    async fn close(&self);
}

/// Opens transports for one transport type.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<Arc<dyn McpTransport>, McpError>;

    /// Cheap reachability check run once before the connect retry loop.
    /// Retryable errors are ignored by the caller; others abort the connect.
    async fn preflight(&self, _descriptor: &ServerDescriptor) -> Result<(), McpError> {
        Ok(())
    }
}

/// What a raw inbound JSON-RPC value turned out to be.
pub(crate) enum Inbound {
    Reply(ServerMessage),
    Notification { method: String, params: Value },
    ServerRequest { id: Value, method: String },
    Unreadable,
}

pub(crate) fn classify_inbound(value: Value) -> Inbound {
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    match method {
        Some(method) if value.get("id").is_none() => Inbound::Notification {
            params: value.get("params").cloned().unwrap_or(Value::Null),
            method,
        },
        Some(method) => Inbound::ServerRequest {
            id: value.get("id").cloned().unwrap_or(Value::Null),
            method,
        },
        None => match serde_json::from_value::<ServerMessage>(value) {
            Ok(message) => Inbound::Reply(message),
            Err(_) => Inbound::Unreadable,
        },
    }
}

/// The answer to a request the server sent us. Only `ping` is supported;
/// anything else gets a method-not-found error.
pub(crate) fn reply_to_server_request(server: &str, id: Value, method: &str) -> Value {
    if method == "ping" {
        trace!(server = %server, "Answering MCP server ping");
        return json!({"jsonrpc": "2.0", "id": id, "result": {}});
    }
    debug!(server = %server, method = %method, "Refusing MCP server request");
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": MCP_METHOD_NOT_FOUND, "message": format!("Method not found: {method}")}
    })
}

/// Routes a server notification: list changes become [`TransportEvent`]s and
/// log messages are re-emitted through `tracing`.
pub(crate) fn handle_notification(
    server: &str,
    method: &str,
    params: &Value,
    events: Option<&EventSender>,
) {
    let event = match method {
        "notifications/tools/list_changed" => Some(TransportEvent::ToolsListChanged {
            server: server.to_string(),
        }),
        "notifications/resources/list_changed" => Some(TransportEvent::ResourcesListChanged {
            server: server.to_string(),
        }),
        "notifications/prompts/list_changed" => Some(TransportEvent::PromptsListChanged {
            server: server.to_string(),
        }),
        "notifications/message" => {
            emit_server_log(server, params);
            None
        }
        other => {
            trace!(server = %server, method = %other, "Ignoring MCP notification");
            None
        }
    };

    if let (Some(event), Some(events)) = (event, events) {
        debug!(server = %server, method = %method, "Forwarding MCP notification");
        let _ = events.send(event);
    }
}

fn emit_server_log(server: &str, params: &Value) {
    let level = params
        .get("level")
        .and_then(Value::as_str)
        .unwrap_or("info");
    let logger = params.get("logger").and_then(Value::as_str).unwrap_or("");
    let message = match params.get("data") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    match level {
        "debug" => debug!(server = %server, logger = %logger, "{message}"),
        "info" | "notice" => info!(server = %server, logger = %logger, "{message}"),
        "warning" => warn!(server = %server, logger = %logger, "{message}"),
        // error, critical, alert, emergency
        _ => error!(server = %server, logger = %logger, "{message}"),
    }
}
