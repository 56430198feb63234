//! In-memory MCP server used by client, registry and integration tests.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::config::data::Settings;
use crate::core::config::servers::ServerDescriptor;
use crate::mcp::client::factory::ClientFactory;
use crate::mcp::client::retry::RetryPolicy;
use crate::mcp::client::{ClientOptions, RemoteClient};
use crate::mcp::error::McpError;
use crate::mcp::manager::ClientManager;
use crate::mcp::transport::{EventSender, McpTransport, TransportConnector, TransportEvent};

/// Scripted answers for one fake server. Every request method received is
/// recorded, in order, in `methods`.
#[derive(Default)]
pub struct ScriptedServer {
    pub name: String,
    pub tools: Mutex<Vec<Value>>,
    /// `None` answers the list call with "method not found".
    pub resources: Mutex<Option<Vec<Value>>>,
    pub prompts: Mutex<Option<Vec<Value>>>,
    pub call_results: Mutex<HashMap<String, Value>>,
    pub methods: Mutex<Vec<String>>,
    pub hang_initialize: AtomicBool,
    pub hang_calls: AtomicBool,
    pub failing: AtomicBool,
    pub open_failure: Mutex<Option<McpError>>,
    /// Returned by the connector's pre-flight reachability check.
    pub preflight_failure: Mutex<Option<McpError>>,
    pub preflights: AtomicUsize,
    pub opens: AtomicUsize,
    events: Mutex<Option<EventSender>>,
}

impl ScriptedServer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }

    pub fn with_tools(name: &str, tools: &[&str]) -> Arc<Self> {
        let server = Self::new(name);
        server.set_tools(tools);
        server
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock().expect("tools") = tools.iter().map(|name| tool_json(name)).collect();
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().expect("methods").clone()
    }

    pub fn received(&self, method: &str) -> usize {
        self.methods().iter().filter(|seen| *seen == method).count()
    }

    /// Sends `notifications/tools/list_changed` through the last opened
    /// transport.
    pub fn notify_tools_changed(&self) {
        if let Some(events) = self.events.lock().expect("events").as_ref() {
            let _ = events.send(TransportEvent::ToolsListChanged {
                server: self.name.clone(),
            });
        }
    }

    fn answer(&self, method: &str, params: &Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {"listChanged": true}, "resources": {}, "prompts": {}, "logging": {}},
                "serverInfo": {"name": self.name, "version": "0.1.0"}
            })),
            "tools/list" => Ok(json!({"tools": self.tools.lock().expect("tools").clone()})),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let result = self.call_results.lock().expect("results").get(name).cloned();
                Ok(result.unwrap_or_else(|| {
                    json!({"content": [{"type": "text", "text": format!("{name} ok")}], "isError": false})
                }))
            }
            "resources/list" => match self.resources.lock().expect("resources").clone() {
                Some(resources) => Ok(json!({"resources": resources})),
                None => Err((-32601, "Method not found".to_string())),
            },
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}")}]}))
            }
            "prompts/list" => match self.prompts.lock().expect("prompts").clone() {
                Some(prompts) => Ok(json!({"prompts": prompts})),
                None => Err((-32601, "Method not found".to_string())),
            },
            "prompts/get" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({
                    "description": format!("{name} prompt"),
                    "messages": [{"role": "user", "content": {"type": "text", "text": format!("run {name}")}}]
                }))
            }
            "ping" | "logging/setLevel" => Ok(json!({})),
            other => Err((-32601, format!("Method not found: {other}"))),
        }
    }
}

pub fn tool_json(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        }
    })
}

pub struct ScriptedConnector {
    pub server: Arc<ScriptedServer>,
}

impl ScriptedConnector {
    pub fn new(server: Arc<ScriptedServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn open(
        &self,
        _descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        self.server.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.server.open_failure.lock().expect("failure").clone() {
            return Err(err);
        }
        *self.server.events.lock().expect("events") = events;
        Ok(Arc::new(ScriptedTransport {
            server: self.server.clone(),
            next_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    async fn preflight(&self, _descriptor: &ServerDescriptor) -> Result<(), McpError> {
        self.server.preflights.fetch_add(1, Ordering::SeqCst);
        match self.server.preflight_failure.lock().expect("failure").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct ScriptedTransport {
    server: Arc<ScriptedServer>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(id)),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        let wire = serde_json::to_value(&message).map_err(McpError::from_json)?;
        let method = wire
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = wire.get("params").cloned().unwrap_or(Value::Null);
        self.server.methods.lock().expect("methods").push(method.clone());

        if self.closed.load(Ordering::SeqCst) || self.server.failing.load(Ordering::SeqCst) {
            return Err(McpError::Network("scripted server unreachable".into()));
        }
        let hang = match method.as_str() {
            "initialize" => self.server.hang_initialize.load(Ordering::SeqCst),
            "tools/call" => self.server.hang_calls.load(Ordering::SeqCst),
            _ => false,
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let reply = match self.server.answer(&method, &params) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        serde_json::from_value(reply).map_err(McpError::from_json)
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        let wire = serde_json::to_value(&message).map_err(McpError::from_json)?;
        if let Some(method) = wire.get("method").and_then(Value::as_str) {
            self.server.methods.lock().expect("methods").push(method.to_string());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Short deadlines and no backoff so failure paths finish quickly.
pub fn fast_options(max_retries: u32) -> ClientOptions {
    ClientOptions {
        connection_timeout: Duration::from_millis(100),
        request_timeout: Duration::from_millis(500),
        tool_call_timeout: Duration::from_millis(500),
        health_check_timeout: Duration::from_millis(100),
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    }
}

pub fn scripted_client(descriptor: ServerDescriptor, server: &Arc<ScriptedServer>) -> RemoteClient {
    RemoteClient::new(
        descriptor,
        ScriptedConnector::new(server.clone()),
        fast_options(3),
        None,
    )
}

/// A manager whose clients talk to the given scripted servers, one stdio
/// descriptor per server.
pub fn manager_with(servers: &[Arc<ScriptedServer>]) -> ClientManager {
    let manager = ClientManager::new(ClientFactory::empty(fast_options(1)), &Settings::default());
    for server in servers {
        let client = RemoteClient::new(
            ServerDescriptor::stdio(&server.name, "mcp-server"),
            ScriptedConnector::new(server.clone()),
            fast_options(1),
            Some(manager.event_sender()),
        );
        manager.insert(Arc::new(client)).expect("unique server names");
    }
    manager
}
