//! One connection to one MCP server.
//!
//! [`RemoteClient`] owns the connect/retry loop, the connection state and the
//! remote operations. The wire work is delegated to a transport chosen by
//! [`factory::ClientFactory`]: stdio servers run as child processes, sse
//! servers are reached over streamable HTTP.

use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::{
    CallToolRequestParams, GetPromptRequestParams, LoggingLevel, PaginatedRequestParams,
    ReadResourceRequestParams, SetLevelRequestParams,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::data::Settings;
use crate::core::config::servers::{ServerDescriptor, TransportType};
use crate::mcp::error::{ErrorKind, McpError};
use crate::mcp::tool::{
    list_items, tools_from_list_result, RemotePrompt, RemoteResource, RemoteTool,
};
use crate::mcp::transport::{EventSender, McpTransport, TransportConnector, TransportEvent};

pub mod factory;
pub mod invoker;
pub mod protocol;
pub mod retry;
pub mod status;

use invoker::TimeoutGuardedInvoker;
use protocol::{
    check_initialize_result, client_details_for, parse_prompt_result, parse_resource_contents,
    parse_response_value, PromptResult, ResourceContents, ToolCallOutcome,
};
use retry::RetryPolicy;
use status::{ClientStatus, ConnectionState};

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;
const MCP_MAX_LIST_PAGES: usize = 20;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Deadlines applied by a [`RemoteClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub health_check_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connection_timeout: settings.connection_timeout(),
            request_timeout: settings.request_timeout(),
            tool_call_timeout: settings.tool_call_timeout(),
            health_check_timeout: settings.health_check_timeout(),
            retry: RetryPolicy::from_settings(settings),
        }
    }
}

pub struct RemoteClient {
    descriptor: ServerDescriptor,
    connector: Arc<dyn TransportConnector>,
    events: Option<EventSender>,
    transport: tokio::sync::RwLock<Option<Arc<dyn McpTransport>>>,
    connect_lock: tokio::sync::Mutex<()>,
    status: Arc<ClientStatus>,
    invoker: TimeoutGuardedInvoker,
    options: ClientOptions,
    server_info: RwLock<Option<Value>>,
}

impl RemoteClient {
    pub fn new(
        descriptor: ServerDescriptor,
        connector: Arc<dyn TransportConnector>,
        options: ClientOptions,
        events: Option<EventSender>,
    ) -> Self {
        let status = Arc::new(ClientStatus::new(
            descriptor.name.clone(),
            options.retry.max_retries,
        ));
        Self {
            invoker: TimeoutGuardedInvoker::new(descriptor.name.clone()),
            descriptor,
            connector,
            events,
            transport: tokio::sync::RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            status,
            options,
            server_info: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn transport_type(&self) -> &TransportType {
        &self.descriptor.transport
    }

    pub fn status(&self) -> &Arc<ClientStatus> {
        &self.status
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The `initialize` result of the current session.
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Connects, retrying transient failures with backoff. Never returns an
    /// error; the reason for a `false` is kept in the status.
    pub async fn connect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        match self.status.state() {
            ConnectionState::Shutdown => return false,
            ConnectionState::Connected => return true,
            _ => {}
        }

        if let Some(problem) = self.descriptor.validation_problem() {
            self.fail(McpError::Config(problem));
            return false;
        }

        self.status.set_state(ConnectionState::Connecting);
        if let Err(err) = self.connector.preflight(&self.descriptor).await {
            if !err.is_retryable() {
                warn!(server = %self.name(), error = %err, "MCP endpoint pre-flight failed; not retrying");
                self.fail(err);
                return false;
            }
            debug!(server = %self.name(), error = %err, "MCP endpoint pre-flight inconclusive");
        }

        let attempts = self.options.retry.attempts();
        for attempt in 1..=attempts {
            let started = Instant::now();
            let result = self
                .invoker
                .invoke(
                    "initialize",
                    self.options.connection_timeout,
                    self.open_session(),
                )
                .await;

            match result {
                Ok(transport) => {
                    *self.transport.write().await = Some(transport);
                    if !self.status.set_state(ConnectionState::Connected) {
                        self.close_transport().await;
                        return false;
                    }
                    self.status.set_last_error(None);
                    self.status.record_health_check(true);
                    self.status.touch();
                    info!(
                        server = %self.name(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Connected to MCP server"
                    );
                    self.set_logging_level_best_effort().await;
                    return true;
                }
                Err(err) => {
                    let failures = self.status.increment_reconnect_attempts();
                    self.status.set_last_error(Some(err.to_string()));
                    warn!(
                        server = %self.name(),
                        attempt,
                        failures,
                        error = %err,
                        "MCP connect attempt failed"
                    );
                    if !err.is_retryable() || err.kind() == ErrorKind::Shutdown {
                        self.fail(err);
                        return false;
                    }
                    if attempt < attempts {
                        self.status.set_state(ConnectionState::Reconnecting);
                        tokio::time::sleep(self.options.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        self.status.set_state(ConnectionState::Error);
        false
    }

    async fn open_session(&self) -> Result<Arc<dyn McpTransport>, McpError> {
        let transport = self
            .connector
            .open(&self.descriptor, self.events.clone())
            .await?;
        match self.initialize(transport.as_ref()).await {
            Ok(info) => {
                *self
                    .server_info
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(info);
                Ok(transport)
            }
            Err(err) => {
                transport.close().await;
                Err(err)
            }
        }
    }

    async fn initialize(&self, transport: &dyn McpTransport) -> Result<Value, McpError> {
        let reply = transport
            .send_request(RequestFromClient::InitializeRequest(client_details_for(
                &self.descriptor,
            )))
            .await?;
        let info = parse_response_value(reply)?;
        let version = check_initialize_result(&info)?;
        debug!(server = %self.name(), protocol_version = %version, "MCP session initialized");
        transport
            .send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(info)
    }

    fn fail(&self, err: McpError) {
        self.status.set_last_error(Some(err.to_string()));
        self.status.set_state(ConnectionState::Error);
    }

    async fn set_logging_level_best_effort(&self) {
        if let Err(err) = self.set_logging_level(LoggingLevel::Info).await {
            debug!(server = %self.name(), error = %err, "MCP server did not accept logging level");
        }
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        let request =
            RequestFromClient::SetLevelRequest(SetLevelRequestParams { level, meta: None });
        self.request("logging/setLevel", self.options.request_timeout, request)
            .await
            .map(|_| ())
    }

    async fn close_transport(&self) {
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            self.invoker.close(CLOSE_GRACE, transport.close()).await;
        }
    }

    pub async fn disconnect(&self) {
        self.close_transport().await;
        if self.status.state() != ConnectionState::Shutdown {
            self.status.set_state(ConnectionState::Disconnected);
        }
        debug!(server = %self.name(), "Disconnected from MCP server");
    }

    /// Disconnects and moves to the terminal state. Calls in flight end with
    /// [`McpError::Shutdown`].
    pub async fn shutdown(&self) {
        self.invoker.cancel_all();
        self.status.set_state(ConnectionState::Shutdown);
        self.close_transport().await;
    }

    pub async fn reconnect(&self) -> bool {
        self.disconnect().await;
        self.connect().await
    }

    /// Drops a session found dead and reports it as a
    /// [`TransportEvent::Closed`] so the manager unregisters its tools.
    async fn mark_disconnected(&self, err: &McpError) {
        let was_connected = self.is_connected();
        warn!(server = %self.name(), error = %err, "Marking MCP server disconnected");
        self.status.set_last_error(Some(err.to_string()));
        self.close_transport().await;
        self.status.set_state(ConnectionState::Disconnected);
        if let (true, Some(events)) = (was_connected, &self.events) {
            let _ = events.send(TransportEvent::Closed {
                server: self.name().to_string(),
            });
        }
    }

    async fn live_transport(&self) -> Result<Arc<dyn McpTransport>, McpError> {
        if !self.is_connected() {
            return Err(McpError::not_connected(self.name()));
        }
        let transport = self.transport.read().await.clone();
        match transport {
            Some(transport) if !transport.is_closed() => Ok(transport),
            _ => {
                let err = McpError::not_connected(self.name());
                self.mark_disconnected(&err).await;
                Err(err)
            }
        }
    }

    async fn request(
        &self,
        operation: &str,
        deadline: Duration,
        request: RequestFromClient,
    ) -> Result<Value, McpError> {
        let transport = self.live_transport().await?;
        let started = Instant::now();
        let result = self
            .invoker
            .invoke(operation, deadline, async {
                parse_response_value(transport.send_request(request).await?)
            })
            .await;
        self.status.record_request(started.elapsed(), result.is_ok());

        if let Err(err) = &result {
            debug!(server = %self.name(), operation = %operation, error = %err, "MCP request failed");
            if err.kind() == ErrorKind::Network || transport.is_closed() {
                self.mark_disconnected(err).await;
            }
        }
        result
    }

    fn supports(&self, capability: &str) -> bool {
        self.server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|info| info.get("capabilities"))
            .map(|capabilities| capabilities.get(capability).is_some())
            .unwrap_or(true)
    }

    /// Follows `nextCursor` pages and returns every result object. A server
    /// that does not implement the method yields no pages.
    async fn list_pages(
        &self,
        operation: &str,
        deadline: Duration,
        build: impl Fn(Option<PaginatedRequestParams>) -> RequestFromClient,
    ) -> Result<Vec<Value>, McpError> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MCP_MAX_LIST_PAGES {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                cursor: Some(cursor),
                meta: None,
            });
            let page = match self.request(operation, deadline, build(params)).await {
                Ok(page) => page,
                Err(McpError::Remote { code, .. }) if code == MCP_METHOD_NOT_FOUND => break,
                Err(err) => return Err(err),
            };
            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|next| !next.is_empty())
                .map(str::to_string);
            pages.push(page);
            if cursor.is_none() {
                break;
            }
        }
        Ok(pages)
    }

    async fn fetch_tools(&self, deadline: Duration) -> Result<Vec<RemoteTool>, McpError> {
        let pages = self
            .list_pages("tools/list", deadline, RequestFromClient::ListToolsRequest)
            .await?;
        let tools: Vec<RemoteTool> = pages
            .iter()
            .flat_map(|page| tools_from_list_result(self.name(), page))
            .collect();
        self.status.set_counts(Some(tools.len() as i64), None, None);
        Ok(tools)
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        self.fetch_tools(self.options.request_timeout).await
    }

    pub async fn list_resources(&self) -> Result<Vec<RemoteResource>, McpError> {
        if !self.supports("resources") {
            self.live_transport().await?;
            return Ok(Vec::new());
        }
        let pages = self
            .list_pages(
                "resources/list",
                self.options.request_timeout,
                RequestFromClient::ListResourcesRequest,
            )
            .await?;
        let resources: Vec<RemoteResource> = pages
            .iter()
            .flat_map(|page| list_items::<RemoteResource>(page, "resources"))
            .collect();
        self.status
            .set_counts(None, Some(resources.len() as i64), None);
        Ok(resources)
    }

    pub async fn list_prompts(&self) -> Result<Vec<RemotePrompt>, McpError> {
        if !self.supports("prompts") {
            self.live_transport().await?;
            return Ok(Vec::new());
        }
        let pages = self
            .list_pages(
                "prompts/list",
                self.options.request_timeout,
                RequestFromClient::ListPromptsRequest,
            )
            .await?;
        let prompts: Vec<RemotePrompt> = pages
            .iter()
            .flat_map(|page| list_items::<RemotePrompt>(page, "prompts"))
            .collect();
        self.status.set_counts(None, None, Some(prompts.len() as i64));
        Ok(prompts)
    }

    /// Rejects tools outside the descriptor's allow-list without contacting
    /// the server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallOutcome, McpError> {
        if !self.descriptor.is_tool_allowed(name) {
            return Err(McpError::NotAllowed {
                client: self.name().to_string(),
                target: format!("tool {name}"),
            });
        }
        let params = CallToolRequestParams::new(name).with_arguments(arguments);
        let value = self
            .request(
                "tools/call",
                self.options.tool_call_timeout,
                RequestFromClient::CallToolRequest(params),
            )
            .await?;
        ToolCallOutcome::from_result(value)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        if !self.descriptor.is_resource_allowed(uri) {
            return Err(McpError::NotAllowed {
                client: self.name().to_string(),
                target: format!("resource {uri}"),
            });
        }
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let value = self
            .request(
                "resources/read",
                self.options.request_timeout,
                RequestFromClient::ReadResourceRequest(params),
            )
            .await?;
        parse_resource_contents(value)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<PromptResult, McpError> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
            meta: None,
        };
        let value = self
            .request(
                "prompts/get",
                self.options.request_timeout,
                RequestFromClient::GetPromptRequest(params),
            )
            .await?;
        parse_prompt_result(value)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.request(
            "ping",
            self.options.health_check_timeout,
            RequestFromClient::PingRequest(None),
        )
        .await
        .map(|_| ())
    }

    /// Short-deadline `tools/list`. A failure marks the client disconnected.
    pub async fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            self.status.record_health_check(false);
            return false;
        }
        match self.fetch_tools(self.options.health_check_timeout).await {
            Ok(_) => {
                self.status.record_health_check(true);
                self.status.touch();
                true
            }
            Err(err) => {
                self.status.record_health_check(false);
                if self.is_connected() {
                    self.mark_disconnected(&err).await;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests;
