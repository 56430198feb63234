//! JSON-RPC over HTTP POST, answered with JSON or a `text/event-stream` body.

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{RequestId, LATEST_PROTOCOL_VERSION};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use super::http::{
    apply_post_headers, apply_protocol_version_header, apply_session_header,
    build_mcp_http_client, preflight_endpoint, MCP_SESSION_ID_HEADER,
};
use super::{
    classify_inbound, handle_notification, reply_to_server_request, EventSender, Inbound,
    McpTransport, TransportConnector,
};
use crate::core::config::servers::ServerDescriptor;
use crate::mcp::error::McpError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let newline = start + offset;
            if let Ok(text) = std::str::from_utf8(&self.buffer[start..newline]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            start = newline + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[start..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if start > 0 {
            self.buffer.drain(..start);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// What arrives on an event stream besides the reply we are waiting for.
pub trait SseSideChannel {
    fn notification(&mut self, method: &str, params: &Value);

    fn server_request(&mut self, id: Value, method: &str);
}

/// Reads event-stream lines until the reply to our request arrives.
/// Notifications and server requests seen on the way go to `side`.
pub async fn next_sse_server_message(
    response: reqwest::Response,
    side: &mut impl SseSideChannel,
) -> Result<ServerMessage, McpError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(McpError::from_http)?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line, side)? {
                return Ok(message);
            }
        }
    }
    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line, side)? {
            return Ok(message);
        }
    }

    Err(McpError::Protocol("Empty event-stream response.".into()))
}

fn decode_sse_line(
    line: &str,
    side: &mut impl SseSideChannel,
) -> Result<Option<ServerMessage>, McpError> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }

    let value = serde_json::from_str::<Value>(payload).map_err(McpError::from_json)?;
    match classify_inbound(value) {
        Inbound::Reply(message) => Ok(Some(message)),
        Inbound::Notification { method, params } => {
            side.notification(&method, &params);
            Ok(None)
        }
        Inbound::ServerRequest { id, method } => {
            side.server_request(id, &method);
            Ok(None)
        }
        Inbound::Unreadable => Err(McpError::Protocol(
            "Unreadable message on event stream.".into(),
        )),
    }
}

pub struct StreamableHttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<String>,
    next_request_id: AtomicI64,
    closed: AtomicBool,
    events: Option<EventSender>,
}

impl StreamableHttpTransport {
    pub fn new(
        client: reqwest::Client,
        descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<Self, McpError> {
        let url = descriptor
            .endpoint_url()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| McpError::Config("MCP url is required for HTTP transports.".into()))?;
        let protocol_version = descriptor
            .protocol_version
            .clone()
            .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string());
        Ok(Self {
            server: descriptor.name.clone(),
            url,
            client,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(protocol_version),
            next_request_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            events,
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn protocol_version(&self) -> String {
        self.protocol_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response, McpError> {
        if self.is_closed() {
            return Err(McpError::Network("MCP HTTP transport is closed.".into()));
        }
        let payload = serde_json::to_string(message).map_err(McpError::from_json)?;
        let protocol_version = self.protocol_version();
        let session_id = self.session_id();
        let request = apply_session_header(
            apply_protocol_version_header(
                apply_post_headers(self.client.post(&self.url)),
                Some(protocol_version.as_str()),
            ),
            session_id.as_deref(),
        )
        .body(payload);

        debug!(server = %self.server, url = %self.url, "Sending MCP HTTP message");
        let response = request.send().await.map_err(McpError::from_http)?;
        if !response.status().is_success() {
            return Err(McpError::from_status(response.status()));
        }

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self
                .session_id
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
        }
        Ok(response)
    }
}

impl StreamableHttpTransport {
    /// Posts the answer to a server request without waiting for it, so the
    /// stream carrying our own reply keeps being read.
    fn answer_server_request(&self, id: Value, method: &str) {
        let reply = reply_to_server_request(&self.server, id, method);
        let protocol_version = self.protocol_version();
        let session_id = self.session_id();
        let request = apply_session_header(
            apply_protocol_version_header(
                apply_post_headers(self.client.post(&self.url)),
                Some(protocol_version.as_str()),
            ),
            session_id.as_deref(),
        )
        .body(reply.to_string());
        let server = self.server.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    debug!(server = %server, status = %response.status(), "Answered MCP server request")
                }
                Err(err) => {
                    debug!(server = %server, error = %err, "Failed to answer MCP server request")
                }
            }
        });
    }
}

struct SessionSide<'a> {
    transport: &'a StreamableHttpTransport,
}

impl SseSideChannel for SessionSide<'_> {
    fn notification(&mut self, method: &str, params: &Value) {
        let transport = self.transport;
        handle_notification(&transport.server, method, params, transport.events.as_ref());
    }

    fn server_request(&mut self, id: Value, method: &str) {
        self.transport.answer_server_request(id, method);
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let initializing = matches!(request, RequestFromClient::InitializeRequest(_));
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;

        let response = self.post(&message).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let server_message = if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response, &mut SessionSide { transport: self }).await?
        } else if content_type.is_empty() || content_type.contains("json") {
            let body = response.bytes().await.map_err(McpError::from_http)?;
            serde_json::from_slice::<ServerMessage>(&body).map_err(McpError::from_json)?
        } else {
            return Err(McpError::Protocol(format!(
                "unexpected content type {content_type}"
            )));
        };

        if initializing {
            if let ServerMessage::Response(response) = &server_message {
                let negotiated = serde_json::to_value(&response.result)
                    .ok()
                    .and_then(|value| {
                        value
                            .get("protocolVersion")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    });
                if let Some(version) = negotiated.filter(|version| !version.trim().is_empty()) {
                    *self
                        .protocol_version
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = version;
                }
            }
        }
        Ok(server_message)
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        self.post(&message).await.map(|_| ())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session_id) = self.session_id() else {
            return;
        };
        let request = apply_session_header(self.client.delete(&self.url), Some(&session_id))
            .timeout(CLOSE_TIMEOUT);
        match request.send().await {
            Ok(response) => {
                debug!(server = %self.server, status = %response.status(), "Closed MCP HTTP session")
            }
            Err(err) => {
                debug!(server = %self.server, error = %err, "MCP HTTP session close failed")
            }
        }
    }
}

pub struct StreamableHttpConnector {
    client: reqwest::Client,
}

impl StreamableHttpConnector {
    pub fn new() -> Result<Self, McpError> {
        Ok(Self {
            client: build_mcp_http_client()?,
        })
    }
}

#[async_trait]
impl TransportConnector for StreamableHttpConnector {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        let transport: Arc<dyn McpTransport> = Arc::new(StreamableHttpTransport::new(
            self.client.clone(),
            descriptor,
            events,
        )?);
        Ok(transport)
    }

    async fn preflight(&self, descriptor: &ServerDescriptor) -> Result<(), McpError> {
        let url = descriptor
            .endpoint_url()
            .ok_or_else(|| McpError::Config("MCP url is required for HTTP transports.".into()))?;
        preflight_endpoint(&self.client, &url).await
    }
}
