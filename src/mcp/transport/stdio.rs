//! Newline-delimited JSON-RPC over a spawned process's standard streams.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    classify_inbound, handle_notification, reply_to_server_request, EventSender, Inbound,
    McpTransport, TransportConnector, TransportEvent,
};
use crate::core::config::servers::ServerDescriptor;
use crate::mcp::error::McpError;

const STDIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;
type SharedStdin = Arc<tokio::sync::Mutex<ChildStdin>>;

/// Removes its pending entry when the waiting future is dropped, so a call
/// abandoned by its deadline does not leave a slot behind.
struct PendingSlot {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct StdioTransport {
    server: String,
    stdin: SharedStdin,
    pending: PendingMap,
    next_request_id: AtomicI64,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    pub fn spawn(
        descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<Arc<Self>, McpError> {
        let command = descriptor
            .command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .ok_or_else(|| McpError::Config("MCP command is required for stdio transport.".into()))?;
        debug!(server = %descriptor.name, command = %command, args = ?descriptor.args, "Starting MCP stdio server");

        let mut cmd = Command::new(command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(McpError::from_io)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Network("Unable to retrieve stdin.".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Network("Unable to retrieve stdout.".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Network("Unable to retrieve stderr.".into()))?;

        let transport = Arc::new(Self {
            server: descriptor.name.clone(),
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicI64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        });

        transport.spawn_stdout_reader(stdout, events);
        spawn_stderr_drain(descriptor.name.clone(), stderr);

        let server = descriptor.name.clone();
        let shutdown = transport.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(server = %server, status = ?status.ok(), "MCP stdio server exited");
                }
                _ = shutdown.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(server = %server, error = %err, "Failed to stop MCP stdio server");
                    }
                }
            }
        });

        Ok(transport)
    }

    fn spawn_stdout_reader(&self, stdout: tokio::process::ChildStdout, events: Option<EventSender>) {
        let pending = self.pending.clone();
        let closed = self.closed.clone();
        let server = self.server.clone();
        let stdin = self.stdin.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(_) => {
                        trace!(server = %server, "Skipping non-JSON stdout line");
                        continue;
                    }
                };
                let items = match value {
                    serde_json::Value::Array(items) => items,
                    single => vec![single],
                };
                for item in items {
                    let Some(reply) = dispatch(&server, &pending, item, events.as_ref()) else {
                        continue;
                    };
                    let stdin = stdin.clone();
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(err) = write_line(&stdin, &server, reply.to_string()).await {
                            debug!(server = %server, error = %err, "Failed to answer MCP server request");
                        }
                    });
                }
            }

            // Dropping the senders wakes every waiter with a closed channel.
            pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
            if !closed.swap(true, Ordering::SeqCst) {
                debug!(server = %server, "MCP stdio stream closed");
                if let Some(events) = events {
                    let _ = events.send(TransportEvent::Closed { server });
                }
            }
        });
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_message(&self, message: &ClientMessage) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Network("MCP stdio stream is closed.".into()));
        }
        let payload = serde_json::to_string(message).map_err(McpError::from_json)?;
        write_line(&self.stdin, &self.server, payload).await
    }
}

async fn write_line(stdin: &SharedStdin, server: &str, payload: String) -> Result<(), McpError> {
    let mut stdin = tokio::time::timeout(STDIN_LOCK_TIMEOUT, stdin.lock())
        .await
        .map_err(|_| McpError::timeout("stdio stdin lock", STDIN_LOCK_TIMEOUT))?;
    trace!(server = %server, bytes = payload.len(), "Writing MCP stdio message");

    tokio::time::timeout(STDIN_WRITE_TIMEOUT, async {
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    })
    .await
    .map_err(|_| McpError::timeout("stdio write", STDIN_WRITE_TIMEOUT))?
    .map_err(McpError::from_io)
}

/// Delivers one inbound message. Returns the reply owed to the server when
/// the message was a request.
fn dispatch(
    server: &str,
    pending: &PendingMap,
    value: serde_json::Value,
    events: Option<&EventSender>,
) -> Option<serde_json::Value> {
    match classify_inbound(value) {
        Inbound::Reply(message) => {
            let id = match &message {
                ServerMessage::Response(response) => Some(response.id.clone()),
                ServerMessage::Error(error) => error.id.clone(),
                _ => None,
            };
            let Some(id) = id else {
                return None;
            };
            let waiter = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!(server = %server, id = ?id, "Dropping reply for abandoned MCP request"),
            }
            None
        }
        Inbound::Notification { method, params } => {
            handle_notification(server, &method, &params, events);
            None
        }
        Inbound::ServerRequest { id, method } => Some(reply_to_server_request(server, id, &method)),
        Inbound::Unreadable => {
            trace!(server = %server, "Skipping unreadable MCP stdio message");
            None
        }
    }
}

fn spawn_stderr_drain(server: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            trace!(server = %server, "stderr: {line}");
        }
    });
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.clone(), tx);
        let _slot = PendingSlot {
            pending: self.pending.clone(),
            id: request_id.clone(),
        };

        self.write_message(&message).await?;
        debug!(server = %self.server, request_id = ?request_id, "MCP stdio request sent");

        rx.await
            .map_err(|_| McpError::Network("MCP stdio response channel closed.".into()))
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        self.write_message(&message).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub struct StdioConnector;

#[async_trait]
impl TransportConnector for StdioConnector {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        let transport: Arc<dyn McpTransport> = StdioTransport::spawn(descriptor, events)?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replies_reach_their_waiter_and_only_once() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending
            .lock()
            .expect("lock")
            .insert(RequestId::Integer(7), tx);

        let reply = json!({"jsonrpc": "2.0", "id": 7, "result": {}});
        assert!(dispatch("files", &pending, reply.clone(), None).is_none());
        assert!(rx.try_recv().is_ok());
        assert!(pending.lock().expect("lock").is_empty());

        assert!(dispatch("files", &pending, reply, None).is_none());
    }

    #[test]
    fn server_ping_is_answered_and_other_requests_refused() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let ping = json!({"jsonrpc": "2.0", "id": 12, "method": "ping"});
        assert_eq!(
            dispatch("files", &pending, ping, None),
            Some(json!({"jsonrpc": "2.0", "id": 12, "result": {}}))
        );

        let roots = json!({"jsonrpc": "2.0", "id": 13, "method": "roots/list"});
        let reply = dispatch("files", &pending, roots, None).expect("reply");
        assert_eq!(reply["id"], json!(13));
        assert_eq!(reply["error"]["code"], json!(-32601));
    }

    #[test]
    fn dropped_slot_releases_pending_entry() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = oneshot::channel();
        pending
            .lock()
            .expect("lock")
            .insert(RequestId::Integer(1), tx);

        drop(PendingSlot {
            pending: pending.clone(),
            id: RequestId::Integer(1),
        });
        assert!(pending.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn missing_executable_is_a_config_error() {
        let descriptor = ServerDescriptor::stdio("ghost", "relais-test-no-such-binary-4f1c");
        let err = StdioTransport::spawn(&descriptor, None)
            .err()
            .expect("spawn should fail");
        assert_eq!(err.kind(), crate::mcp::error::ErrorKind::Config);
    }
}
