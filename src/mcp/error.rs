//! Typed failures for MCP client operations.
//!
//! Retry decisions dispatch on [`ErrorKind`], which transports assign when the
//! failure happens rather than by inspecting message text afterwards.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use rust_mcp_schema::RpcError;

/// Closed set of failure categories shared by transports, clients and adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Protocol,
    Network,
    Timeout,
    PermissionDenied,
    Validation,
    NotConnected,
    NotAllowed,
    Remote,
    Shutdown,
}

impl ErrorKind {
    /// Only transient transport failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }

    /// 1 (minor) through 5 (fatal).
    pub fn severity(self) -> u8 {
        match self {
            ErrorKind::Validation => 1,
            ErrorKind::PermissionDenied | ErrorKind::NotAllowed => 2,
            ErrorKind::Timeout | ErrorKind::NotConnected => 3,
            ErrorKind::Protocol | ErrorKind::Remote => 4,
            ErrorKind::Config | ErrorKind::Network | ErrorKind::Shutdown => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Validation => "validation",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::NotAllowed => "not_allowed",
            ErrorKind::Remote => "remote",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpError {
    /// Descriptor fields are missing or malformed.
    Config(String),
    /// The remote side answered with something that is not MCP.
    Protocol(String),
    /// Connection refused, reset, or the process went away.
    Network(String),
    /// An operation exceeded its deadline.
    Timeout { operation: String, after: Duration },
    PermissionDenied { principal: String, tool: String },
    Validation(String),
    NotConnected { client: String },
    /// Blocked by the descriptor's allowed tools or resources.
    NotAllowed { client: String, target: String },
    /// JSON-RPC error object returned by the server.
    Remote { code: i64, message: String },
    /// The client was shut down while the call was in flight.
    Shutdown { client: String },
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Config(_) => ErrorKind::Config,
            McpError::Protocol(_) => ErrorKind::Protocol,
            McpError::Network(_) => ErrorKind::Network,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            McpError::Validation(_) => ErrorKind::Validation,
            McpError::NotConnected { .. } => ErrorKind::NotConnected,
            McpError::NotAllowed { .. } => ErrorKind::NotAllowed,
            McpError::Remote { .. } => ErrorKind::Remote,
            McpError::Shutdown { .. } => ErrorKind::Shutdown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        McpError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn not_connected(client: impl Into<String>) -> Self {
        McpError::NotConnected {
            client: client.into(),
        }
    }

    pub fn from_rpc(error: &RpcError) -> Self {
        let mut message = error.message.clone();
        if let Some(data) = &error.data {
            let details = data
                .get("details")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string())
                .or_else(|| data.as_str().map(|value| value.to_string()));
            if let Some(details) = details.filter(|details| !details.is_empty()) {
                message.push_str(": ");
                message.push_str(&details);
            }
        }
        McpError::Remote {
            code: error.code,
            message,
        }
    }

    /// Classifies an HTTP client failure. Client-side 4xx answers are treated
    /// as configuration or protocol mismatches and never retried.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return McpError::timeout("http request", Duration::ZERO);
        }
        if err.is_builder() {
            return McpError::Config(err.to_string());
        }
        if err.is_decode() {
            return McpError::Protocol(err.to_string());
        }
        if let Some(status) = err.status() {
            return McpError::from_status(status);
        }
        McpError::Network(err.to_string())
    }

    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_client_error() {
            McpError::Protocol(format!("HTTP error: {status}"))
        } else {
            McpError::Network(format!("HTTP error: {status}"))
        }
    }

    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                McpError::Config(err.to_string())
            }
            std::io::ErrorKind::TimedOut => McpError::timeout("io", Duration::ZERO),
            _ => McpError::Network(err.to_string()),
        }
    }

    pub fn from_json(err: serde_json::Error) -> Self {
        McpError::Protocol(err.to_string())
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpError::Config(message) => write!(f, "Invalid MCP configuration: {message}"),
            McpError::Protocol(message) => write!(f, "MCP protocol error: {message}"),
            McpError::Network(message) => write!(f, "MCP connection error: {message}"),
            McpError::Timeout { operation, after } if after.is_zero() => {
                write!(f, "MCP {operation} timed out")
            }
            McpError::Timeout { operation, after } => {
                write!(f, "MCP {operation} timed out after {}ms", after.as_millis())
            }
            McpError::PermissionDenied { principal, tool } => {
                write!(f, "Permission denied: {principal} may not use {tool}")
            }
            McpError::Validation(message) => write!(f, "Invalid arguments: {message}"),
            McpError::NotConnected { client } => {
                write!(f, "MCP server {client} is not connected")
            }
            McpError::NotAllowed { client, target } => {
                write!(f, "{target} is not allowed on MCP server {client}")
            }
            McpError::Remote { code, message } => write!(f, "MCP error {code}: {message}"),
            McpError::Shutdown { client } => write!(f, "MCP server {client} was shut down"),
        }
    }
}

impl StdError for McpError {}
