use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::streamable_http::is_event_stream_content_type;
use crate::mcp::error::McpError;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const MCP_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MCP_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MCP_HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_mcp_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(MCP_HTTP_CONNECT_TIMEOUT)
        .timeout(MCP_HTTP_REQUEST_TIMEOUT)
        .pool_idle_timeout(MCP_HTTP_POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Config(format!("Failed to build HTTP client: {err}")))
}

pub fn apply_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

pub fn apply_session_header(
    request: reqwest::RequestBuilder,
    session_id: Option<&str>,
) -> reqwest::RequestBuilder {
    match session_id {
        Some(session_id) => request.header(MCP_SESSION_ID_HEADER, session_id),
        None => request,
    }
}

/// How a pre-flight answer affects the connect attempt.
pub(crate) fn classify_preflight_status(status: StatusCode) -> Result<(), McpError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(McpError::Config(format!(
            "MCP endpoint not found ({status})"
        ))),
        // Servers that only speak POST answer the pre-flight GET with these.
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_ACCEPTABLE => Ok(()),
        status if status.is_client_error() => Err(McpError::Protocol(format!(
            "MCP endpoint rejected the pre-flight request ({status})"
        ))),
        status => Err(McpError::Network(format!("HTTP error: {status}"))),
    }
}

pub(crate) fn classify_preflight_body(content_type: &str, first_bytes: &[u8]) -> Result<(), McpError> {
    let mime = content_type
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if mime == "text/html" {
        return Err(McpError::Protocol(
            "endpoint returned an HTML page instead of an MCP stream".into(),
        ));
    }
    let starts_with_markup = first_bytes
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'<');
    if starts_with_markup {
        return Err(McpError::Protocol(
            "endpoint returned markup instead of JSON".into(),
        ));
    }
    Ok(())
}

/// Lightweight GET against the endpoint before the first connect attempt.
/// Catches URLs that point at web pages or missing routes so the retry loop
/// does not spend its attempts on them.
pub async fn preflight_endpoint(client: &reqwest::Client, url: &str) -> Result<(), McpError> {
    let request = client
        .get(url)
        .header("Accept", "text/event-stream")
        .timeout(PREFLIGHT_TIMEOUT);
    let mut response = request.send().await.map_err(McpError::from_http)?;
    let status = response.status();
    debug!(url = %url, status = %status, "MCP endpoint pre-flight answered");
    classify_preflight_status(status)?;
    if !status.is_success() {
        return Ok(());
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    if is_event_stream_content_type(&content_type) {
        return Ok(());
    }

    let first_chunk = tokio::time::timeout(PREFLIGHT_TIMEOUT, response.chunk())
        .await
        .ok()
        .and_then(Result::ok)
        .flatten()
        .unwrap_or_default();
    classify_preflight_body(&content_type, &first_chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::ErrorKind;

    #[test]
    fn protocol_header_ignored_when_blank() {
        let client = reqwest::Client::new();
        let req = apply_protocol_version_header(client.post("https://example.com"), Some("  "))
            .build()
            .unwrap();
        assert!(req.headers().get(MCP_PROTOCOL_VERSION_HEADER).is_none());
    }

    #[test]
    fn session_header_is_attached_when_known() {
        let client = reqwest::Client::new();
        let req = apply_session_header(client.post("https://example.com"), Some("abc"))
            .build()
            .unwrap();
        assert_eq!(
            req.headers()
                .get(MCP_SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("abc")
        );
    }

    #[test]
    fn preflight_status_classification() {
        assert!(classify_preflight_status(StatusCode::OK).is_ok());
        assert!(classify_preflight_status(StatusCode::METHOD_NOT_ALLOWED).is_ok());
        assert_eq!(
            classify_preflight_status(StatusCode::NOT_FOUND).unwrap_err().kind(),
            ErrorKind::Config
        );
        assert_eq!(
            classify_preflight_status(StatusCode::UNAUTHORIZED)
                .unwrap_err()
                .kind(),
            ErrorKind::Protocol
        );
        assert!(classify_preflight_status(StatusCode::BAD_GATEWAY)
            .unwrap_err()
            .is_retryable());
    }

    #[test]
    fn html_answers_abort() {
        assert!(classify_preflight_body("text/html; charset=utf-8", b"").is_err());
        assert!(classify_preflight_body("text/plain", b"  <!doctype html>").is_err());
        assert!(classify_preflight_body("application/json", b"{\"ok\":true}").is_ok());
    }
}
