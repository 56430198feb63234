use super::factory::ClientFactory;
use super::*;
use crate::mcp::test_utils::{fast_options, scripted_client, ScriptedConnector, ScriptedServer};
use serde_json::json;
use std::sync::atomic::Ordering;

fn files_descriptor() -> ServerDescriptor {
    ServerDescriptor::stdio("files", "mcp-files").with_allowed_tools(["read"])
}

#[test]
fn factory_refuses_invalid_descriptors() {
    let factory = ClientFactory::empty(ClientOptions::default());
    let mut no_command = ServerDescriptor::stdio("files", "");
    no_command.command = None;
    assert!(!no_command.is_valid());
    assert!(matches!(
        factory.create(&no_command, None),
        Err(McpError::Config(_))
    ));

    let mut no_url = ServerDescriptor::sse("remote", "");
    no_url.url = None;
    assert!(!no_url.is_valid());
    assert!(factory.create(&no_url, None).is_err());
}

#[test]
fn factory_dispatches_on_transport_tag() {
    let server = ScriptedServer::new("files");
    let mut factory = ClientFactory::empty(ClientOptions::default());
    assert!(factory.create(&files_descriptor(), None).is_err());

    factory.register("stdio", ScriptedConnector::new(server));
    assert!(factory.supports("stdio"));
    assert!(!factory.supports("sse"));
    let client = factory.create(&files_descriptor(), None).expect("client");
    assert_eq!(client.name(), "files");

    let other = ServerDescriptor::new("odd", TransportType::Other("carrier-pigeon".into()));
    assert!(factory.create(&other, None).is_err());
}

#[tokio::test]
async fn repeated_connect_timeouts_count_each_attempt() {
    let server = ScriptedServer::new("slow");
    server.hang_initialize.store(true, Ordering::SeqCst);
    let client = RemoteClient::new(
        ServerDescriptor::stdio("slow", "mcp-slow"),
        ScriptedConnector::new(server.clone()),
        fast_options(3),
        None,
    );

    assert!(!client.connect().await);
    assert_eq!(client.status().reconnect_attempts(), 3);
    assert_eq!(client.status().state(), ConnectionState::Error);
    assert!(client
        .status()
        .last_error()
        .is_some_and(|err| err.contains("timed out")));
    assert_eq!(server.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_retryable_open_failure_aborts_immediately() {
    let server = ScriptedServer::new("broken");
    *server.open_failure.lock().expect("failure") =
        Some(McpError::Protocol("unexpected content type".into()));
    let client = scripted_client(ServerDescriptor::stdio("broken", "mcp-broken"), &server);

    assert!(!client.connect().await);
    assert_eq!(server.opens.load(Ordering::SeqCst), 1);
    assert_eq!(client.status().reconnect_attempts(), 1);
    assert!(client.status().has_error());
}

#[tokio::test]
async fn unreachable_endpoint_fails_before_any_attempt() {
    let server = ScriptedServer::with_tools("remote", &["search"]);
    *server.preflight_failure.lock().expect("failure") =
        Some(McpError::Protocol("endpoint answered with text/html".into()));
    let client = scripted_client(ServerDescriptor::stdio("remote", "mcp-remote"), &server);

    assert!(!client.connect().await);
    assert_eq!(server.preflights.load(Ordering::SeqCst), 1);
    assert_eq!(server.opens.load(Ordering::SeqCst), 0);
    assert_eq!(client.status().state(), ConnectionState::Error);
    assert_eq!(client.status().reconnect_attempts(), 0);
    assert!(client
        .status()
        .last_error()
        .is_some_and(|err| err.contains("text/html")));
}

#[tokio::test]
async fn transient_preflight_failure_still_connects() {
    let server = ScriptedServer::with_tools("remote", &["search"]);
    *server.preflight_failure.lock().expect("failure") =
        Some(McpError::Network("connection reset".into()));
    let client = scripted_client(ServerDescriptor::stdio("remote", "mcp-remote"), &server);

    assert!(client.connect().await);
    assert_eq!(server.preflights.load(Ordering::SeqCst), 1);
    assert_eq!(server.opens.load(Ordering::SeqCst), 1);
    assert_eq!(client.status().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn successful_connect_resets_attempts() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    *server.open_failure.lock().expect("failure") =
        Some(McpError::Network("connection refused".into()));
    let client = RemoteClient::new(
        files_descriptor(),
        ScriptedConnector::new(server.clone()),
        fast_options(1),
        None,
    );
    assert!(!client.connect().await);
    assert_eq!(client.status().reconnect_attempts(), 1);

    *server.open_failure.lock().expect("failure") = None;
    assert!(client.connect().await);
    assert_eq!(client.status().state(), ConnectionState::Connected);
    assert_eq!(client.status().reconnect_attempts(), 0);
    assert!(client.status().last_error().is_none());
    assert!(client.server_info().is_some());

    let methods = server.methods();
    assert_eq!(methods[0], "initialize");
    assert!(methods.contains(&"notifications/initialized".to_string()));
    assert!(methods.contains(&"logging/setLevel".to_string()));
}

#[tokio::test]
async fn operations_require_a_connection() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    let client = scripted_client(files_descriptor(), &server);

    assert!(matches!(
        client.list_tools().await,
        Err(McpError::NotConnected { .. })
    ));
    assert!(matches!(
        client.call_tool("read", Map::new()).await,
        Err(McpError::NotConnected { .. })
    ));
    assert!(client.ping().await.is_err());
    assert!(server.methods().is_empty());
}

#[tokio::test]
async fn allow_list_blocks_calls_before_the_wire() {
    let server = ScriptedServer::with_tools("files", &["read", "write"]);
    let client = scripted_client(files_descriptor(), &server);
    assert!(client.connect().await);

    let advertised: Vec<String> = client
        .list_tools()
        .await
        .expect("tools")
        .into_iter()
        .map(|tool| tool.name)
        .collect();
    assert_eq!(advertised, vec!["read", "write"]);
    let permitted: Vec<&String> = advertised
        .iter()
        .filter(|name| client.descriptor().is_tool_allowed(name))
        .collect();
    assert_eq!(permitted, vec!["read"]);

    let mut args = Map::new();
    args.insert("path".into(), json!("/tmp/a"));
    let denied = client.call_tool("write", args.clone()).await;
    assert!(matches!(denied, Err(McpError::NotAllowed { .. })));
    assert_eq!(server.received("tools/call"), 0);

    let outcome = client.call_tool("read", args).await.expect("read");
    assert_eq!(outcome.text(), "read ok");
    assert_eq!(server.received("tools/call"), 1);
    assert_eq!(client.status().tool_count(), 2);
}

#[tokio::test]
async fn unsupported_lists_are_empty() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    *server.prompts.lock().expect("prompts") =
        Some(vec![json!({"name": "summarize", "arguments": [{"name": "topic", "required": true}]})]);
    let client = scripted_client(files_descriptor(), &server);
    assert!(client.connect().await);

    assert!(client.list_resources().await.expect("resources").is_empty());
    let prompts = client.list_prompts().await.expect("prompts");
    assert_eq!(prompts[0].name, "summarize");
    assert_eq!(prompts[0].arguments[0].required, Some(true));

    let prompt = client
        .get_prompt("summarize", HashMap::from([("topic".into(), "rust".into())]))
        .await
        .expect("prompt");
    assert_eq!(prompt.messages[0].text, "run summarize");
}

#[tokio::test]
async fn resource_allow_list_is_enforced() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    let mut descriptor = files_descriptor();
    descriptor.allowed_resources.insert("file:///notes.txt".into());
    let client = scripted_client(descriptor, &server);
    assert!(client.connect().await);

    let contents = client.read_resource("file:///notes.txt").await.expect("read");
    assert_eq!(contents[0].text.as_deref(), Some("contents of file:///notes.txt"));
    assert!(matches!(
        client.read_resource("file:///etc/passwd").await,
        Err(McpError::NotAllowed { .. })
    ));
    assert_eq!(server.received("resources/read"), 1);
}

#[tokio::test]
async fn tool_call_timeout_is_reported() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    server.hang_calls.store(true, Ordering::SeqCst);
    let client = scripted_client(files_descriptor(), &server);
    assert!(client.connect().await);

    let result = client.call_tool("read", Map::new()).await;
    assert!(matches!(result, Err(McpError::Timeout { .. })));
    assert!(client.is_connected());
    assert_eq!(client.status().snapshot().failed_requests, 1);
}

#[tokio::test]
async fn failed_health_check_marks_disconnected() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    let client = scripted_client(files_descriptor(), &server);
    assert!(client.connect().await);
    assert!(client.is_healthy().await);

    server.failing.store(true, Ordering::SeqCst);
    assert!(!client.is_healthy().await);
    assert_eq!(client.status().state(), ConnectionState::Disconnected);
    assert!(!client.status().health_check_passed());

    server.failing.store(false, Ordering::SeqCst);
    assert!(client.reconnect().await);
    assert!(client.is_connected());
}

#[tokio::test]
async fn lost_session_is_reported_once() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    let (events, mut received) = tokio::sync::mpsc::unbounded_channel();
    let client = RemoteClient::new(
        files_descriptor(),
        ScriptedConnector::new(server.clone()),
        fast_options(1),
        Some(events),
    );
    assert!(client.connect().await);

    server.failing.store(true, Ordering::SeqCst);
    assert!(!client.is_healthy().await);
    assert!(!client.is_healthy().await);
    assert_eq!(
        received.try_recv().expect("closed event"),
        TransportEvent::Closed {
            server: "files".to_string()
        }
    );
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_is_terminal() {
    let server = ScriptedServer::with_tools("files", &["read"]);
    let client = scripted_client(files_descriptor(), &server);
    assert!(client.connect().await);

    client.shutdown().await;
    assert_eq!(client.status().state(), ConnectionState::Shutdown);
    assert!(!client.connect().await);
    assert!(client.list_tools().await.is_err());
}
