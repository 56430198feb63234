use std::collections::HashMap;
use std::sync::Arc;

use super::{ClientOptions, RemoteClient};
use crate::core::config::data::Settings;
use crate::core::config::servers::ServerDescriptor;
use crate::mcp::error::McpError;
use crate::mcp::transport::stdio::StdioConnector;
use crate::mcp::transport::streamable_http::StreamableHttpConnector;
use crate::mcp::transport::{EventSender, TransportConnector};

/// Builds [`RemoteClient`]s from descriptors through a table of connectors
/// keyed by transport tag (`stdio`, `sse`).
pub struct ClientFactory {
    connectors: HashMap<String, Arc<dyn TransportConnector>>,
    options: ClientOptions,
}

impl ClientFactory {
    pub fn new(settings: &Settings) -> Result<Self, McpError> {
        let mut factory = Self::empty(ClientOptions::from_settings(settings));
        factory.register("stdio", Arc::new(StdioConnector));
        factory.register("sse", Arc::new(StreamableHttpConnector::new()?));
        Ok(factory)
    }

    /// A factory with no connectors registered.
    pub fn empty(options: ClientOptions) -> Self {
        Self {
            connectors: HashMap::new(),
            options,
        }
    }

    pub fn register(&mut self, tag: impl Into<String>, connector: Arc<dyn TransportConnector>) {
        self.connectors.insert(tag.into(), connector);
    }

    pub fn supports(&self, tag: &str) -> bool {
        self.connectors.contains_key(tag)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn create(
        &self,
        descriptor: &ServerDescriptor,
        events: Option<EventSender>,
    ) -> Result<RemoteClient, McpError> {
        if let Some(problem) = descriptor.validation_problem() {
            return Err(McpError::Config(format!(
                "Cannot create MCP client '{}': {problem}",
                descriptor.name
            )));
        }
        let tag = descriptor.transport.tag();
        let connector = self.connectors.get(tag).cloned().ok_or_else(|| {
            McpError::Config(format!(
                "Unsupported MCP transport '{tag}' for server '{}'",
                descriptor.name
            ))
        })?;
        Ok(RemoteClient::new(
            descriptor.clone(),
            connector,
            self.options,
            events,
        ))
    }
}
