//! Owns every [`RemoteClient`] and keeps tool-change listeners informed.

use futures_util::{stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::data::Settings;
use crate::core::config::servers::{ServerDescriptor, ServerDictionary};
use crate::mcp::client::factory::ClientFactory;
use crate::mcp::client::protocol::{PromptResult, ResourceContents, ToolCallOutcome};
use crate::mcp::client::status::StatusSnapshot;
use crate::mcp::client::RemoteClient;
use crate::mcp::error::McpError;
use crate::mcp::events::ToolChangeListener;
use crate::mcp::tool::{RemotePrompt, RemoteResource, RemoteTool};
use crate::mcp::transport::{EventSender, TransportEvent};

const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;

/// Difference between two tool lists of one client, by tool name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolDiff {
    pub added: Vec<RemoteTool>,
    pub removed: Vec<RemoteTool>,
    /// Same name, different definition.
    pub updated: Vec<RemoteTool>,
}

impl ToolDiff {
    pub fn between(old: &[RemoteTool], new: &[RemoteTool]) -> Self {
        let old_by_name: HashMap<&str, &RemoteTool> =
            old.iter().map(|tool| (tool.name.as_str(), tool)).collect();
        let new_by_name: HashMap<&str, &RemoteTool> =
            new.iter().map(|tool| (tool.name.as_str(), tool)).collect();

        let mut diff = ToolDiff::default();
        for tool in new {
            match old_by_name.get(tool.name.as_str()) {
                None => diff.added.push(tool.clone()),
                Some(previous) if !previous.same_definition(tool) => {
                    diff.updated.push(tool.clone())
                }
                Some(_) => {}
            }
        }
        diff.removed = old
            .iter()
            .filter(|tool| !new_by_name.contains_key(tool.name.as_str()))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

pub struct ClientManager {
    factory: ClientFactory,
    clients: RwLock<BTreeMap<String, Arc<RemoteClient>>>,
    rejected: Mutex<Vec<(String, String)>>,
    known_tools: Mutex<HashMap<String, Vec<RemoteTool>>>,
    known_resources: Mutex<HashMap<String, Vec<RemoteResource>>>,
    known_prompts: Mutex<HashMap<String, Vec<RemotePrompt>>>,
    listeners: RwLock<Vec<Arc<dyn ToolChangeListener>>>,
    events_tx: EventSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    follow_list_changes: bool,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientManager {
    pub fn new(factory: ClientFactory, settings: &Settings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            clients: RwLock::new(BTreeMap::new()),
            rejected: Mutex::new(Vec::new()),
            known_tools: Mutex::new(HashMap::new()),
            known_resources: Mutex::new(HashMap::new()),
            known_prompts: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            follow_list_changes: settings.tool_change_notifications,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a client for every enabled descriptor. Descriptors the factory
    /// refuses are remembered in [`Self::rejected`].
    pub fn load(&self, dictionary: &ServerDictionary) -> usize {
        let mut created = 0;
        for descriptor in dictionary.enabled() {
            match self.add_client(descriptor) {
                Ok(_) => created += 1,
                Err(err) => {
                    warn!(server = %descriptor.name, error = %err, "Skipping MCP server");
                    lock(&self.rejected).push((descriptor.name.clone(), err.to_string()));
                }
            }
        }
        created
    }

    pub fn add_client(&self, descriptor: &ServerDescriptor) -> Result<Arc<RemoteClient>, McpError> {
        let client = Arc::new(self.factory.create(descriptor, Some(self.event_sender()))?);
        self.insert(client.clone())?;
        Ok(client)
    }

    /// Adds an already built client. Its transport events should go to
    /// [`Self::event_sender`].
    pub fn insert(&self, client: Arc<RemoteClient>) -> Result<(), McpError> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.contains_key(client.name()) {
            return Err(McpError::Config(format!(
                "MCP server '{}' is defined twice",
                client.name()
            )));
        }
        clients.insert(client.name().to_string(), client);
        Ok(())
    }

    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub fn factory(&self) -> &ClientFactory {
        &self.factory
    }

    pub fn rejected(&self) -> Vec<(String, String)> {
        lock(&self.rejected).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ToolChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn clear_listeners(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn listeners(&self) -> Vec<Arc<dyn ToolChangeListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn client(&self, name: &str) -> Option<Arc<RemoteClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn clients(&self) -> Vec<Arc<RemoteClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.clients()
            .iter()
            .filter(|client| client.is_connected())
            .count()
    }

    pub fn statuses(&self) -> Vec<StatusSnapshot> {
        self.clients()
            .iter()
            .map(|client| client.status().snapshot())
            .collect()
    }

    fn require(&self, name: &str) -> Result<Arc<RemoteClient>, McpError> {
        self.client(name)
            .ok_or_else(|| McpError::Config(format!("Unknown MCP server '{name}'")))
    }

    /// Connects every client, at most three at a time, and discovers the
    /// tools of those that came up. Returns how many are connected.
    pub async fn connect_all(&self) -> usize {
        let clients = self.clients();
        let connected: Vec<Arc<RemoteClient>> = stream::iter(clients)
            .map(|client| async move {
                let connected = client.connect().await;
                connected.then_some(client)
            })
            .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        for client in &connected {
            self.notify_connection(client.name(), true);
            let _ = self.refresh_client_tools(client.name()).await;
        }
        info!(
            connected = connected.len(),
            total = self.clients().len(),
            "MCP servers connected"
        );
        connected.len()
    }

    pub async fn connect_client(&self, name: &str) -> Result<bool, McpError> {
        let client = self.require(name)?;
        if !client.connect().await {
            return Ok(false);
        }
        self.notify_connection(name, true);
        let _ = self.refresh_client_tools(name).await;
        Ok(true)
    }

    pub async fn disconnect_client(&self, name: &str) -> Result<(), McpError> {
        let client = self.require(name)?;
        client.disconnect().await;
        self.forget(name);
        self.notify_connection(name, false);
        Ok(())
    }

    pub async fn reconnect_client(&self, name: &str) -> Result<bool, McpError> {
        let client = self.require(name)?;
        self.forget(name);
        self.notify_connection(name, false);
        if !client.reconnect().await {
            return Ok(false);
        }
        self.notify_connection(name, true);
        let _ = self.refresh_client_tools(name).await;
        Ok(true)
    }

    fn forget(&self, name: &str) {
        lock(&self.known_tools).remove(name);
        lock(&self.known_resources).remove(name);
        lock(&self.known_prompts).remove(name);
    }

    /// Called when a client is found dead outside of an explicit disconnect.
    pub fn client_lost(&self, name: &str) {
        self.forget(name);
        self.notify_connection(name, false);
    }

    fn notify_connection(&self, name: &str, connected: bool) {
        for listener in self.listeners() {
            listener.on_client_connection_changed(name, connected);
        }
    }

    pub async fn refresh_client_tools(&self, name: &str) -> Result<Vec<RemoteTool>, McpError> {
        let client = self.require(name)?;
        match client.list_tools().await {
            Ok(tools) => {
                self.handle_tools_update(name, tools.clone());
                for listener in self.listeners() {
                    listener.on_tools_refresh_completed(name, true, None);
                }
                Ok(tools)
            }
            Err(err) => {
                warn!(server = %name, error = %err, "MCP tool refresh failed");
                let message = err.to_string();
                for listener in self.listeners() {
                    listener.on_tools_refresh_completed(name, false, Some(&message));
                }
                Err(err)
            }
        }
    }

    /// Records `tools` as the client's list and tells listeners what changed:
    /// a full list the first time, a diff afterwards.
    pub fn handle_tools_update(&self, name: &str, tools: Vec<RemoteTool>) {
        let previous = lock(&self.known_tools).insert(name.to_string(), tools.clone());
        let listeners = self.listeners();
        let Some(previous) = previous else {
            debug!(server = %name, tools = tools.len(), "Discovered MCP tools");
            for listener in &listeners {
                listener.on_tools_changed(name, &[], &tools);
            }
            return;
        };

        let diff = ToolDiff::between(&previous, &tools);
        if diff.is_empty() {
            return;
        }
        debug!(
            server = %name,
            added = diff.added.len(),
            removed = diff.removed.len(),
            updated = diff.updated.len(),
            "MCP tool list changed"
        );
        for listener in &listeners {
            if !diff.added.is_empty() {
                listener.on_tools_added(name, &diff.added);
            }
            if !diff.removed.is_empty() {
                listener.on_tools_removed(name, &diff.removed);
            }
            if !diff.updated.is_empty() {
                listener.on_tools_updated(name, &diff.updated);
            }
        }
    }

    pub async fn refresh_client_resources(
        &self,
        name: &str,
    ) -> Result<Vec<RemoteResource>, McpError> {
        let resources = self.require(name)?.list_resources().await?;
        lock(&self.known_resources).insert(name.to_string(), resources.clone());
        Ok(resources)
    }

    pub async fn refresh_client_prompts(&self, name: &str) -> Result<Vec<RemotePrompt>, McpError> {
        let prompts = self.require(name)?.list_prompts().await?;
        lock(&self.known_prompts).insert(name.to_string(), prompts.clone());
        Ok(prompts)
    }

    pub fn tools_for(&self, name: &str) -> Vec<RemoteTool> {
        lock(&self.known_tools).get(name).cloned().unwrap_or_default()
    }

    pub fn all_tools(&self) -> Vec<RemoteTool> {
        let known = lock(&self.known_tools);
        let mut names: Vec<&String> = known.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| known[name].iter().cloned())
            .collect()
    }

    pub fn resources_for(&self, name: &str) -> Vec<RemoteResource> {
        lock(&self.known_resources)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn prompts_for(&self, name: &str) -> Vec<RemotePrompt> {
        lock(&self.known_prompts)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn call_tool(
        &self,
        client: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallOutcome, McpError> {
        self.require(client)?.call_tool(tool, arguments).await
    }

    pub async fn read_resource(
        &self,
        client: &str,
        uri: &str,
    ) -> Result<Vec<ResourceContents>, McpError> {
        self.require(client)?.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        client: &str,
        prompt: &str,
        arguments: HashMap<String, String>,
    ) -> Result<PromptResult, McpError> {
        self.require(client)?.get_prompt(prompt, arguments).await
    }

    /// Starts following server notifications. Only the first call spawns the
    /// loop; it ends on [`Self::shutdown`].
    pub fn spawn_event_loop(self: &Arc<Self>) {
        let Some(mut events) = lock(&self.events_rx).take() else {
            return;
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                manager.handle_event(event).await;
            }
            debug!("MCP event loop stopped");
        });
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        let server = event.server().to_string();
        let Some(client) = self.client(&server) else {
            return;
        };
        match event {
            TransportEvent::ToolsListChanged { .. } => {
                if self.follow_list_changes && client.is_connected() {
                    debug!(server = %server, "MCP tools changed; refreshing");
                    let _ = self.refresh_client_tools(&server).await;
                }
            }
            TransportEvent::ResourcesListChanged { .. } => {
                if client.is_connected() {
                    let _ = self.refresh_client_resources(&server).await;
                }
            }
            TransportEvent::PromptsListChanged { .. } => {
                if client.is_connected() {
                    let _ = self.refresh_client_prompts(&server).await;
                }
            }
            TransportEvent::Closed { .. } => {
                // The client may already have marked itself disconnected.
                if client.is_connected() {
                    warn!(server = %server, "MCP server closed its channel");
                    client.disconnect().await;
                }
                self.client_lost(&server);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let clients = self.clients();
        futures_util::future::join_all(clients.iter().map(|client| client.shutdown())).await;
        for client in &clients {
            self.forget(client.name());
            self.notify_connection(client.name(), false);
        }
        info!(clients = clients.len(), "MCP client manager shut down");
    }
}
