//! The live function catalog: resolved name to [`ToolAdapter`].
//!
//! Keys are produced by the active [`ConflictStrategy`]. A key that is
//! already taken is never overwritten; the registration fails and a
//! [`RegistryEvent::Conflict`] is published instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::mcp::adapter::{CatalogFunction, ToolAdapter};
use crate::mcp::client::RemoteClient;
use crate::mcp::events::{RegistryEvent, RegistryListener, ToolChangeListener};
use crate::mcp::permissions::PermissionEngine;
use crate::mcp::strategy::{ConflictStrategy, ConflictStrategyKind};
use crate::mcp::tool::RemoteTool;

/// Tool-list changes waiting to be applied, in arrival order.
enum ToolChange {
    Reset { client: String, tools: Vec<RemoteTool> },
    Added { client: String, tools: Vec<RemoteTool> },
    Removed { client: String, tools: Vec<RemoteTool> },
    Updated { client: String, tools: Vec<RemoteTool> },
    Disconnected { client: String },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStatistics {
    pub strategy: Option<ConflictStrategyKind>,
    pub total_functions: usize,
    pub clients: usize,
    pub functions_per_client: BTreeMap<String, usize>,
    pub auto_registration: bool,
}

struct Inner {
    strategy: RwLock<Box<dyn ConflictStrategy>>,
    adapters: RwLock<HashMap<String, Arc<ToolAdapter>>>,
    by_client: RwLock<HashMap<String, BTreeSet<String>>>,
    clients: RwLock<HashMap<String, Arc<RemoteClient>>>,
    permissions: Option<Arc<PermissionEngine>>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
    auto_registration: AtomicBool,
    queue: Mutex<Option<mpsc::UnboundedSender<ToolChange>>>,
}

/// Cheap to clone; clones share the same catalog.
#[derive(Clone)]
pub struct FunctionRegistry {
    inner: Arc<Inner>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl FunctionRegistry {
    pub fn new(strategy: ConflictStrategyKind, permissions: Option<Arc<PermissionEngine>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                strategy: RwLock::new(strategy.build()),
                adapters: RwLock::new(HashMap::new()),
                by_client: RwLock::new(HashMap::new()),
                clients: RwLock::new(HashMap::new()),
                permissions,
                listeners: RwLock::new(Vec::new()),
                auto_registration: AtomicBool::new(false),
                queue: Mutex::new(None),
            }),
        }
    }

    pub fn strategy(&self) -> ConflictStrategyKind {
        read(&self.inner.strategy).kind()
    }

    /// Applies to later registrations only.
    pub fn set_strategy(&self, strategy: ConflictStrategyKind) {
        *write(&self.inner.strategy) = strategy.build();
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        write(&self.inner.listeners).push(listener);
    }

    fn publish(&self, event: RegistryEvent) {
        let listeners = read(&self.inner.listeners).clone();
        for listener in listeners {
            listener.on_registry_event(&event);
        }
    }

    /// Makes a client's tools registrable. Tools from unknown clients are
    /// refused.
    pub fn attach_client(&self, client: Arc<RemoteClient>) {
        write(&self.inner.clients).insert(client.name().to_string(), client);
    }

    pub fn detach_client(&self, client: &str) -> usize {
        let removed = self.unregister_client_tools(client);
        write(&self.inner.clients).remove(client);
        removed
    }

    pub fn register(&self, mut tool: RemoteTool) -> bool {
        let Some(client) = read(&self.inner.clients).get(&tool.client_name).cloned() else {
            warn!(client = %tool.client_name, tool = %tool.name, "No MCP client attached for tool");
            return false;
        };
        if !client.descriptor().is_tool_allowed(&tool.name) {
            debug!(client = %tool.client_name, tool = %tool.name, "Skipping MCP tool outside allow-list");
            return false;
        }

        let event = {
            let mut adapters = write(&self.inner.adapters);
            let key = read(&self.inner.strategy).resolve(
                &tool.client_name,
                &tool.name,
                &|candidate| adapters.contains_key(candidate),
            );
            if let Some(existing) = adapters.get(&key) {
                RegistryEvent::Conflict {
                    name: key,
                    client: tool.client_name.clone(),
                    tool: tool.name.clone(),
                    existing_client: existing.client_name().to_string(),
                }
            } else {
                tool.full_name = key.clone();
                let event = RegistryEvent::Registered {
                    name: key.clone(),
                    client: tool.client_name.clone(),
                    tool: tool.name.clone(),
                };
                write(&self.inner.by_client)
                    .entry(tool.client_name.clone())
                    .or_default()
                    .insert(key.clone());
                let adapter = ToolAdapter::new(tool, client, self.inner.permissions.clone());
                adapters.insert(key, Arc::new(adapter));
                event
            }
        };

        let registered = matches!(event, RegistryEvent::Registered { .. });
        match &event {
            RegistryEvent::Conflict {
                name,
                client,
                existing_client,
                ..
            } => warn!(tool = %name, client = %client, existing = %existing_client, "MCP tool name conflict"),
            _ => debug!(tool = %event.name(), "Registered MCP tool"),
        }
        self.publish(event);
        registered
    }

    pub fn unregister(&self, name: &str) -> bool {
        let Some(adapter) = self.take(name) else {
            return false;
        };
        debug!(tool = %name, "Unregistered MCP tool");
        self.publish(RegistryEvent::Unregistered {
            name: name.to_string(),
            client: adapter.client_name().to_string(),
        });
        true
    }

    fn take(&self, name: &str) -> Option<Arc<ToolAdapter>> {
        let adapter = write(&self.inner.adapters).remove(name)?;
        let mut by_client = write(&self.inner.by_client);
        if let Some(keys) = by_client.get_mut(adapter.client_name()) {
            keys.remove(name);
            if keys.is_empty() {
                by_client.remove(adapter.client_name());
            }
        }
        Some(adapter)
    }

    fn restore(&self, adapter: Arc<ToolAdapter>) {
        let key = adapter.name().to_string();
        write(&self.inner.by_client)
            .entry(adapter.client_name().to_string())
            .or_default()
            .insert(key.clone());
        write(&self.inner.adapters).insert(key, adapter);
    }

    /// Catalog key currently holding `tool` from `client`.
    pub fn key_for(&self, client: &str, tool: &str) -> Option<String> {
        let keys = read(&self.inner.by_client).get(client).cloned()?;
        let adapters = read(&self.inner.adapters);
        keys.into_iter()
            .find(|key| adapters.get(key).is_some_and(|adapter| adapter.tool().name == tool))
    }

    /// Replaces the registration of `tool`, keeping the old adapter if the
    /// new one cannot be registered.
    pub fn update(&self, tool: RemoteTool) -> bool {
        let previous = self
            .key_for(&tool.client_name, &tool.name)
            .and_then(|key| self.take(&key));
        let client = tool.client_name.clone();
        if self.register(tool) {
            if let Some(previous) = previous {
                self.publish(RegistryEvent::Updated {
                    name: previous.name().to_string(),
                    client,
                });
            }
            return true;
        }
        if let Some(previous) = previous {
            warn!(tool = %previous.name(), "MCP tool update failed; keeping previous definition");
            self.restore(previous);
        }
        false
    }

    pub fn register_client_tools(&self, client: &str, tools: &[RemoteTool]) -> usize {
        let registered = tools
            .iter()
            .filter(|tool| tool.client_name == client)
            .filter(|tool| self.register((*tool).clone()))
            .count();
        info!(client = %client, registered, offered = tools.len(), "Registered MCP tools");
        registered
    }

    pub fn unregister_client_tools(&self, client: &str) -> usize {
        let keys = write(&self.inner.by_client).remove(client).unwrap_or_default();
        let removed = keys.iter().filter(|key| self.unregister(key)).count();
        if removed > 0 {
            info!(client = %client, removed, "Unregistered MCP tools");
        }
        removed
    }

    pub fn unregister_all(&self) -> usize {
        let clients: Vec<String> = read(&self.inner.by_client).keys().cloned().collect();
        clients
            .iter()
            .map(|client| self.unregister_client_tools(client))
            .sum()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolAdapter>> {
        read(&self.inner.adapters).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.inner.adapters).contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.adapters).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn adapters(&self) -> Vec<Arc<ToolAdapter>> {
        let mut adapters: Vec<Arc<ToolAdapter>> =
            read(&self.inner.adapters).values().cloned().collect();
        adapters.sort_by(|a, b| a.tool().full_name.cmp(&b.tool().full_name));
        adapters
    }

    pub fn client_function_names(&self, client: &str) -> Vec<String> {
        read(&self.inner.by_client)
            .get(client)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_client(&self, client: &str) -> bool {
        read(&self.inner.by_client).contains_key(client)
    }

    pub fn len(&self) -> usize {
        read(&self.inner.adapters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let functions_per_client = read(&self.inner.by_client)
            .iter()
            .map(|(client, keys)| (client.clone(), keys.len()))
            .collect::<BTreeMap<_, _>>();
        RegistryStatistics {
            strategy: Some(self.strategy()),
            total_functions: self.len(),
            clients: functions_per_client.len(),
            functions_per_client,
            auto_registration: self.is_auto_registration_enabled(),
        }
    }

    pub fn is_auto_registration_enabled(&self) -> bool {
        self.inner.auto_registration.load(Ordering::SeqCst)
    }

    /// Turns listener-driven registration on or off. Inside a tokio runtime
    /// changes are applied in order on a background task; elsewhere they are
    /// applied inline.
    pub fn set_auto_registration(&self, enabled: bool) {
        self.inner.auto_registration.store(enabled, Ordering::SeqCst);
        let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if !enabled {
            *queue = None;
            return;
        }
        if queue.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = self.clone();
        runtime.spawn(async move {
            while let Some(change) = rx.recv().await {
                registry.apply(change);
            }
        });
        *queue = Some(tx);
    }

    /// Waits until every queued tool change has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let queued = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|queue| queue.send(ToolChange::Flush(tx)).is_ok());
        if queued {
            let _ = rx.await;
        }
    }

    fn enqueue(&self, change: ToolChange) {
        if !self.is_auto_registration_enabled() {
            return;
        }
        let change = {
            let queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            match queue.as_ref() {
                Some(queue) => match queue.send(change) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(change)) => change,
                },
                None => change,
            }
        };
        self.apply(change);
    }

    fn apply(&self, change: ToolChange) {
        match change {
            ToolChange::Reset { client, tools } => {
                self.unregister_client_tools(&client);
                self.register_client_tools(&client, &tools);
            }
            ToolChange::Added { client, tools } => {
                self.register_client_tools(&client, &tools);
            }
            ToolChange::Removed { client, tools } => {
                for tool in tools {
                    if let Some(key) = self.key_for(&client, &tool.name) {
                        self.unregister(&key);
                    }
                }
            }
            ToolChange::Updated { tools, .. } => {
                for tool in tools {
                    self.update(tool);
                }
            }
            ToolChange::Disconnected { client } => {
                self.unregister_client_tools(&client);
            }
            ToolChange::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl ToolChangeListener for FunctionRegistry {
    fn on_tools_changed(&self, client: &str, _old: &[RemoteTool], new: &[RemoteTool]) {
        self.enqueue(ToolChange::Reset {
            client: client.to_string(),
            tools: new.to_vec(),
        });
    }

    fn on_tools_added(&self, client: &str, added: &[RemoteTool]) {
        self.enqueue(ToolChange::Added {
            client: client.to_string(),
            tools: added.to_vec(),
        });
    }

    fn on_tools_removed(&self, client: &str, removed: &[RemoteTool]) {
        self.enqueue(ToolChange::Removed {
            client: client.to_string(),
            tools: removed.to_vec(),
        });
    }

    fn on_tools_updated(&self, client: &str, updated: &[RemoteTool]) {
        self.enqueue(ToolChange::Updated {
            client: client.to_string(),
            tools: updated.to_vec(),
        });
    }

    fn on_client_connection_changed(&self, client: &str, connected: bool) {
        if !connected {
            self.enqueue(ToolChange::Disconnected {
                client: client.to_string(),
            });
        }
    }

    fn on_tools_refresh_completed(&self, client: &str, success: bool, error: Option<&str>) {
        if !success {
            debug!(client = %client, error = ?error, "MCP tool refresh failed; keeping registrations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::servers::ServerDescriptor;
    use crate::mcp::test_utils::{scripted_client, ScriptedServer};

    fn attach(registry: &FunctionRegistry, name: &str) -> Arc<RemoteClient> {
        let client = Arc::new(scripted_client(
            ServerDescriptor::stdio(name, "mcp-server"),
            &ScriptedServer::new(name),
        ));
        registry.attach_client(client.clone());
        client
    }

    fn recorder(registry: &FunctionRegistry) -> Arc<Mutex<Vec<RegistryEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        registry.add_listener(Arc::new(move |event: &RegistryEvent| {
            sink.lock().expect("events").push(event.clone());
        }));
        events
    }

    #[test]
    fn prefix_strategy_keys_and_conflicts() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        attach(&registry, "acme");
        let events = recorder(&registry);

        assert!(registry.register(RemoteTool::new("acme", "search")));
        assert!(registry.contains("acme_search"));
        assert_eq!(registry.get("acme_search").expect("adapter").tool().name, "search");

        assert!(!registry.register(RemoteTool::new("acme", "search")));
        assert_eq!(registry.len(), 1);
        let events = events.lock().expect("events");
        assert!(matches!(
            events.last(),
            Some(RegistryEvent::Conflict { name, existing_client, .. })
                if name == "acme_search" && existing_client == "acme"
        ));
    }

    #[test]
    fn auto_increment_finds_free_keys() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::AutoIncrement, None);
        attach(&registry, "acme");
        attach(&registry, "globex");

        assert!(registry.register(RemoteTool::new("acme", "search")));
        assert!(registry.register(RemoteTool::new("globex", "search")));
        assert_eq!(registry.names(), vec!["search", "search_1"]);
        assert_eq!(registry.key_for("globex", "search").as_deref(), Some("search_1"));
    }

    #[test]
    fn unknown_client_is_refused() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        assert!(!registry.register(RemoteTool::new("ghost", "search")));
    }

    #[test]
    fn allow_list_limits_registration() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        let client = Arc::new(scripted_client(
            ServerDescriptor::stdio("files", "mcp-files").with_allowed_tools(["read"]),
            &ScriptedServer::new("files"),
        ));
        registry.attach_client(client);
        let tools = [RemoteTool::new("files", "read"), RemoteTool::new("files", "write")];
        assert_eq!(registry.register_client_tools("files", &tools), 1);
        assert_eq!(registry.names(), vec!["files_read"]);
    }

    #[test]
    fn unregistering_a_client_clears_its_index() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        attach(&registry, "acme");
        attach(&registry, "globex");
        let acme = [RemoteTool::new("acme", "search"), RemoteTool::new("acme", "fetch")];
        registry.register_client_tools("acme", &acme);
        registry.register(RemoteTool::new("globex", "search"));

        assert_eq!(registry.unregister_client_tools("acme"), 2);
        assert!(!registry.has_client("acme"));
        assert!(registry.client_function_names("acme").is_empty());
        assert_eq!(registry.names(), vec!["globex_search"]);
        assert_eq!(registry.statistics().clients, 1);
    }

    #[test]
    fn update_replaces_definition() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        attach(&registry, "acme");
        let events = recorder(&registry);
        registry.register(RemoteTool::new("acme", "search").with_description("old"));

        assert!(registry.update(RemoteTool::new("acme", "search").with_description("new")));
        let adapter = registry.get("acme_search").expect("adapter");
        assert_eq!(adapter.tool().description, "new");
        assert!(events
            .lock()
            .expect("events")
            .iter()
            .any(|event| matches!(event, RegistryEvent::Updated { .. })));
    }

    #[test]
    fn failed_update_restores_previous_adapter() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        attach(&registry, "acme");
        registry.register(RemoteTool::new("acme", "search").with_description("kept"));

        write(&registry.inner.clients).remove("acme");
        assert!(!registry.update(RemoteTool::new("acme", "search").with_description("new")));
        assert_eq!(
            registry.get("acme_search").expect("adapter").tool().description,
            "kept"
        );
        assert_eq!(registry.client_function_names("acme"), vec!["acme_search"]);
    }

    #[tokio::test]
    async fn listener_changes_apply_in_order() {
        let registry = FunctionRegistry::new(ConflictStrategyKind::PrefixClientName, None);
        attach(&registry, "acme");
        registry.set_auto_registration(true);

        let search = RemoteTool::new("acme", "search");
        let fetch = RemoteTool::new("acme", "fetch");
        registry.on_tools_changed("acme", &[], &[search.clone()]);
        registry.on_tools_added("acme", &[fetch.clone()]);
        registry.on_tools_removed("acme", &[search]);
        registry.flush().await;
        assert_eq!(registry.names(), vec!["acme_fetch"]);

        registry.on_client_connection_changed("acme", false);
        registry.flush().await;
        assert!(registry.is_empty());

        registry.set_auto_registration(false);
        registry.on_tools_added("acme", &[fetch]);
        registry.flush().await;
        assert!(registry.is_empty());
    }
}
