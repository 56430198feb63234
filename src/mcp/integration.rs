//! Composition root: clients, permissions and the function catalog wired
//! together for one host.

use rust_mcp_schema::LoggingLevel;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::data::Settings;
use crate::core::config::servers::{ServerDescriptor, ServerDictionary};
use crate::mcp::adapter::{CallContext, CatalogFunction, FailureKind, FunctionResult};
use crate::mcp::client::factory::ClientFactory;
use crate::mcp::client::protocol::{PromptResult, ResourceContents};
use crate::mcp::client::status::StatusSnapshot;
use crate::mcp::error::McpError;
use crate::mcp::events::RegistryEvent;
use crate::mcp::health::{HealthConfig, HealthMonitor, HealthStatistics};
use crate::mcp::manager::ClientManager;
use crate::mcp::permissions::{
    administrative_rules, PermissionEngine, PermissionPolicy, PermissionRule, PermissionStatistics,
    Principal,
};
use crate::mcp::registry::FunctionRegistry;
use crate::mcp::resources::ResourceManager;
use crate::mcp::strategy::ConflictStrategyKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationStatus {
    pub enabled: bool,
    pub running: bool,
    pub clients: usize,
    pub connected_clients: usize,
    pub registered_tools: usize,
    pub tools_per_client: BTreeMap<String, usize>,
    pub strategy: ConflictStrategyKind,
    pub health: HealthStatistics,
}

/// One catalog entry as seen by a given principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub client: String,
    pub description: String,
    pub enabled: bool,
    pub permitted: bool,
}

pub struct IntegrationManager {
    settings: Settings,
    dictionary: ServerDictionary,
    manager: Arc<ClientManager>,
    permissions: Arc<PermissionEngine>,
    registry: FunctionRegistry,
    resources: Arc<ResourceManager>,
    health: Arc<HealthMonitor>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl IntegrationManager {
    pub fn new(settings: Settings, dictionary: ServerDictionary) -> Result<Self, McpError> {
        let factory = ClientFactory::new(&settings)?;
        Ok(Self::with_factory(settings, dictionary, factory))
    }

    pub fn with_factory(
        settings: Settings,
        dictionary: ServerDictionary,
        factory: ClientFactory,
    ) -> Self {
        let permissions = Arc::new(PermissionEngine::with_cache_ttl(
            settings.default_permission_policy,
            settings.permission_cache_ttl(),
        ));
        permissions.set_strict_mode(settings.strict_permissions);
        let registry = FunctionRegistry::new(settings.conflict_strategy, Some(permissions.clone()));
        let manager = Arc::new(ClientManager::new(factory, &settings));
        let resources = Arc::new(ResourceManager::new(manager.clone()));
        let health = Arc::new(HealthMonitor::new(
            manager.clone(),
            HealthConfig::from_settings(&settings),
        ));
        Self {
            settings,
            dictionary,
            manager,
            permissions,
            registry,
            resources,
            health,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dictionary(&self) -> &ServerDictionary {
        &self.dictionary
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn permissions(&self) -> &Arc<PermissionEngine> {
        &self.permissions
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub async fn is_running(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Running
    }

    /// Connects every enabled server and registers its tools. Calling it
    /// again while running does nothing; a stopped integration stays
    /// stopped.
    pub async fn start(&self) -> Result<(), McpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => {
                return Err(McpError::Shutdown {
                    client: "integration".to_string(),
                })
            }
            Lifecycle::Idle => {}
        }
        if !self.settings.enabled {
            info!("MCP integration disabled in settings");
            return Ok(());
        }

        let started = Instant::now();
        self.seed_permissions();
        self.manager.load(&self.dictionary);
        for client in self.manager.clients() {
            self.registry.attach_client(client);
        }
        self.registry.add_listener(Arc::new(self.auto_approver()));
        self.manager.add_listener(Arc::new(self.registry.clone()));
        self.manager.add_listener(self.resources.clone());
        self.registry.set_auto_registration(true);
        self.manager.spawn_event_loop();

        let connected = self.manager.connect_all().await;
        self.registry.flush().await;
        self.health.start();
        *lifecycle = Lifecycle::Running;

        info!(
            servers = self.manager.client_names().len(),
            connected,
            tools = self.registry.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "MCP integration started"
        );
        Ok(())
    }

    fn seed_permissions(&self) {
        let existing: BTreeSet<String> = self.permissions.rule_names().into_iter().collect();
        for rule in administrative_rules() {
            if !existing.contains(rule.name()) {
                self.permissions.add_rule(Arc::new(rule));
            }
        }
        for descriptor in self.dictionary.enabled() {
            if descriptor.inherits_client_policy() {
                continue;
            }
            match PermissionPolicy::from_tag(&descriptor.tool_permission_policy) {
                Some(policy) => self.permissions.set_client_policy(&descriptor.name, policy),
                None => warn!(
                    server = %descriptor.name,
                    policy = %descriptor.tool_permission_policy,
                    "Unknown tool permission policy; inheriting the default"
                ),
            }
        }
    }

    /// Registry listener granting an allow-all tool policy to every newly
    /// registered tool the descriptor lists under `autoApprove`.
    fn auto_approver(&self) -> impl Fn(&RegistryEvent) + Send + Sync + 'static {
        let approvals: HashMap<String, BTreeSet<String>> = self
            .dictionary
            .enabled()
            .filter(|descriptor| !descriptor.auto_approve.is_empty())
            .map(|descriptor| (descriptor.name.clone(), descriptor.auto_approve.clone()))
            .collect();
        let permissions = self.permissions.clone();
        move |event: &RegistryEvent| match event {
            RegistryEvent::Registered { name, client, tool }
                if approvals
                    .get(client)
                    .is_some_and(|tools| tools.contains(tool)) =>
            {
                debug!(tool = %name, "Auto-approving MCP tool");
                permissions.set_tool_policy(name, PermissionPolicy::AllowAll);
            }
            RegistryEvent::Unregistered { name, .. } => {
                permissions.remove_tool_policy(name);
            }
            _ => {}
        }
    }

    /// Unregisters every tool and shuts every client down. Safe to call more
    /// than once.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Running {
            if *lifecycle == Lifecycle::Idle {
                *lifecycle = Lifecycle::Stopped;
            }
            return;
        }
        self.registry.set_auto_registration(false);
        self.manager.clear_listeners();
        self.health.stop();
        let removed = self.registry.unregister_all();
        self.permissions.clear_cache();
        self.resources.clear_cache();
        self.manager.shutdown().await;
        *lifecycle = Lifecycle::Stopped;
        info!(removed, "MCP integration stopped");
    }

    pub async fn refresh_all_tools(&self) -> usize {
        let mut refreshed = 0;
        for client in self.manager.clients() {
            if client.is_connected() && self.manager.refresh_client_tools(client.name()).await.is_ok()
            {
                refreshed += 1;
            }
        }
        self.registry.flush().await;
        refreshed
    }

    /// Re-lists one client's tools and returns how many of them are in the
    /// catalog afterwards.
    pub async fn register_client_tools(&self, client: &str) -> Result<usize, McpError> {
        self.manager.refresh_client_tools(client).await?;
        self.registry.flush().await;
        Ok(self.registry.client_function_names(client).len())
    }

    pub async fn reconnect_client(&self, client: &str) -> Result<bool, McpError> {
        let reconnected = self.manager.reconnect_client(client).await?;
        self.registry.flush().await;
        Ok(reconnected)
    }

    pub async fn execute(
        &self,
        function: &str,
        principal: &dyn Principal,
        context: &CallContext,
        arguments: Value,
    ) -> FunctionResult {
        match self.registry.get(function) {
            Some(adapter) => adapter.execute(principal, context, arguments).await,
            None => FunctionResult::failure(
                FailureKind::UnknownFunction,
                format!("No MCP function named {function}"),
            ),
        }
    }

    pub fn catalog(&self, principal: &dyn Principal) -> Vec<CatalogEntry> {
        self.registry
            .adapters()
            .iter()
            .map(|adapter| CatalogEntry {
                name: adapter.name().to_string(),
                client: adapter.client_name().to_string(),
                description: adapter.description().to_string(),
                enabled: adapter.is_enabled(),
                permitted: adapter.has_permission(principal),
            })
            .collect()
    }

    /// Served from the resource cache when a fresh copy exists.
    pub async fn read_resource(
        &self,
        client: &str,
        uri: &str,
    ) -> Result<Vec<ResourceContents>, McpError> {
        self.resources.get_resource_content(client, uri, true).await
    }

    pub async fn get_prompt(
        &self,
        client: &str,
        prompt: &str,
        arguments: HashMap<String, String>,
    ) -> Result<PromptResult, McpError> {
        self.manager.get_prompt(client, prompt, arguments).await
    }

    pub async fn status(&self) -> IntegrationStatus {
        let registry = self.registry.statistics();
        IntegrationStatus {
            enabled: self.settings.enabled,
            running: self.is_running().await,
            clients: self.manager.client_names().len(),
            connected_clients: self.manager.connected_count(),
            registered_tools: registry.total_functions,
            tools_per_client: registry.functions_per_client,
            strategy: self.registry.strategy(),
            health: self.health.statistics(),
        }
    }

    pub fn permission_statistics(&self) -> PermissionStatistics {
        self.permissions.statistics()
    }

    pub fn client_reports(&self) -> Vec<StatusSnapshot> {
        self.manager.statuses()
    }
}

/// Outcome of a one-shot connection attempt against a single descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionTestReport {
    pub server: String,
    pub transport: String,
    pub connected: bool,
    pub protocol_version: Option<String>,
    pub server_name: Option<String>,
    pub tools: Vec<String>,
    pub resources: Option<usize>,
    pub logging_level_accepted: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ConnectionTestReport {
    pub fn is_success(&self) -> bool {
        self.connected && self.error.is_none()
    }
}

/// Connects, lists tools and resources, sets the logging level and closes.
pub async fn test_connection(
    factory: &ClientFactory,
    descriptor: &ServerDescriptor,
) -> ConnectionTestReport {
    let started = Instant::now();
    let mut report = ConnectionTestReport {
        server: descriptor.name.clone(),
        transport: descriptor.transport.tag().to_string(),
        ..ConnectionTestReport::default()
    };

    let client = match factory.create(descriptor, None) {
        Ok(client) => client,
        Err(err) => {
            report.error = Some(err.to_string());
            return report;
        }
    };

    report.connected = client.connect().await;
    if !report.connected {
        report.error = client
            .status()
            .last_error()
            .or_else(|| Some("connection failed".to_string()));
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        client.shutdown().await;
        return report;
    }

    if let Some(info) = client.server_info() {
        report.protocol_version = info
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        report.server_name = info
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    match client.list_tools().await {
        Ok(tools) => report.tools = tools.into_iter().map(|tool| tool.name).collect(),
        Err(err) => report.error = Some(format!("tools/list failed: {err}")),
    }
    report.resources = client.list_resources().await.ok().map(|resources| resources.len());
    report.logging_level_accepted = client.set_logging_level(LoggingLevel::Info).await.is_ok();

    client.shutdown().await;
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report
}
