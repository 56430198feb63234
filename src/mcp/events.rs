//! Notifications flowing from the client manager to the function registry,
//! and from the registry to whoever watches the catalog.

use crate::mcp::tool::RemoteTool;

/// Receives tool-list changes computed by the client manager.
///
/// Callbacks run on the manager's task and must not block; implementations
/// that do real work hand it off to a spawned task.
pub trait ToolChangeListener: Send + Sync {
    /// Full replacement of a client's tool list. `new` is empty when the
    /// client went away.
    fn on_tools_changed(&self, client: &str, old: &[RemoteTool], new: &[RemoteTool]);

    fn on_tools_added(&self, _client: &str, _added: &[RemoteTool]) {}

    fn on_tools_removed(&self, _client: &str, _removed: &[RemoteTool]) {}

    fn on_tools_updated(&self, _client: &str, _updated: &[RemoteTool]) {}

    fn on_client_connection_changed(&self, _client: &str, _connected: bool) {}

    fn on_tools_refresh_completed(&self, _client: &str, _success: bool, _error: Option<&str>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        name: String,
        client: String,
        tool: String,
    },
    Unregistered {
        name: String,
        client: String,
    },
    Updated {
        name: String,
        client: String,
    },
    /// A key was already taken when `client` tried to register `tool`.
    Conflict {
        name: String,
        client: String,
        tool: String,
        existing_client: String,
    },
}

impl RegistryEvent {
    pub fn name(&self) -> &str {
        match self {
            RegistryEvent::Registered { name, .. }
            | RegistryEvent::Unregistered { name, .. }
            | RegistryEvent::Updated { name, .. }
            | RegistryEvent::Conflict { name, .. } => name,
        }
    }
}

pub trait RegistryListener: Send + Sync {
    fn on_registry_event(&self, event: &RegistryEvent);
}

impl<F> RegistryListener for F
where
    F: Fn(&RegistryEvent) + Send + Sync,
{
    fn on_registry_event(&self, event: &RegistryEvent) {
        self(event)
    }
}
