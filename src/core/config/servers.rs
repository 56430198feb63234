//! Server descriptor dictionary.
//!
//! The dictionary is a JSON object keyed by server name, optionally wrapped in
//! an `mcpServers` object the way desktop MCP hosts write it.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use super::io::ConfigError;

pub const INHERIT_CLIENT_POLICY: &str = "INHERIT_CLIENT";

/// How a descriptor reaches its server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Spawned child process speaking JSON-RPC over stdin/stdout.
    #[default]
    Stdio,
    /// HTTP endpoint answering with JSON or an event stream.
    Sse,
    Other(String),
}

impl TransportType {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "stdio" => TransportType::Stdio,
            "sse" | "http" | "streamable-http" | "streamable_http" => TransportType::Sse,
            other => TransportType::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            TransportType::Stdio => "stdio",
            TransportType::Sse => "sse",
            TransportType::Other(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: TransportType,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub enabled: bool,
    pub auto_approve: BTreeSet<String>,
    pub description: String,
    pub tool_permission_policy: String,
    /// Empty means every tool is allowed.
    pub allowed_tools: BTreeSet<String>,
    /// Empty means every resource is allowed.
    pub allowed_resources: BTreeSet<String>,
    pub protocol_version: Option<String>,
}

impl ServerDescriptor {
    pub fn new(name: impl Into<String>, transport: TransportType) -> Self {
        Self {
            name: name.into(),
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            enabled: true,
            auto_approve: BTreeSet::new(),
            description: String::new(),
            tool_permission_policy: INHERIT_CLIENT_POLICY.to_string(),
            allowed_tools: BTreeSet::new(),
            allowed_resources: BTreeSet::new(),
            protocol_version: None,
        }
    }

    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        let mut descriptor = Self::new(name, TransportType::Stdio);
        descriptor.command = Some(command.into());
        descriptor
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut descriptor = Self::new(name, TransportType::Sse);
        descriptor.url = Some(url.into());
        descriptor
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_stdio(&self) -> bool {
        self.transport == TransportType::Stdio
    }

    pub fn is_sse(&self) -> bool {
        self.transport == TransportType::Sse
    }

    pub fn is_valid(&self) -> bool {
        self.validation_problem().is_none()
    }

    /// Describes why the descriptor cannot be used, if it cannot.
    pub fn validation_problem(&self) -> Option<String> {
        if self.name.trim().is_empty() {
            return Some("server name is empty".to_string());
        }
        match &self.transport {
            TransportType::Stdio => match self.command.as_deref().map(str::trim) {
                Some(command) if !command.is_empty() => None,
                _ => Some(format!("stdio server {} has no command", self.name)),
            },
            TransportType::Sse => match self.url.as_deref().map(str::trim) {
                Some(url) if is_supported_url(url) => None,
                Some(url) if !url.is_empty() => Some(format!(
                    "sse server {} has unsupported url {url}",
                    self.name
                )),
                _ => Some(format!("sse server {} has no url", self.name)),
            },
            TransportType::Other(tag) => {
                Some(format!("server {} uses unknown type {tag}", self.name))
            }
        }
    }

    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.contains(tool_name)
    }

    pub fn is_resource_allowed(&self, uri: &str) -> bool {
        self.allowed_resources.is_empty() || self.allowed_resources.contains(uri)
    }

    pub fn is_auto_approved(&self, tool_name: &str) -> bool {
        self.auto_approve.contains(tool_name)
    }

    pub fn inherits_client_policy(&self) -> bool {
        self.tool_permission_policy.trim().is_empty()
            || self
                .tool_permission_policy
                .eq_ignore_ascii_case(INHERIT_CLIENT_POLICY)
    }

    /// Endpoint with a scheme, so `localhost:8080/mcp` becomes a usable URL.
    pub fn endpoint_url(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim();
        if url.starts_with("localhost") {
            Some(format!("http://{url}"))
        } else {
            Some(url.to_string())
        }
    }
}

fn is_supported_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("localhost")
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawServerEntry {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    url: Option<String>,
    enabled: Option<bool>,
    disabled: Option<bool>,
    auto_approve: Vec<String>,
    description: Option<String>,
    tool_permission_policy: Option<String>,
    allowed_tools: Vec<String>,
    allowed_resources: Vec<String>,
    protocol_version: Option<String>,
}

impl RawServerEntry {
    fn into_descriptor(self, name: &str) -> ServerDescriptor {
        let transport = self
            .kind
            .as_deref()
            .map(TransportType::from_tag)
            .unwrap_or_default();
        // `disabled` wins when both flags are present.
        let enabled = match (self.enabled, self.disabled) {
            (_, Some(disabled)) => !disabled,
            (Some(enabled), None) => enabled,
            (None, None) => true,
        };
        let mut descriptor = ServerDescriptor::new(name, transport);
        descriptor.command = self.command;
        descriptor.args = self.args;
        descriptor.env = self.env;
        descriptor.url = self.url;
        descriptor.enabled = enabled;
        descriptor.auto_approve = self.auto_approve.into_iter().collect();
        descriptor.description = self.description.unwrap_or_default();
        descriptor.tool_permission_policy = self
            .tool_permission_policy
            .unwrap_or_else(|| INHERIT_CLIENT_POLICY.to_string());
        descriptor.allowed_tools = self.allowed_tools.into_iter().collect();
        descriptor.allowed_resources = self.allowed_resources.into_iter().collect();
        descriptor.protocol_version = self.protocol_version;
        descriptor
    }
}

/// Every descriptor found in a dictionary, valid or not, plus entries that
/// could not be read at all.
#[derive(Debug, Clone, Default)]
pub struct ServerDictionary {
    servers: BTreeMap<String, ServerDescriptor>,
    rejected: Vec<(String, String)>,
}

impl ServerDictionary {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        Self {
            servers: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
            rejected: Vec::new(),
        }
    }

    pub fn parse(value: &Value) -> Result<Self, String> {
        let entries = match value.get("mcpServers") {
            Some(Value::Object(entries)) => entries,
            Some(_) => return Err("mcpServers must be an object".to_string()),
            None => value
                .as_object()
                .ok_or_else(|| "server dictionary must be a JSON object".to_string())?,
        };

        let mut dictionary = ServerDictionary::default();
        for (name, entry) in entries {
            if !entry.is_object() {
                dictionary
                    .rejected
                    .push((name.clone(), "entry is not an object".to_string()));
                continue;
            }
            match serde_json::from_value::<RawServerEntry>(entry.clone()) {
                Ok(raw) => {
                    dictionary
                        .servers
                        .insert(name.clone(), raw.into_descriptor(name));
                }
                Err(err) => dictionary.rejected.push((name.clone(), err.to_string())),
            }
        }
        Ok(dictionary)
    }

    /// Reads the file as JSON without interpreting any entry.
    pub fn read_raw(path: &Path) -> Result<Value, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let value = Self::read_raw(path)?;
        Self::parse(&value).map_err(|message| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.get(name).or_else(|| {
            self.servers
                .values()
                .find(|server| server.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn all(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.values()
    }

    /// Enabled descriptors that pass validation; what the runtime connects to.
    pub fn enabled(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers
            .values()
            .filter(|server| server.enabled && server.is_valid())
    }

    pub fn rejected(&self) -> &[(String, String)] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
