use serde::Deserialize;
use serde_json::Value;

/// One tool advertised by a server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    /// Name as the server knows it; used on the wire.
    pub name: String,
    pub title: Option<String>,
    pub description: String,
    pub input_schema: Option<Value>,
    pub client_name: String,
    /// Catalog key. Defaults to `{client}_{name}` and is replaced by the
    /// registry with the key its conflict strategy resolved.
    pub full_name: String,
}

impl RemoteTool {
    pub fn new(client_name: impl Into<String>, name: impl Into<String>) -> Self {
        let client_name = client_name.into();
        let name = name.into();
        let full_name = if client_name.is_empty() {
            name.clone()
        } else {
            format!("{client_name}_{name}")
        };
        Self {
            name,
            title: None,
            description: String::new(),
            input_schema: None,
            client_name,
            full_name,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn display_name(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => &self.name,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
    }

    /// Same name, description and schema; the catalog key is not compared.
    pub fn same_definition(&self, other: &RemoteTool) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.input_schema == other.input_schema
            && self.title == other.title
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

/// Reads the `tools` array of a `tools/list` result. Entries without a name
/// are skipped.
pub(crate) fn tools_from_list_result(client_name: &str, result: &Value) -> Vec<RemoteTool> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<WireTool>(item.clone()).ok())
        .map(|wire| {
            let mut tool = RemoteTool::new(client_name, wire.name);
            tool.title = wire.title;
            tool.description = wire.description.unwrap_or_default();
            tool.input_schema = wire.input_schema;
            tool
        })
        .filter(RemoteTool::is_valid)
        .collect()
}

/// A resource advertised by `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResource {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A prompt advertised by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemotePrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

pub(crate) fn list_items<T: serde::de::DeserializeOwned>(result: &Value, field: &str) -> Vec<T> {
    result
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<T>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
