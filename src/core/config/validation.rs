//! Configuration report for `relais validate`.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;

use super::data::Settings;
use super::servers::{ServerDictionary, TransportType};
use crate::mcp::permissions::PermissionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub component: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.component, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.has_errors()
    }

    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == Severity::Error)
    }

    fn push(
        &mut self,
        severity: Severity,
        component: impl Into<String>,
        message: impl Into<String>,
        suggestion: Option<&str>,
    ) {
        self.issues.push(ValidationIssue {
            severity,
            component: component.into(),
            message: message.into(),
            suggestion: suggestion.map(str::to_string),
        });
    }
}

fn dictionary_schema() -> Value {
    let string_list = json!({"type": "array", "items": {"type": "string"}});
    json!({
        "type": "object",
        "additionalProperties": {
            "type": "object",
            "properties": {
                "type": {"type": "string"},
                "command": {"type": "string"},
                "args": string_list,
                "env": {"type": "object", "additionalProperties": {"type": "string"}},
                "url": {"type": "string"},
                "enabled": {"type": "boolean"},
                "disabled": {"type": "boolean"},
                "autoApprove": string_list,
                "description": {"type": "string"},
                "toolPermissionPolicy": {"type": "string"},
                "allowedTools": string_list,
                "allowedResources": string_list,
                "protocolVersion": {"type": "string"}
            }
        }
    })
}

/// Structural problems in a raw dictionary, one message per violation.
pub fn check_dictionary_shape(raw: &Value) -> Vec<String> {
    let entries = raw.get("mcpServers").unwrap_or(raw);
    let validator = match jsonschema::validator_for(&dictionary_schema()) {
        Ok(validator) => validator,
        Err(err) => return vec![format!("internal schema error: {err}")],
    };
    validator
        .iter_errors(entries)
        .map(|error| error.to_string())
        .collect()
}

const COMMON_LAUNCHERS: [&str; 5] = ["uvx", "npx", "python", "node", "docker"];

pub fn validate(
    settings: &Settings,
    servers: &ServerDictionary,
    raw: Option<&Value>,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Some(raw) = raw {
        for problem in check_dictionary_shape(raw) {
            report.push(Severity::Error, "dictionary", problem, None);
        }
    }
    for (name, reason) in servers.rejected() {
        report.push(
            Severity::Error,
            format!("server {name}"),
            format!("entry could not be read: {reason}"),
            Some("Fix the entry so it is a JSON object with the documented fields"),
        );
    }

    if settings.enabled && servers.is_empty() {
        report.push(
            Severity::Error,
            "settings",
            "MCP is enabled but no servers are configured",
            Some("Add at least one server or disable MCP"),
        );
    }
    if !settings.enabled && !servers.is_empty() {
        report.push(
            Severity::Warning,
            "settings",
            "servers are configured but MCP is disabled",
            None,
        );
    }
    if settings.enabled && !servers.is_empty() && servers.enabled().next().is_none() {
        report.push(
            Severity::Warning,
            "settings",
            "MCP is enabled but no usable server is enabled",
            Some("Enable at least one valid server"),
        );
    }

    let mut seen = HashSet::new();
    for server in servers.all() {
        let component = format!("server {}", server.name);
        if !seen.insert(server.name.to_ascii_lowercase()) {
            report.push(
                Severity::Error,
                &component,
                "duplicate server name (names are matched case-insensitively)",
                Some("Give every server a unique name"),
            );
        }

        if let Some(problem) = server.validation_problem() {
            report.push(
                Severity::Error,
                &component,
                problem,
                Some("Check the server type and its command or url"),
            );
            continue;
        }

        match &server.transport {
            TransportType::Stdio => {
                let command = server.command.as_deref().unwrap_or_default();
                if !COMMON_LAUNCHERS
                    .iter()
                    .any(|launcher| command.contains(launcher))
                {
                    report.push(
                        Severity::Info,
                        &component,
                        format!("{command} is not a common MCP launcher"),
                        Some("Make sure the command starts an MCP server on stdio"),
                    );
                }
            }
            TransportType::Sse => {
                let url = server.url.as_deref().unwrap_or_default();
                let local = url.starts_with("localhost")
                    || url.starts_with("http://localhost")
                    || url.starts_with("http://127.0.0.1");
                if url.starts_with("http://") && !local {
                    report.push(
                        Severity::Warning,
                        &component,
                        "remote server uses plain http",
                        Some("Prefer https for servers that are not local"),
                    );
                }
            }
            TransportType::Other(_) => {}
        }

        for tool in &server.auto_approve {
            if !server.is_tool_allowed(tool) {
                report.push(
                    Severity::Warning,
                    &component,
                    format!("auto-approved tool {tool} is not in allowedTools"),
                    None,
                );
            }
        }

        if !server.inherits_client_policy()
            && PermissionPolicy::from_tag(&server.tool_permission_policy).is_none()
        {
            report.push(
                Severity::Warning,
                &component,
                format!(
                    "unknown toolPermissionPolicy {}",
                    server.tool_permission_policy
                ),
                Some("Use INHERIT_CLIENT, ALLOW_ALL, DENY_ALL, OP_ONLY or CUSTOM"),
            );
        }
    }

    if settings.health_check_timeout_ms >= settings.request_timeout_ms {
        report.push(
            Severity::Warning,
            "settings",
            "health check timeout is not shorter than the request timeout",
            None,
        );
    }
    if settings.max_retries == 0 {
        report.push(
            Severity::Warning,
            "settings",
            "max_retries is 0; connections are attempted once",
            None,
        );
    }

    let stdio = servers.all().filter(|server| server.is_stdio()).count();
    if stdio > 0 && stdio == servers.len() {
        report
            .suggestions
            .push("All servers are local processes; remote servers can be added with type sse".to_string());
    }

    report
}
