use crate::cli::LoadedConfig;
use crate::core::config::data::path_display;
use crate::core::config::servers::ServerDescriptor;
use crate::core::config::validation::{validate, Severity, ValidationReport};

fn endpoint(descriptor: &ServerDescriptor) -> String {
    match (&descriptor.command, descriptor.endpoint_url()) {
        (_, Some(url)) => url,
        (Some(command), None) if descriptor.args.is_empty() => command.clone(),
        (Some(command), None) => format!("{command} {}", descriptor.args.join(" ")),
        (None, None) => "-".to_string(),
    }
}

pub fn server_lines(loaded: &LoadedConfig) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(path) = &loaded.servers_path {
        lines.push(format!("Server dictionary: {}", path_display(path)));
    }
    if loaded.servers.is_empty() && loaded.servers.rejected().is_empty() {
        lines.push("No MCP servers configured.".to_string());
        return lines;
    }

    for server in loaded.servers.all() {
        let marker = match (server.enabled, server.validation_problem()) {
            (_, Some(_)) => "❌",
            (false, None) => "⏸️ ",
            (true, None) => "✅",
        };
        lines.push(format!(
            "{marker} {} [{}] {}",
            server.name,
            server.transport.tag(),
            endpoint(server)
        ));
        if !server.description.is_empty() {
            lines.push(format!("     {}", server.description));
        }
        if let Some(problem) = server.validation_problem() {
            lines.push(format!("     {problem}"));
        }
        if !server.allowed_tools.is_empty() {
            let tools: Vec<&str> = server.allowed_tools.iter().map(String::as_str).collect();
            lines.push(format!("     allowed tools: {}", tools.join(", ")));
        }
    }
    for (name, reason) in loaded.servers.rejected() {
        lines.push(format!("❌ {name} (unreadable: {reason})"));
    }
    lines
}

pub fn list_servers(loaded: &LoadedConfig) {
    for line in server_lines(loaded) {
        println!("{line}");
    }
}

pub fn report_lines(report: &ValidationReport) -> Vec<String> {
    if report.issues.is_empty() {
        return vec!["✅ Configuration is valid.".to_string()];
    }
    let mut issues: Vec<_> = report.issues.iter().collect();
    issues.sort_by(|a, b| b.severity.cmp(&a.severity));

    let mut lines = Vec::new();
    for issue in issues {
        let marker = match issue.severity {
            Severity::Error => "❌",
            Severity::Warning => "⚠️ ",
            Severity::Info => "ℹ️ ",
        };
        lines.push(format!("{marker} {issue}"));
        if let Some(suggestion) = &issue.suggestion {
            lines.push(format!("     {suggestion}"));
        }
    }
    for suggestion in &report.suggestions {
        lines.push(format!("💡 {suggestion}"));
    }
    lines
}

/// Prints the report; returns whether the configuration has no errors.
pub fn print_validation(loaded: &LoadedConfig) -> bool {
    let report = validate(&loaded.settings, &loaded.servers, loaded.raw.as_ref());
    for line in report_lines(&report) {
        println!("{line}");
    }
    report.is_valid()
}
