use std::error::Error;

use serde_json::Value;

use crate::cli::LoadedConfig;
use crate::mcp::adapter::{CallContext, FunctionResult};
use crate::mcp::client::factory::ClientFactory;
use crate::mcp::integration::{test_connection, CatalogEntry, ConnectionTestReport, IntegrationManager};
use crate::mcp::permissions::StaticPrincipal;
use crate::mcp::resources::AvailableResource;

pub fn connection_report_lines(report: &ConnectionTestReport) -> Vec<String> {
    let mut lines = Vec::new();
    if report.connected {
        lines.push(format!(
            "✅ Connected to {} over {} in {}ms",
            report.server, report.transport, report.elapsed_ms
        ));
    } else {
        lines.push(format!(
            "❌ Could not connect to {} over {}",
            report.server, report.transport
        ));
    }
    if let Some(name) = &report.server_name {
        lines.push(format!("   server: {name}"));
    }
    if let Some(version) = &report.protocol_version {
        lines.push(format!("   protocol: {version}"));
    }
    if report.connected {
        if report.tools.is_empty() {
            lines.push("   tools: none".to_string());
        } else {
            lines.push(format!("   tools: {}", report.tools.join(", ")));
        }
        match report.resources {
            Some(count) => lines.push(format!("   resources: {count}")),
            None => lines.push("   resources: unavailable".to_string()),
        }
        lines.push(format!(
            "   logging level: {}",
            if report.logging_level_accepted {
                "accepted"
            } else {
                "not supported"
            }
        ));
    }
    if let Some(error) = &report.error {
        lines.push(format!("   error: {error}"));
    }
    lines
}

/// Returns whether the connection test succeeded.
pub async fn test_server(loaded: &LoadedConfig, server: &str) -> Result<bool, Box<dyn Error>> {
    let Some(descriptor) = loaded.servers.get(server) else {
        eprintln!("❌ Unknown server: {server}");
        return Ok(false);
    };
    let factory = ClientFactory::new(&loaded.settings)?;
    let report = test_connection(&factory, descriptor).await;
    for line in connection_report_lines(&report) {
        println!("{line}");
    }
    Ok(report.is_success())
}

pub fn catalog_lines(entries: &[CatalogEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No MCP functions registered.".to_string()];
    }
    entries
        .iter()
        .map(|entry| {
            let access = match (entry.enabled, entry.permitted) {
                (false, _) => "offline",
                (true, true) => "allowed",
                (true, false) => "denied",
            };
            format!("{:<32} {:<8} {}", entry.name, access, entry.description)
        })
        .collect()
}

pub async fn list_tools(loaded: LoadedConfig, level: u8) -> Result<(), Box<dyn Error>> {
    let integration = IntegrationManager::new(loaded.settings, loaded.servers)?;
    integration.start().await?;

    let principal = StaticPrincipal::new("cli", level);
    for line in catalog_lines(&integration.catalog(&principal)) {
        println!("{line}");
    }
    let status = integration.status().await;
    println!(
        "\n{} functions from {}/{} connected servers",
        status.registered_tools, status.connected_clients, status.clients
    );

    integration.stop().await;
    Ok(())
}

pub fn resource_lines(resources: &[AvailableResource]) -> Vec<String> {
    if resources.is_empty() {
        return vec!["No MCP resources found.".to_string()];
    }
    resources
        .iter()
        .map(|entry| {
            let resource = &entry.resource;
            let mime_type = resource.mime_type.as_deref().unwrap_or("-");
            format!(
                "{:<12} {:<40} {:<16} {}",
                entry.client, resource.uri, mime_type, resource.name
            )
        })
        .collect()
}

pub async fn list_resources(
    loaded: LoadedConfig,
    query: Option<&str>,
    mime_type: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let integration = IntegrationManager::new(loaded.settings, loaded.servers)?;
    integration.start().await?;

    let found = integration
        .resources()
        .search_resources(query.unwrap_or(""), mime_type)
        .await;
    for line in resource_lines(&found) {
        println!("{line}");
    }

    integration.stop().await;
    Ok(())
}

/// Parses the optional argument text into the JSON the adapter expects.
pub fn parse_arguments(text: Option<&str>) -> Result<Value, serde_json::Error> {
    match text.map(str::trim) {
        None | Some("") => Ok(Value::Object(Default::default())),
        Some(text) => serde_json::from_str(text),
    }
}

/// Returns whether the function succeeded.
pub async fn call_function(
    loaded: LoadedConfig,
    function: &str,
    arguments: Option<&str>,
    principal: &str,
    level: u8,
) -> Result<bool, Box<dyn Error>> {
    let arguments = parse_arguments(arguments)?;
    let integration = IntegrationManager::new(loaded.settings, loaded.servers)?;
    integration.start().await?;

    let principal = StaticPrincipal::new(principal, level);
    let context = CallContext::default();
    let result = integration
        .execute(function, &principal, &context, arguments)
        .await;
    integration.stop().await;

    match &result {
        FunctionResult::Success { text, data } => {
            println!("{text}");
            if let Some(data) = data {
                println!("{}", serde_json::to_string_pretty(data)?);
            }
        }
        FunctionResult::Failure { .. } => eprintln!("❌ {result}"),
    }
    Ok(result.is_success())
}
