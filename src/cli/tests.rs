use super::*;
use crate::cli::server_list::{report_lines, server_lines};
use crate::cli::tool_commands::{
    catalog_lines, connection_report_lines, parse_arguments, resource_lines,
};
use crate::core::config::validation::validate;
use crate::mcp::integration::{CatalogEntry, ConnectionTestReport};
use crate::mcp::resources::AvailableResource;
use crate::mcp::tool::RemoteResource;
use clap::Parser;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn write_servers(dir: &TempDir, value: serde_json::Value) -> PathBuf {
    let path = dir.path().join("servers.json");
    fs::write(&path, value.to_string()).expect("write servers");
    path
}

#[test]
fn parses_global_flags_after_subcommand() {
    let args = Args::try_parse_from([
        "relais",
        "call",
        "files_read",
        r#"{"path":"/tmp"}"#,
        "--level",
        "2",
        "--servers",
        "servers.json",
    ])
    .expect("parse");
    assert_eq!(args.servers, Some(PathBuf::from("servers.json")));
    assert_eq!(
        args.command,
        Commands::Call {
            function: "files_read".to_string(),
            arguments: Some(r#"{"path":"/tmp"}"#.to_string()),
            level: 2,
            principal: "cli".to_string(),
        }
    );
}

#[test]
fn subcommand_is_required() {
    assert!(Args::try_parse_from(["relais"]).is_err());
    let args = Args::try_parse_from(["relais", "tools"]).expect("parse");
    assert_eq!(args.command, Commands::Tools { level: 0 });
}

#[test]
fn explicit_dictionary_is_loaded() {
    let dir = TempDir::new().expect("tempdir");
    let servers = write_servers(
        &dir,
        json!({"mcpServers": {
            "files": {"command": "npx", "args": ["-y", "files-server"], "description": "Local files"},
            "remote": {"type": "sse", "url": "https://mcp.example.com/mcp", "disabled": true},
            "broken": {"type": "ftp"}
        }}),
    );
    let config = dir.path().join("config.toml");

    let loaded = load_config(Some(&config), Some(&servers)).expect("load");
    assert_eq!(loaded.servers.len(), 3);
    assert!(loaded.raw.is_some());

    let lines = server_lines(&loaded);
    assert!(lines.iter().any(|line| line.starts_with("✅ files [stdio] npx -y files-server")));
    assert!(lines.iter().any(|line| line.contains("Local files")));
    assert!(lines.iter().any(|line| line.starts_with("⏸️  remote [sse]")));
    assert!(lines.iter().any(|line| line.starts_with("❌ broken [ftp]")));
}

#[test]
fn missing_explicit_dictionary_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("config.toml");
    let missing = dir.path().join("nope.json");
    let err = load_config(Some(&config), Some(&missing)).err().expect("error");
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn validation_lists_errors_first() {
    let dir = TempDir::new().expect("tempdir");
    let servers = write_servers(
        &dir,
        json!({"mcpServers": {
            "files": {"command": "files-server"},
            "broken": {"type": "sse"}
        }}),
    );
    let loaded = load_config(Some(&dir.path().join("config.toml")), Some(&servers)).expect("load");
    let report = validate(&loaded.settings, &loaded.servers, loaded.raw.as_ref());
    assert!(!report.is_valid());

    let lines = report_lines(&report);
    assert!(lines[0].starts_with("❌"));
    assert!(lines.iter().any(|line| line.contains("broken")));
}

#[test]
fn catalog_marks_denied_and_offline_functions() {
    let entries = vec![
        CatalogEntry {
            name: "files_search".to_string(),
            client: "files".to_string(),
            description: "[MCP:files] search".to_string(),
            enabled: true,
            permitted: true,
        },
        CatalogEntry {
            name: "files_delete".to_string(),
            client: "files".to_string(),
            description: "[MCP:files] delete".to_string(),
            enabled: true,
            permitted: false,
        },
        CatalogEntry {
            name: "web_fetch".to_string(),
            client: "web".to_string(),
            description: "[MCP:web] fetch".to_string(),
            enabled: false,
            permitted: true,
        },
    ];
    let lines = catalog_lines(&entries);
    assert!(lines[0].contains("allowed"));
    assert!(lines[1].contains("denied"));
    assert!(lines[2].contains("offline"));
    assert_eq!(catalog_lines(&[]), vec!["No MCP functions registered."]);
}

#[test]
fn connection_report_shows_failure_reason() {
    let report = ConnectionTestReport {
        server: "files".to_string(),
        transport: "stdio".to_string(),
        error: Some("spawn failed".to_string()),
        ..ConnectionTestReport::default()
    };
    let lines = connection_report_lines(&report);
    assert_eq!(lines[0], "❌ Could not connect to files over stdio");
    assert_eq!(lines.last().map(String::as_str), Some("   error: spawn failed"));
}

#[test]
fn call_arguments_default_to_empty_object() {
    assert_eq!(parse_arguments(None).expect("empty"), json!({}));
    assert_eq!(parse_arguments(Some("  ")).expect("blank"), json!({}));
    assert_eq!(
        parse_arguments(Some(r#"{"path": "/a"}"#)).expect("object"),
        json!({"path": "/a"})
    );
    assert!(parse_arguments(Some("{path")).is_err());
}

#[test]
fn resources_command_takes_query_and_type() {
    let args = Args::try_parse_from(["relais", "resources", "guide", "--type", "text/markdown"])
        .expect("parse");
    assert_eq!(
        args.command,
        Commands::Resources {
            query: Some("guide".to_string()),
            mime_type: Some("text/markdown".to_string()),
        }
    );
}

#[test]
fn resource_lines_show_owner_and_type() {
    let found = vec![AvailableResource {
        client: "docs".to_string(),
        resource: RemoteResource {
            uri: "file:///guide.md".to_string(),
            name: "guide".to_string(),
            description: None,
            mime_type: None,
        },
    }];
    let lines = resource_lines(&found);
    assert!(lines[0].starts_with("docs "));
    assert!(lines[0].contains("file:///guide.md"));
    assert!(lines[0].contains(" - "));
    assert!(lines[0].ends_with("guide"));
    assert_eq!(resource_lines(&[]), vec!["No MCP resources found."]);
}
