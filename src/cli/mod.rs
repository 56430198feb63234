//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments, loads settings and the server
//! dictionary, and dispatches to the subcommand handlers.

pub mod server_list;
pub mod tool_commands;

#[cfg(test)]
mod tests;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::core::config::data::Settings;
use crate::core::config::io::ConfigError;
use crate::core::config::servers::ServerDictionary;
use crate::logging::{self, LogOptions};

#[derive(Parser, Debug)]
#[command(name = "relais")]
#[command(about = "Connects to MCP servers and exposes their tools as permission-checked functions")]
#[command(
    long_about = "Relais reads a dictionary of Model Context Protocol servers, connects to them \
over stdio or HTTP, and turns every remote tool into a named function guarded by \
argument validation and a layered permission check.\n\n\
Environment Variables:\n\
  RELAIS_LOG        Log filter directives (falls back to RUST_LOG, then log_level)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Server dictionary (JSON with an `mcpServers` object)
    #[arg(short = 's', long, global = true, value_name = "FILE")]
    pub servers: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// List configured servers and whether they can be used
    Servers,
    /// Check settings and the server dictionary for problems
    Validate,
    /// Connect to one server, list what it offers, then disconnect
    Test {
        /// Server name from the dictionary
        server: String,
    },
    /// Connect to every enabled server and print the function catalog
    Tools {
        /// Trust level of the caller the permissions are evaluated for
        #[arg(long, default_value_t = 0)]
        level: u8,
    },
    /// Connect to every enabled server and search the resources they offer
    Resources {
        /// Matched case-insensitively against name, description and URI
        query: Option<String>,
        /// Only resources with exactly this MIME type
        #[arg(long = "type", value_name = "MIME")]
        mime_type: Option<String>,
    },
    /// Execute one catalog function
    Call {
        /// Catalog name, e.g. `files_read`
        function: String,
        /// JSON object with the tool arguments
        arguments: Option<String>,
        /// Trust level of the caller
        #[arg(long, default_value_t = 0)]
        level: u8,
        /// Identity reported to permission rules
        #[arg(long, default_value = "cli")]
        principal: String,
    },
}

/// Settings, the server dictionary and the raw JSON it was read from.
pub struct LoadedConfig {
    pub settings: Settings,
    pub servers: ServerDictionary,
    pub servers_path: Option<PathBuf>,
    pub raw: Option<Value>,
}

pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    match explicit {
        Some(path) => Settings::load_from_path(path),
        None => Settings::load(),
    }
}

/// A missing dictionary at the default location is an empty dictionary; a
/// missing file named explicitly is an error.
pub fn load_config(
    config: Option<&Path>,
    servers: Option<&Path>,
) -> Result<LoadedConfig, ConfigError> {
    let settings = load_settings(config)?;
    let servers_path = settings.resolve_servers_path(servers);
    let raw = match &servers_path {
        Some(path) if servers.is_some() || settings.servers_file.is_some() || path.exists() => {
            Some(ServerDictionary::read_raw(path)?)
        }
        _ => None,
    };
    let dictionary = match (&raw, &servers_path) {
        (Some(value), Some(path)) => {
            ServerDictionary::parse(value).map_err(|message| ConfigError::Invalid {
                path: path.clone(),
                message,
            })?
        }
        _ => ServerDictionary::default(),
    };
    Ok(LoadedConfig {
        settings,
        servers: dictionary,
        servers_path,
        raw,
    })
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let loaded = load_config(args.config.as_deref(), args.servers.as_deref())?;
    logging::init(&LogOptions::new(
        loaded.settings.log_level.clone(),
        args.log.clone(),
    ))?;

    match args.command {
        Commands::Servers => {
            server_list::list_servers(&loaded);
            Ok(())
        }
        Commands::Validate => {
            if !server_list::print_validation(&loaded) {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Test { server } => {
            if !tool_commands::test_server(&loaded, &server).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Tools { level } => tool_commands::list_tools(loaded, level).await,
        Commands::Resources { query, mime_type } => {
            tool_commands::list_resources(loaded, query.as_deref(), mime_type.as_deref()).await
        }
        Commands::Call {
            function,
            arguments,
            level,
            principal,
        } => {
            let succeeded =
                tool_commands::call_function(loaded, &function, arguments.as_deref(), &principal, level)
                    .await?;
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
