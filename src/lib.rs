//! Relais connects to Model Context Protocol servers and turns their tools
//! into permission-checked functions a host application can dispatch.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns settings and the server dictionary, including loading,
//!   saving and validation.
//! - [`mcp`] provides the protocol client, transports, the function registry,
//!   permissions, health monitoring and the integration entry point.
//! - [`cli`] implements the `relais` command-line tool.
//! - [`logging`] installs the tracing subscriber used by the binary.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
