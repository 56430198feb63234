//! Model Context Protocol client runtime.
//!
//! Remote servers are reached through [`transport`], wrapped in a
//! [`client::RemoteClient`] each, and owned by the [`manager::ClientManager`].
//! Their tools become [`adapter::ToolAdapter`]s in the
//! [`registry::FunctionRegistry`], guarded by [`permissions`] and argument
//! validation from [`schema`]. [`resources::ResourceManager`] caches resource
//! reads. [`integration::IntegrationManager`] wires all of it together.

pub mod adapter;
pub mod client;
pub mod error;
pub mod events;
pub mod health;
pub mod integration;
pub mod manager;
pub mod permissions;
pub mod registry;
pub mod resources;
pub mod schema;
pub mod strategy;
pub mod tool;
pub mod transport;

#[cfg(test)]
pub mod test_utils;
