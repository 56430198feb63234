//! Resource discovery across every client, with a content cache in front of
//! `resources/read`.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::mcp::client::protocol::ResourceContents;
use crate::mcp::error::McpError;
use crate::mcp::events::ToolChangeListener;
use crate::mcp::manager::ClientManager;
use crate::mcp::tool::{RemoteResource, RemoteTool};

pub const DEFAULT_RESOURCE_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RESOURCE_CACHE_SIZE: usize = 100;

/// A resource together with the client that advertises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableResource {
    pub client: String,
    pub resource: RemoteResource,
}

impl AvailableResource {
    /// Case-insensitive substring match on name, description and URI. An
    /// empty query matches everything.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        let resource = &self.resource;
        resource.name.to_lowercase().contains(&query)
            || resource.uri.to_lowercase().contains(&query)
            || resource
                .description
                .as_deref()
                .is_some_and(|description| description.to_lowercase().contains(&query))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub expired: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn active(&self) -> usize {
        self.total - self.expired
    }

    pub fn usage_percent(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.total as f64 / self.max_size as f64 * 100.0
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cached ({} active, {} expired) of {}, {:.1}% full",
            self.total,
            self.active(),
            self.expired,
            self.max_size,
            self.usage_percent()
        )
    }
}

struct CachedContents {
    contents: Vec<ResourceContents>,
    stored_at: Instant,
}

type CacheKey = (String, String);

pub struct ResourceManager {
    manager: Arc<ClientManager>,
    cache: Mutex<HashMap<CacheKey, CachedContents>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResourceManager {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        Self::with_cache(manager, DEFAULT_RESOURCE_CACHE_TTL, DEFAULT_RESOURCE_CACHE_SIZE)
    }

    /// A `max_entries` of zero disables caching.
    pub fn with_cache(manager: Arc<ClientManager>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            manager,
            cache: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<CacheKey, CachedContents>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, entry: &CachedContents) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }

    /// Reads a resource, answering from the cache when `use_cache` is set and
    /// a fresh copy exists. Only successful reads are cached.
    pub async fn get_resource_content(
        &self,
        client: &str,
        uri: &str,
        use_cache: bool,
    ) -> Result<Vec<ResourceContents>, McpError> {
        let key = (client.to_string(), uri.to_string());
        if use_cache {
            if let Some(contents) = self.cached(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(contents);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let contents = self.manager.read_resource(client, uri).await?;
        if use_cache {
            self.store(key, contents.clone());
        }
        Ok(contents)
    }

    fn cached(&self, key: &CacheKey) -> Option<Vec<ResourceContents>> {
        let mut cache = self.lock_cache();
        let entry = cache.get(key)?;
        if self.is_fresh(entry) {
            return Some(entry.contents.clone());
        }
        cache.remove(key);
        None
    }

    fn store(&self, key: CacheKey, contents: Vec<ResourceContents>) {
        if self.max_entries == 0 {
            return;
        }
        let mut cache = self.lock_cache();
        if !cache.contains_key(&key) && cache.len() >= self.max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                debug!(client = %oldest.0, uri = %oldest.1, "Evicting cached MCP resource");
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CachedContents {
                contents,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn list_client_resources(&self, client: &str) -> Result<Vec<RemoteResource>, McpError> {
        self.manager.refresh_client_resources(client).await
    }

    /// Lists the resources of every connected client. A client whose listing
    /// fails contributes nothing.
    pub async fn list_available_resources(&self) -> Vec<AvailableResource> {
        let clients: Vec<String> = self
            .manager
            .clients()
            .iter()
            .filter(|client| client.is_connected())
            .map(|client| client.name().to_string())
            .collect();
        let listings = join_all(
            clients
                .iter()
                .map(|client| self.manager.refresh_client_resources(client)),
        )
        .await;

        let mut available = Vec::new();
        for (client, listing) in clients.into_iter().zip(listings) {
            match listing {
                Ok(resources) => available.extend(resources.into_iter().map(|resource| {
                    AvailableResource {
                        client: client.clone(),
                        resource,
                    }
                })),
                Err(err) => warn!(server = %client, error = %err, "MCP resource listing failed"),
            }
        }
        available
    }

    /// Resources matching `query` and, when given, exactly `mime_type`.
    pub async fn search_resources(
        &self,
        query: &str,
        mime_type: Option<&str>,
    ) -> Vec<AvailableResource> {
        self.list_available_resources()
            .await
            .into_iter()
            .filter(|entry| entry.matches(query))
            .filter(|entry| {
                mime_type.is_none_or(|wanted| entry.resource.mime_type.as_deref() == Some(wanted))
            })
            .collect()
    }

    /// Reads every `(client, uri)` pair into the cache. Returns how many
    /// loaded.
    pub async fn preload_resources(&self, targets: &[(String, String)]) -> usize {
        let reads = join_all(
            targets
                .iter()
                .map(|(client, uri)| self.get_resource_content(client, uri, true)),
        )
        .await;
        reads.iter().filter(|read| read.is_ok()).count()
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    pub fn clear_resource_cache(&self, client: &str, uri: &str) -> bool {
        self.lock_cache()
            .remove(&(client.to_string(), uri.to_string()))
            .is_some()
    }

    pub fn clear_client_cache(&self, client: &str) -> usize {
        let mut cache = self.lock_cache();
        let before = cache.len();
        cache.retain(|(owner, _), _| owner != client);
        before - cache.len()
    }

    pub fn clear_expired_cache(&self) -> usize {
        let ttl = self.ttl;
        let mut cache = self.lock_cache();
        let before = cache.len();
        cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        before - cache.len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.lock_cache();
        CacheStats {
            total: cache.len(),
            expired: cache.values().filter(|entry| !self.is_fresh(entry)).count(),
            max_size: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cached contents of a client that went away are dropped with it.
impl ToolChangeListener for ResourceManager {
    fn on_tools_changed(&self, _client: &str, _old: &[RemoteTool], _new: &[RemoteTool]) {}

    fn on_client_connection_changed(&self, client: &str, connected: bool) {
        if !connected {
            let dropped = self.clear_client_cache(client);
            if dropped > 0 {
                debug!(server = %client, dropped, "Dropped cached MCP resources");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_utils::{manager_with, ScriptedServer};
    use serde_json::json;

    fn docs_server() -> Arc<ScriptedServer> {
        let server = ScriptedServer::with_tools("docs", &["search"]);
        *server.resources.lock().expect("resources") = Some(vec![
            json!({"uri": "file:///guide.md", "name": "guide", "description": "Getting started", "mimeType": "text/markdown"}),
            json!({"uri": "file:///logo.png", "name": "logo", "mimeType": "image/png"}),
        ]);
        server
    }

    async fn connected(servers: &[Arc<ScriptedServer>]) -> Arc<ClientManager> {
        let manager = Arc::new(manager_with(servers));
        manager.connect_all().await;
        manager
    }

    #[tokio::test]
    async fn cached_reads_skip_the_server() {
        let server = docs_server();
        let resources = ResourceManager::new(connected(&[server.clone()]).await);

        let first = resources
            .get_resource_content("docs", "file:///guide.md", true)
            .await
            .expect("read");
        let second = resources
            .get_resource_content("docs", "file:///guide.md", true)
            .await
            .expect("read");
        assert_eq!(first, second);
        assert_eq!(server.received("resources/read"), 1);

        resources
            .get_resource_content("docs", "file:///guide.md", false)
            .await
            .expect("read");
        assert_eq!(server.received("resources/read"), 2);

        let stats = resources.cache_stats();
        assert_eq!((stats.total, stats.hits, stats.misses), (1, 1, 1));
    }

    #[tokio::test]
    async fn expired_entries_are_read_again() {
        let server = docs_server();
        let resources = ResourceManager::with_cache(
            connected(&[server.clone()]).await,
            Duration::from_millis(20),
            10,
        );
        resources
            .get_resource_content("docs", "file:///guide.md", true)
            .await
            .expect("read");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(resources.cache_stats().expired, 1);

        resources
            .get_resource_content("docs", "file:///guide.md", true)
            .await
            .expect("read");
        assert_eq!(server.received("resources/read"), 2);
        assert_eq!(resources.clear_expired_cache(), 0);
    }

    #[tokio::test]
    async fn full_cache_evicts_the_oldest_entry() {
        let server = docs_server();
        let resources =
            ResourceManager::with_cache(connected(&[server.clone()]).await, DEFAULT_RESOURCE_CACHE_TTL, 2);
        for uri in ["file:///a", "file:///b", "file:///c"] {
            resources
                .get_resource_content("docs", uri, true)
                .await
                .expect("read");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(resources.cache_stats().total, 2);
        assert!(!resources.clear_resource_cache("docs", "file:///a"));
        assert!(resources.clear_resource_cache("docs", "file:///c"));
        assert!((resources.cache_stats().usage_percent() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_reads_are_not_cached() {
        let server = docs_server();
        let resources = ResourceManager::new(connected(&[server.clone()]).await);
        assert!(resources
            .get_resource_content("ghost", "file:///guide.md", true)
            .await
            .is_err());
        assert_eq!(resources.cache_stats().total, 0);
    }

    #[tokio::test]
    async fn search_spans_clients_and_filters_by_type() {
        let docs = docs_server();
        let bare = ScriptedServer::with_tools("bare", &["noop"]);
        let resources = ResourceManager::new(connected(&[docs, bare]).await);

        let all = resources.list_available_resources().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|entry| entry.client == "docs"));

        let started = resources.search_resources("STARTED", None).await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].resource.name, "guide");

        let images = resources.search_resources("", Some("image/png")).await;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].resource.uri, "file:///logo.png");
        assert!(resources.search_resources("logo", Some("text/markdown")).await.is_empty());
    }

    #[tokio::test]
    async fn preload_fills_the_cache_and_disconnect_drops_it() {
        let server = docs_server();
        let resources = ResourceManager::new(connected(&[server.clone()]).await);
        let targets = vec![
            ("docs".to_string(), "file:///guide.md".to_string()),
            ("docs".to_string(), "file:///logo.png".to_string()),
            ("ghost".to_string(), "file:///x".to_string()),
        ];
        assert_eq!(resources.preload_resources(&targets).await, 2);
        assert_eq!(resources.cache_stats().total, 2);

        resources.on_client_connection_changed("docs", false);
        assert_eq!(resources.cache_stats().total, 0);
    }

    #[test]
    fn stats_render_usage() {
        let stats = CacheStats {
            total: 3,
            expired: 1,
            max_size: 4,
            hits: 0,
            misses: 0,
        };
        assert_eq!(stats.active(), 2);
        assert_eq!(stats.to_string(), "3 cached (2 active, 1 expired) of 4, 75.0% full");
    }
}
