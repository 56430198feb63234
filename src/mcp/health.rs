//! Periodic liveness sweep over every client, with automatic recovery.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::data::Settings;
use crate::mcp::manager::ClientManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Connected, but the last ping failed.
    Degraded,
    Unhealthy,
    Recovering,
    /// Not monitored.
    Disabled,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Recovering => "recovering",
            HealthStatus::Disabled => "disabled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub client: String,
    pub status: HealthStatus,
    pub response_time: Duration,
    pub message: String,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    pub recovery_delay: Duration,
}

impl HealthConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.health_check_interval(),
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
            recovery_delay: settings.recovery_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStatistics {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub recovering: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
struct ClientHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl Default for ClientHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
        }
    }
}

pub struct HealthMonitor {
    manager: Arc<ClientManager>,
    config: HealthConfig,
    health: Mutex<HashMap<String, ClientHealth>>,
    recovering: Mutex<HashSet<String>>,
    running: Mutex<Option<CancellationToken>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ClientManager>, config: HealthConfig) -> Self {
        Self {
            manager,
            config,
            health: Mutex::new(HashMap::new()),
            recovering: Mutex::new(HashSet::new()),
            running: Mutex::new(None),
        }
    }

    fn health(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClientHealth>> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts the sweep loop. A second call while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }
        for name in self.manager.client_names() {
            self.health().entry(name).or_default();
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let monitor = Arc::clone(self);
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check_all().await;
                    }
                }
            }
            debug!("MCP health monitor stopped");
        });
        info!(interval_secs = interval.as_secs(), "MCP health monitor started");
    }

    pub fn stop(&self) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    pub async fn check_all(self: &Arc<Self>) -> Vec<HealthCheckResult> {
        let names = self.manager.client_names();
        futures_util::future::join_all(names.iter().map(|name| self.check_client(name))).await
    }

    /// Pings one client and records the outcome. Enough consecutive failures
    /// schedule a reconnect after the recovery delay.
    pub async fn check_client(self: &Arc<Self>, name: &str) -> HealthCheckResult {
        let started = Instant::now();
        let (status, message) = match self.manager.client(name) {
            None => (HealthStatus::Unhealthy, "client does not exist".to_string()),
            Some(client) if !client.is_connected() => {
                (HealthStatus::Unhealthy, "client is not connected".to_string())
            }
            Some(client) => match client.ping().await {
                Ok(()) => {
                    client.status().record_health_check(true);
                    (HealthStatus::Healthy, "ok".to_string())
                }
                Err(err) => {
                    client.status().record_health_check(false);
                    if client.is_connected() {
                        (HealthStatus::Degraded, format!("ping failed: {err}"))
                    } else {
                        self.manager.client_lost(name);
                        (HealthStatus::Unhealthy, format!("ping failed: {err}"))
                    }
                }
            },
        };
        let result = HealthCheckResult {
            client: name.to_string(),
            status,
            response_time: started.elapsed(),
            message,
        };
        self.record(&result);
        result
    }

    fn record(self: &Arc<Self>, result: &HealthCheckResult) {
        let failures = {
            let mut health = self.health();
            let entry = health.entry(result.client.clone()).or_default();
            let previous = entry.status;
            if result.is_healthy() {
                entry.consecutive_failures = 0;
                entry.last_success = Some(Instant::now());
                entry.status = HealthStatus::Healthy;
                if previous != HealthStatus::Healthy {
                    info!(server = %result.client, previous = %previous, "MCP server healthy again");
                }
                return;
            }
            entry.consecutive_failures += 1;
            entry.last_failure = Some(Instant::now());
            if entry.status != HealthStatus::Recovering {
                entry.status = result.status;
            }
            entry.consecutive_failures
        };
        warn!(
            server = %result.client,
            status = %result.status,
            failures,
            message = %result.message,
            "MCP health check failed"
        );
        if failures >= self.config.max_consecutive_failures {
            self.schedule_recovery(&result.client);
        }
    }

    fn schedule_recovery(self: &Arc<Self>, name: &str) {
        if !self
            .recovering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
        {
            return;
        }
        self.set_status(name, HealthStatus::Recovering);
        info!(server = %name, delay_ms = self.config.recovery_delay.as_millis() as u64, "Scheduling MCP server recovery");

        let monitor = Arc::clone(self);
        let name = name.to_string();
        let token = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(monitor.config.recovery_delay) => {
                    monitor.recover_client(&name).await;
                }
            }
            monitor
                .recovering
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&name);
        });
    }

    fn set_status(&self, name: &str, status: HealthStatus) {
        self.health().entry(name.to_string()).or_default().status = status;
    }

    /// Reconnects a client now. Returns whether it came back.
    pub async fn recover_client(&self, name: &str) -> bool {
        self.set_status(name, HealthStatus::Recovering);
        match self.manager.reconnect_client(name).await {
            Ok(true) => {
                let mut health = self.health();
                let entry = health.entry(name.to_string()).or_default();
                entry.consecutive_failures = 0;
                entry.last_success = Some(Instant::now());
                entry.status = HealthStatus::Healthy;
                info!(server = %name, "MCP server recovered");
                true
            }
            Ok(false) | Err(_) => {
                self.set_status(name, HealthStatus::Unhealthy);
                warn!(server = %name, "MCP server recovery failed");
                false
            }
        }
    }

    pub fn client_health(&self, name: &str) -> HealthStatus {
        self.health()
            .get(name)
            .map(|entry| entry.status)
            .unwrap_or(HealthStatus::Disabled)
    }

    pub fn consecutive_failures(&self, name: &str) -> u32 {
        self.health()
            .get(name)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn all_health(&self) -> BTreeMap<String, HealthStatus> {
        self.health()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status))
            .collect()
    }

    pub fn statistics(&self) -> HealthStatistics {
        let health = self.health();
        let count = |status: HealthStatus| {
            health
                .values()
                .filter(|entry| entry.status == status)
                .count()
        };
        HealthStatistics {
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            recovering: count(HealthStatus::Recovering),
            total: health.len(),
        }
    }

    pub fn add_client(&self, name: &str) {
        self.health().entry(name.to_string()).or_default();
    }

    pub fn remove_client(&self, name: &str) {
        self.health().remove(name);
    }
}
