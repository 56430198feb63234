use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mcp::permissions::PermissionPolicy;
use crate::mcp::strategy::ConflictStrategyKind;

/// Runtime settings for the MCP client, stored as TOML.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Master switch; when false the integration starts with no clients.
    pub enabled: bool,
    /// JSON server dictionary to load when none is given on the command line.
    pub servers_file: Option<PathBuf>,
    /// Default tracing filter when neither `RELAIS_LOG` nor `RUST_LOG` is set.
    pub log_level: String,
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub tool_call_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub recovery_delay_ms: u64,
    pub conflict_strategy: ConflictStrategyKind,
    /// Treat an allow-all default as deny for tools nothing else covers.
    pub strict_permissions: bool,
    pub default_permission_policy: PermissionPolicy,
    pub permission_cache_ttl_secs: u64,
    pub tool_change_notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            servers_file: None,
            log_level: "info".to_string(),
            connection_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            tool_call_timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            health_check_interval_secs: 60,
            health_check_timeout_ms: 3_000,
            max_consecutive_failures: 3,
            recovery_delay_ms: 5_000,
            conflict_strategy: ConflictStrategyKind::PrefixClientName,
            strict_permissions: false,
            default_permission_policy: PermissionPolicy::AllowAll,
            permission_cache_ttl_secs: 60,
            tool_change_notifications: true,
        }
    }
}

impl Settings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.permission_cache_ttl_secs)
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
