use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    /// Terminal; no further transitions are accepted.
    Shutdown,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Error => 4,
            ConnectionState::Shutdown => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Error,
            5 => ConnectionState::Shutdown,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Default)]
struct Timestamps {
    last_connected: Option<DateTime<Utc>>,
    last_disconnected: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
}

/// Connection state and rolling metrics for one client. Every field can be
/// updated through a shared reference.
#[derive(Debug)]
pub struct ClientStatus {
    client_name: String,
    state: AtomicU8,
    timestamps: Mutex<Timestamps>,
    last_error: Mutex<Option<String>>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    average_response_ms: AtomicU64,
    last_response_ms: AtomicU64,
    reconnect_attempts: AtomicU32,
    max_reconnect_attempts: AtomicU32,
    health_check_passed: AtomicBool,
    tools: AtomicI64,
    resources: AtomicI64,
    prompts: AtomicI64,
}

/// Point-in-time copy of a [`ClientStatus`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub client_name: String,
    pub state: ConnectionState,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_ms: u64,
    pub last_response_ms: u64,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub health_check_passed: bool,
    pub tools: u64,
    pub resources: u64,
    pub prompts: u64,
}

impl ClientStatus {
    pub fn new(client_name: impl Into<String>, max_reconnect_attempts: u32) -> Self {
        Self {
            client_name: client_name.into(),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            timestamps: Mutex::new(Timestamps::default()),
            last_error: Mutex::new(None),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            average_response_ms: AtomicU64::new(0),
            last_response_ms: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            max_reconnect_attempts: AtomicU32::new(max_reconnect_attempts),
            health_check_passed: AtomicBool::new(false),
            tools: AtomicI64::new(0),
            resources: AtomicI64::new(0),
            prompts: AtomicI64::new(0),
        }
    }

    fn timestamps(&self) -> std::sync::MutexGuard<'_, Timestamps> {
        self.timestamps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Applies a transition. Returns false once the status is
    /// [`ConnectionState::Shutdown`].
    pub fn set_state(&self, next: ConnectionState) -> bool {
        let applied = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ConnectionState::Shutdown.as_u8()).then_some(next.as_u8())
            })
            .is_ok();
        if !applied {
            return false;
        }

        match next {
            ConnectionState::Connected => {
                self.timestamps().last_connected = Some(Utc::now());
                self.reset_reconnect_attempts();
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                self.timestamps().last_disconnected = Some(Utc::now());
            }
            ConnectionState::Shutdown => {
                let mut timestamps = self.timestamps();
                if timestamps.last_connected.is_some() {
                    timestamps.last_disconnected = Some(Utc::now());
                }
            }
            _ => {}
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn has_error(&self) -> bool {
        self.state() == ConnectionState::Error || self.last_error().is_some()
    }

    pub fn can_reconnect(&self) -> bool {
        self.reconnect_attempts() < self.max_reconnect_attempts.load(Ordering::SeqCst)
            && matches!(
                self.state(),
                ConnectionState::Disconnected | ConnectionState::Error
            )
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn record_request(&self, elapsed: Duration, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.update_response_time(elapsed);
        self.touch();
    }

    /// Folds a sample into the running average: `(avg + sample) / 2`, or the
    /// sample itself for the first one.
    pub fn update_response_time(&self, elapsed: Duration) {
        let sample = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_response_ms.store(sample, Ordering::Relaxed);
        let _ = self
            .average_response_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |average| {
                Some(if average == 0 {
                    sample
                } else {
                    average / 2 + sample / 2 + (average % 2 + sample % 2) / 2
                })
            });
    }

    pub fn touch(&self) {
        self.timestamps().last_activity = Some(Utc::now());
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn increment_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_reconnect_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn record_health_check(&self, passed: bool) {
        self.health_check_passed.store(passed, Ordering::SeqCst);
        self.timestamps().last_health_check = Some(Utc::now());
    }

    pub fn health_check_passed(&self) -> bool {
        self.health_check_passed.load(Ordering::SeqCst)
    }

    /// Negative inputs are stored as zero.
    pub fn set_counts(&self, tools: Option<i64>, resources: Option<i64>, prompts: Option<i64>) {
        if let Some(tools) = tools {
            self.tools.store(tools.max(0), Ordering::Relaxed);
        }
        if let Some(resources) = resources {
            self.resources.store(resources.max(0), Ordering::Relaxed);
        }
        if let Some(prompts) = prompts {
            self.prompts.store(prompts.max(0), Ordering::Relaxed);
        }
    }

    pub fn tool_count(&self) -> u64 {
        self.tools.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.successful_requests.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Time spent in the current connection, or the length of the last one.
    pub fn connection_duration(&self) -> Duration {
        let timestamps = self.timestamps();
        let Some(connected) = timestamps.last_connected else {
            return Duration::ZERO;
        };
        let end = if self.is_connected() {
            Utc::now()
        } else {
            match timestamps.last_disconnected {
                Some(disconnected) if disconnected >= connected => disconnected,
                _ => return Duration::ZERO,
            }
        };
        (end - connected).to_std().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let timestamps = self.timestamps();
        StatusSnapshot {
            client_name: self.client_name.clone(),
            state: self.state(),
            last_connected: timestamps.last_connected,
            last_disconnected: timestamps.last_disconnected,
            last_health_check: timestamps.last_health_check,
            last_activity: timestamps.last_activity,
            last_error: self.last_error(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_response_ms: self.average_response_ms.load(Ordering::Relaxed),
            last_response_ms: self.last_response_ms.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts(),
            max_reconnect_attempts: self.max_reconnect_attempts(),
            health_check_passed: self.health_check_passed(),
            tools: self.tools.load(Ordering::Relaxed).max(0) as u64,
            resources: self.resources.load(Ordering::Relaxed).max(0) as u64,
            prompts: self.prompts.load(Ordering::Relaxed).max(0) as u64,
        }
    }

    /// Multi-line human-readable report.
    pub fn summary(&self) -> String {
        let snapshot = self.snapshot();
        let mut lines = vec![
            format!("Server: {}", snapshot.client_name),
            format!("State: {}", snapshot.state),
        ];
        if let Some(at) = snapshot.last_connected {
            lines.push(format!("Last connected: {}", at.to_rfc3339()));
        }
        if let Some(at) = snapshot.last_disconnected {
            lines.push(format!("Last disconnected: {}", at.to_rfc3339()));
        }
        if snapshot.state == ConnectionState::Connected {
            lines.push(format!(
                "Connected for: {}s",
                self.connection_duration().as_secs()
            ));
        }
        lines.push(format!(
            "Health check: {}",
            if snapshot.health_check_passed {
                "passed"
            } else {
                "failed"
            }
        ));
        if let Some(error) = &snapshot.last_error {
            lines.push(format!("Last error: {error}"));
        }
        lines.push(format!(
            "Reconnect attempts: {}/{}",
            snapshot.reconnect_attempts, snapshot.max_reconnect_attempts
        ));
        lines.push(format!(
            "Requests: {} total, {} ok, {} failed ({:.2}% success)",
            snapshot.total_requests,
            snapshot.successful_requests,
            snapshot.failed_requests,
            self.success_rate() * 100.0
        ));
        lines.push(format!(
            "Response time: {}ms average, {}ms last",
            snapshot.average_response_ms, snapshot.last_response_ms
        ));
        lines.push(format!(
            "Tools: {}, resources: {}, prompts: {}",
            snapshot.tools, snapshot.resources, snapshot.prompts
        ));
        lines.join("\n")
    }
}
