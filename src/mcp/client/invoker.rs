use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mcp::error::McpError;

/// Runs remote calls under a wall-clock deadline.
///
/// A call that misses its deadline is dropped, not abandoned on a worker:
/// transports release their pending-request slot when the future goes away.
/// Cancelling the invoker's token (on shutdown) ends every call in flight.
#[derive(Debug, Clone)]
pub struct TimeoutGuardedInvoker {
    client_name: String,
    shutdown: CancellationToken,
}

impl TimeoutGuardedInvoker {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn invoke<T, F>(
        &self,
        operation: &str,
        deadline: Duration,
        future: F,
    ) -> Result<T, McpError>
    where
        F: Future<Output = Result<T, McpError>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(McpError::Shutdown {
                client: self.client_name.clone(),
            }),
            result = tokio::time::timeout(deadline, future) => match result {
                Ok(result) => result,
                Err(_) => {
                    debug!(
                        server = %self.client_name,
                        operation = %operation,
                        deadline_ms = deadline.as_millis() as u64,
                        "MCP operation timed out"
                    );
                    Err(McpError::timeout(operation, deadline))
                }
            },
        }
    }

    /// Close paths get a short grace period and only log when they overrun.
    pub async fn close<F>(&self, grace: Duration, future: F)
    where
        F: Future<Output = ()>,
    {
        if tokio::time::timeout(grace, future).await.is_err() {
            warn!(server = %self.client_name, grace_ms = grace.as_millis() as u64, "MCP close did not finish in time");
        }
    }

    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
