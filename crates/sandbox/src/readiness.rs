use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::{NodeProcess, ProcessExit};

/// Delay between `/status` polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-request timeout; keeps a hung node from stretching one attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("node not ready after {attempts} attempts (last status: {})", fmt_status(.last_status))]
    Timeout {
        attempts: u32,
        last_status: Option<StatusCode>,
        #[source]
        last_error: Option<reqwest::Error>,
    },

    #[error("node exited before becoming ready: {0}")]
    Exited(ProcessExit),

    #[error("readiness wait cancelled")]
    Cancelled,

    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
}

fn fmt_status(status: &Option<StatusCode>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

/// Polls `GET <rpc_url>/status` until it answers 2xx.
pub struct ReadinessProbe {
    status_url: String,
    attempts: u32,
    client: Client,
}

impl ReadinessProbe {
    /// Two attempts per second of `timeout`, at least one.
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, ReadinessError> {
        // The node is always on loopback; never route it through a proxy.
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(ReadinessError::Client)?;
        let attempts = u32::try_from(timeout.as_secs().saturating_mul(2))
            .unwrap_or(u32::MAX)
            .max(1);
        Ok(Self {
            status_url: format!("{}/status", rpc_url.trim_end_matches('/')),
            attempts,
            client,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait for readiness. Fails fast if `node` exits or `cancel` fires.
    pub async fn wait(
        &self,
        node: &NodeProcess,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError> {
        let mut last_status = None;
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                return Err(ReadinessError::Cancelled);
            }
            if let Some(exit) = node.try_exit() {
                return Err(ReadinessError::Exited(exit));
            }

            match self.client.get(&self.status_url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %self.status_url, attempt, "node ready");
                    return Ok(());
                }
                Ok(response) => last_status = Some(response.status()),
                Err(e) => last_error = Some(e),
            }

            if attempt < self.attempts {
                tokio::select! {
                    () = cancel.cancelled() => return Err(ReadinessError::Cancelled),
                    exit = node.wait_exit() => return Err(ReadinessError::Exited(exit)),
                    () = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }

        Err(ReadinessError::Timeout {
            attempts: self.attempts,
            last_status,
            last_error,
        })
    }
}
