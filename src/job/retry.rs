//! Bounded retry with exponential backoff for collaborator stages.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::stages::CollaboratorError;
use crate::types::Stage;

/// Retry policy for external stages.
///
/// Delays double from `initial_backoff_ms` (1s, 2s, 4s with defaults) and are
/// capped at `max_backoff_ms`. A stage timeout counts as a retryable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay.
    pub max_backoff_ms: u64,
    /// Per-attempt time budget; `None` leaves timeouts to the collaborator.
    pub stage_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            stage_timeout_ms: None,
        }
    }
}

impl RetryPolicy {
    /// No retries, no timeout.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, F, Fut>(&self, stage: Stage, mut op: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.stage_timeout_ms {
                Some(after_ms) => tokio::time::timeout(Duration::from_millis(after_ms), op())
                    .await
                    .unwrap_or(Err(CollaboratorError::Timeout { stage, after_ms })),
                None => op().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        stage = %stage,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
