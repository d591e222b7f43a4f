use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use agentdock_core::DebugPollConfig;

/// Bounded exponential backoff for metadata that becomes available some time
/// after a session starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&DebugPollConfig::default())
    }
}

impl From<&DebugPollConfig> for BackoffPolicy {
    fn from(config: &DebugPollConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl BackoffPolicy {
    /// Sleep after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Calls `fetch` until it succeeds or `policy.max_attempts` calls have
/// failed. Never returns an error; exhaustion yields `None`.
pub async fn poll_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut fetch: F,
) -> Option<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = tokio::time::Instant::now();
    for attempt in 1..=policy.max_attempts {
        match fetch().await {
            Ok(value) => {
                tracing::info!(
                    poll = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "metadata ready"
                );
                return Some(value);
            }
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    poll = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "metadata not ready: {err}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::warn!(
                    poll = label,
                    attempts = policy.max_attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "giving up on metadata: {err}"
                );
            }
        }
    }
    None
}
