//! Transient-failure retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use cartwheel_core::config::RetryConfig;
use cartwheel_core::error::{CartwheelError, Result};

/// Delay before retry number `retry` (1-based): `base * factor^(retry-1)`,
/// jittered by ±10% so parallel callers do not fall into lockstep.
pub fn backoff_delay(policy: &RetryConfig, retry: u32) -> Duration {
    let exp = policy.factor.powi(retry.saturating_sub(1) as i32);
    let millis = policy.base_delay_ms as f64 * exp;
    let jitter = rand::rng().random_range(0.9..=1.1);
    Duration::from_millis((millis * jitter) as u64)
}

/// Run `attempt` until it succeeds, fails non-transiently, or exhausts
/// `policy.max_retries` retries. Cancellation aborts immediately, both
/// mid-attempt and mid-backoff.
pub async fn with_retry<T, F, Fut>(
    ctx: &CancellationToken,
    policy: &RetryConfig,
    label: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for round in 0..=policy.max_retries {
        if round > 0 {
            let delay = backoff_delay(policy, round);
            tokio::select! {
                _ = ctx.cancelled() => return Err(CartwheelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let outcome = tokio::select! {
            _ = ctx.cancelled() => return Err(CartwheelError::Cancelled),
            outcome = attempt() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && round < policy.max_retries => {
                warn!(label, retry = round + 1, error = %e, "Transient failure, retrying");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable when max_retries >= 1; the loop returns the final error.
    Err(last_error.unwrap_or(CartwheelError::Cancelled))
}
