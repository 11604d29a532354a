//! Utility functions for minishard

use crate::common::OperationContext;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Retry an idempotent command a fixed number of times.
///
/// Only retryable errors (see [`crate::Error::is_retryable`]) trigger another
/// attempt; the delay between attempts is constant. Deadline and cancellation
/// of `ctx` apply to every attempt and to the sleeps in between.
pub async fn retry_idempotent<F, Fut, T>(
    ctx: &OperationContext,
    attempts: usize,
    delay: Duration,
    mut f: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match ctx.run(f()).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    "Attempt {}/{} failed: {}, retrying in {:?}",
                    attempt,
                    attempts,
                    e,
                    delay
                );
                ctx.run(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Exponential backoff with jitter, capped at `max`
pub fn backoff_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << failures.min(16));
    let capped = exp.min(max);
    let jitter = rand::random::<u64>() % (capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter)
}
