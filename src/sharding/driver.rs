//! Background driver draining the range deleter queues

use crate::common::{backoff_delay, OperationContext, RangeDeleterConfig};
use crate::sharding::range_deleter::RangeDeleterRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// Failure streak of one namespace
#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Start the range deleter loop. It stops once `shutdown` carries `true`.
///
/// A namespace whose steps keep failing is retried with its own exponential
/// backoff; the other queues keep draining at full speed.
pub fn start_range_deleter_task(
    registry: Arc<RangeDeleterRegistry>,
    config: RangeDeleterConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoffs: HashMap<String, Backoff> = HashMap::new();
        tracing::info!(batch_size = config.batch_size, "Range deleter started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let namespaces = registry.namespaces_with_pending();
            backoffs.retain(|ns, _| namespaces.contains(ns));

            let delay = if namespaces.is_empty() {
                config.idle_interval()
            } else {
                let mut attempted = false;
                for ns in &namespaces {
                    let now = Instant::now();
                    if backoffs.get(ns).is_some_and(|b| b.retry_at > now) {
                        continue;
                    }
                    attempted = true;

                    let ctx = OperationContext::internal("range-deleter");
                    match registry
                        .clean_up_next_range(&ctx, ns, config.batch_size)
                        .await
                    {
                        Ok(_) => {
                            backoffs.remove(ns);
                        }
                        Err(e) => {
                            let failures = backoffs
                                .get(ns)
                                .map(|b| b.failures.saturating_add(1))
                                .unwrap_or(1);
                            let delay = backoff_delay(failures, BASE_BACKOFF, config.max_backoff());
                            tracing::warn!(%ns, failures, ?delay, "Range deletion step failed: {}", e);
                            backoffs.insert(
                                ns.clone(),
                                Backoff {
                                    failures,
                                    retry_at: Instant::now() + delay,
                                },
                            );
                        }
                    }
                }

                if attempted {
                    Duration::ZERO
                } else {
                    // Every pending queue is backing off
                    let now = Instant::now();
                    backoffs
                        .values()
                        .map(|b| b.retry_at.saturating_duration_since(now))
                        .min()
                        .unwrap_or_else(|| config.idle_interval())
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Range deleter stopped");
    })
}
