//! Reconciliation workers.
//!
//! Periodic tasks that converge the engine's beliefs with the broker's
//! truth. Each runs on its own timer, bounds every iteration by its period,
//! and swallows per-item errors so one bad asset never blocks the rest.

pub mod bootstrap;
pub mod consistency;
pub mod order_janitor;
pub mod stuck_sells;

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Drive a worker on a fixed period until shutdown.
///
/// Every iteration runs inside its own spawned task so a panic is contained
/// to that sweep, and inside a deadline equal to the period so an overrun
/// cannot pile up behind itself.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        info!("Worker '{}' started (period {:?})", name, period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let iteration = tokio::spawn(task());
            let aborter = iteration.abort_handle();
            match tokio::time::timeout(period, iteration).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("Worker '{}' iteration failed: {}", name, e),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    error!("Worker '{}' iteration panicked: {}", name, join_err);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    aborter.abort();
                    warn!("Worker '{}' iteration exceeded its period, canceled", name);
                }
            }
        }

        info!("Worker '{}' stopped", name);
    })
}
