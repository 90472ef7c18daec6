//! Supervised task execution.
//!
//! Long-lived tasks (stream consumers, the live runtime) run under a
//! supervisor that restarts them after panics with exponential backoff. A
//! task that keeps dying takes the process down rather than degrading
//! silently; a task that returns cleanly is treated as shutdown.

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Consecutive rapid failures tolerated before the process aborts.
    pub max_consecutive_failures: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// A task that survived at least this long resets the failure count.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Supervise a task: spawn it, await it, respawn on panic.
///
/// `spawn_fn` is called for every (re)start and must hand back the new
/// task's `JoinHandle`. Returns when the task completes normally.
///
/// # Panics
/// Panics after `max_consecutive_failures` rapid consecutive panics so the
/// process supervisor can restart the whole daemon.
pub async fn supervise<F>(task_name: &str, policy: RestartPolicy, mut spawn_fn: F)
where
    F: FnMut() -> tokio::task::JoinHandle<()>,
{
    let mut consecutive_failures: u32 = 0;
    let mut retry_delay = policy.initial_retry_delay;

    loop {
        let started = Instant::now();
        let handle = spawn_fn();

        match handle.await {
            Ok(()) => {
                info!("Task '{}' completed, supervision ending", task_name);
                return;
            }
            Err(e) if e.is_cancelled() => {
                info!("Task '{}' cancelled, supervision ending", task_name);
                return;
            }
            Err(e) => {
                if started.elapsed() >= policy.stable_after {
                    consecutive_failures = 0;
                    retry_delay = policy.initial_retry_delay;
                }
                consecutive_failures += 1;
                error!(
                    "Task '{}' panicked (failure {}/{}): {}",
                    task_name, consecutive_failures, policy.max_consecutive_failures, e
                );

                if consecutive_failures >= policy.max_consecutive_failures {
                    panic!(
                        "FATAL: task '{}' exceeded {} consecutive failures",
                        task_name, policy.max_consecutive_failures
                    );
                }

                warn!("Task '{}' restarting in {:?}", task_name, retry_delay);
                sleep(retry_delay).await;
                retry_delay = std::cmp::min(retry_delay * 2, policy.max_retry_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            max_consecutive_failures: 3,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(10),
            stable_after: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_supervision_ends_on_clean_exit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        supervise("clean_task", fast_policy(), move || {
            let runs = runs_clone.clone();
            tokio::spawn(async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        })
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_restarted() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        supervise("flaky_task", fast_policy(), move || {
            let runs = runs_clone.clone();
            tokio::spawn(async move {
                if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
            })
        })
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[should_panic(expected = "exceeded 3 consecutive failures")]
    async fn test_repeated_panics_abort() {
        supervise("doomed_task", fast_policy(), || {
            tokio::spawn(async {
                panic!("always");
            })
        })
        .await;
    }
}
