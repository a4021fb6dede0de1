//! Restart Supervision
//!
//! Components such as the membership cache stop for good when their
//! background stream ends; callers rebuild them. `supervise` runs such a
//! component in a loop, applying a restart budget per time window and an
//! exponential backoff between attempts.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Policy for restarting a stopped component
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum number of restarts within the time window
    pub max_restarts: u32,
    /// Time window for counting restarts
    pub window: Duration,
    /// Initial backoff duration between restarts
    pub backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, window: Duration, backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_restarts,
            window,
            backoff,
            max_backoff,
        }
    }

    /// Restart forever, only backing off.
    pub fn unlimited(backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_restarts: u32::MAX,
            window: Duration::from_secs(60),
            backoff,
            max_backoff,
        }
    }
}

/// Restart history of one supervised component
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restart_times: VecDeque<Instant>,
    consecutive_restarts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restart_times: VecDeque::new(),
            consecutive_restarts: 0,
        }
    }

    /// Record a restart attempt.
    ///
    /// Returns the backoff to wait before restarting, or `None` once the
    /// budget for the current window is spent.
    pub fn record_restart(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(front) = self.restart_times.front() {
            if now.duration_since(*front) > self.policy.window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }

        if self.restart_times.len() >= self.policy.max_restarts as usize {
            return None;
        }

        self.restart_times.push_back(now);
        self.consecutive_restarts = self.consecutive_restarts.saturating_add(1);
        Some(self.backoff())
    }

    fn backoff(&self) -> Duration {
        let exponent = self.consecutive_restarts.saturating_sub(1).min(16);
        self.policy
            .backoff
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_backoff)
    }

    /// Reset the backoff after a run that lasted long enough to count as healthy.
    pub fn reset(&mut self) {
        self.consecutive_restarts = 0;
    }

    pub fn restart_count(&self) -> usize {
        self.restart_times.len()
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}

/// Run `run` until it succeeds, restarting it after failures under `policy`.
///
/// `run` returns `Ok(())` for an orderly stop and `Err` when the component
/// died. A run that lasted longer than the policy window resets the backoff.
/// Returns the last error once the restart budget is exhausted.
pub async fn supervise<F, Fut, E>(name: &str, policy: RestartPolicy, mut run: F) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut tracker = RestartTracker::new(policy);
    loop {
        let started = Instant::now();
        let err = match run().await {
            Ok(()) => {
                info!(component = %name, "Supervised component stopped");
                return Ok(());
            }
            Err(e) => e,
        };

        if started.elapsed() > tracker.policy().window {
            tracker.reset();
        }

        match tracker.record_restart() {
            Some(backoff) => {
                warn!(
                    component = %name,
                    error = %err,
                    restart_count = tracker.restart_count(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Supervised component failed, restarting"
                );
                tokio::time::sleep(backoff).await;
            }
            None => {
                error!(component = %name, error = %err, "Restart budget exhausted");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_restart_budget() {
        let policy = RestartPolicy::new(
            3,
            Duration::from_secs(10),
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        let mut tracker = RestartTracker::new(policy);

        assert!(tracker.record_restart().is_some());
        assert!(tracker.record_restart().is_some());
        assert!(tracker.record_restart().is_some());
        assert!(tracker.record_restart().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tracker.record_restart().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_caps() {
        let policy = RestartPolicy::unlimited(Duration::from_millis(100), Duration::from_millis(350));
        let mut tracker = RestartTracker::new(policy);

        assert_eq!(tracker.record_restart(), Some(Duration::from_millis(100)));
        assert_eq!(tracker.record_restart(), Some(Duration::from_millis(200)));
        assert_eq!(tracker.record_restart(), Some(Duration::from_millis(350)));

        tracker.reset();
        assert_eq!(tracker.record_restart(), Some(Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_restarts_until_success() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        let result: Result<(), String> = supervise("test", RestartPolicy::default(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("watch ended".to_string())
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_gives_up() {
        let policy = RestartPolicy::new(
            2,
            Duration::from_secs(60),
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        let result: Result<(), String> =
            supervise("test", policy, || async { Err("boom".to_string()) }).await;
        assert_eq!(result, Err("boom".to_string()));
    }
}
