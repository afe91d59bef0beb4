//! Polling and lock-retry scheduling

use super::lock::{AssetLockRegistry, LockGuard};
use crate::assets::Network;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Wait primitive used between polls
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Drives polls on a randomised interval
pub struct RetryScheduler {
    poll_min: Duration,
    poll_max: Duration,
    lock_retry: Duration,
    max_poll_duration: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let (poll_min, poll_max) = config.poll_window();
        Self {
            poll_min,
            poll_max,
            lock_retry: config.lock_retry(),
            max_poll_duration: config.max_poll_duration(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_poll_duration(mut self, limit: Option<Duration>) -> Self {
        self.max_poll_duration = limit;
        self
    }

    fn next_interval(&self) -> Duration {
        if self.poll_max <= self.poll_min {
            return self.poll_min;
        }
        rand::thread_rng().gen_range(self.poll_min..=self.poll_max)
    }

    /// Call `poll` until it yields a value
    ///
    /// The first poll runs immediately. `Ok(None)` waits a random interval
    /// inside the poll window and polls again; an error is returned as is.
    pub async fn with_interval<T, F, Fut>(&self, mut poll: F) -> OrchestratorResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = OrchestratorResult<Option<T>>> + Send,
        T: Send,
    {
        let started = self.clock.now();
        let mut attempts = 0u64;

        loop {
            attempts += 1;
            match poll().await {
                Ok(Some(value)) => {
                    metrics::record_poll_attempt("resolved");
                    debug!(attempts, "Poll resolved");
                    return Ok(value);
                }
                Ok(None) => metrics::record_poll_attempt("pending"),
                Err(e) => {
                    metrics::record_poll_attempt("error");
                    return Err(e);
                }
            }

            if let Some(limit) = self.max_poll_duration {
                if self.clock.now().saturating_duration_since(started) >= limit {
                    return Err(OrchestratorError::Timeout {
                        operation: format!("poll after {} attempts", attempts),
                    });
                }
            }

            self.sleeper.sleep(self.next_interval()).await;
        }
    }

    /// Run `action` while holding the chain lock of `asset`
    ///
    /// Waits for the matching unlock (or the lock retry interval) while the
    /// lock is busy. The lock is released on every exit path.
    pub async fn with_lock<T, F, Fut>(
        &self,
        locks: &AssetLockRegistry,
        network: Network,
        wallet_id: &str,
        asset: &str,
        action: F,
    ) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = OrchestratorResult<T>> + Send,
        T: Send,
    {
        let guard = loop {
            let mut listener = locks.subscribe();
            let attempt = locks.try_lock(network, wallet_id, asset)?;
            if attempt.success {
                break LockGuard::new(locks, attempt.key);
            }

            debug!(key = %attempt.key, "Waiting for lock");
            tokio::select! {
                _ = listener.wait_for(&attempt.key) => {}
                _ = self.sleeper.sleep(self.lock_retry) => {}
            }
        };

        let result = action().await;
        drop(guard);
        result
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_resolves_with_first_value_and_stops() {
        let (scheduler, sleeper) = instant_scheduler();
        let calls = AtomicUsize::new(0);

        let value = scheduler
            .with_interval(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(if n >= 3 { Some(n) } else { None }) }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.count(), 2);
        for waited in sleeper.slept.lock().unwrap().iter() {
            assert!(*waited >= Duration::from_secs(15) && *waited <= Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn test_first_poll_runs_without_waiting() {
        let (scheduler, sleeper) = instant_scheduler();
        let value = scheduler.with_interval(|| async { Ok(Some("ready")) }).await.unwrap();
        assert_eq!(value, "ready");
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_error_surfaces_without_another_attempt() {
        let (scheduler, _) = instant_scheduler();
        let calls = AtomicUsize::new(0);

        let result: OrchestratorResult<()> = scheduler
            .with_interval(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 2 {
                        Err(OrchestratorError::ChainConnection {
                            chain: "ethereum".to_string(),
                            message: "503".to_string(),
                        })
                    } else {
                        Ok(None)
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(OrchestratorError::ChainConnection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_optional_poll_ceiling() {
        let clock = Arc::new(ManualClock::new());
        let sleeper = Arc::new(InstantSleeper::with_clock(clock.clone()));
        let scheduler = RetryScheduler::new(&config())
            .with_sleeper(sleeper.clone())
            .with_clock(clock)
            .with_max_poll_duration(Some(Duration::from_secs(60)));

        let result: OrchestratorResult<()> = scheduler.with_interval(|| async { Ok(None) }).await;
        assert!(matches!(result, Err(OrchestratorError::Timeout { .. })));
        // 15-30s per wait means two to four waits before the ceiling
        assert!((2..=4).contains(&sleeper.count()));
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error() {
        let (scheduler, _) = instant_scheduler();
        let locks = AssetLockRegistry::new();

        let result: OrchestratorResult<()> = scheduler
            .with_lock(&locks, Network::Mainnet, "w1", "BTC", || async {
                Err(OrchestratorError::Wallet("rejected".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!locks.is_locked("mainnet-w1-bitcoin"));
    }

    #[tokio::test]
    async fn test_with_lock_waits_for_unlock_event() {
        let scheduler = Arc::new(RetryScheduler::new(&config()));
        let locks = Arc::new(AssetLockRegistry::new());
        let held = locks.try_lock(Network::Mainnet, "w1", "ETH").unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            let locks = locks.clone();
            tokio::spawn(async move {
                scheduler
                    .with_lock(&locks, Network::Mainnet, "w1", "DAI", || async {
                        Ok(locks.is_locked("mainnet-w1-ethereum"))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        locks.unlock(&held.key);
        // Lock retry is 5s; the unlock event must wake the waiter well before that
        let held_inside = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke on unlock")
            .unwrap()
            .unwrap();
        assert!(held_inside);
        assert!(!locks.is_locked("mainnet-w1-ethereum"));
    }
}
