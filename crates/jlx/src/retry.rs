//! 🔁 Adaptive retry controller: "have you tried turning it off and on again, but smaller?"
//!
//! Wraps one remote call. When the call fails transiently, three things happen, in order:
//! 1. ⏳ sleep for a capped exponential backoff (doubles per retry, ceiling at `max_delay`)
//! 2. 🔥 wait for the backpressure monitor to say the cluster's breakers have cleared
//! 3. 📉 try again asking for half as much: the k-th retry asks for `max(1, size / 2^k)`
//!
//! The backoff policy and the health gate are separate pieces. The controller just composes
//! them. Every call to [`RetryController::attempt`] starts fresh, so a success resets both
//! the backoff and the shrink for whatever comes next.
//!
//! 💀 Non-transient errors skip straight to the exit. Retry budget exhaustion (attempts or
//! wall clock, whichever trips first) surfaces as a terminal error.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backpressure::BackpressureMonitor;
use crate::error::{Cancelled, is_transient};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per call, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// ⏱️ Ceiling for a single backoff sleep. Minutes, not seconds: clusters recover slowly.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Wall-clock budget for one call, breaker waits included.
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    120
}

// 🕐 one hour. if the cluster hasn't recovered by then, a human should be looking at it
fn default_max_elapsed_secs() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

/// ⏳ Capped exponential backoff. Stateless: ask it about retry `k`, it tells you how long.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << doublings)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// 📉 Size for retry number `retry`: `max(1, requested / 2^retry)`.
pub fn shrunk_size(requested: usize, retry: u32) -> usize {
    let shift = retry.min(usize::BITS - 1);
    (requested >> shift).max(1)
}

/// ✅ A call that made it, plus what it took to get there.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    /// The size the successful attempt actually asked for.
    pub size: usize,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    backoff: Backoff,
    max_attempts: u32,
    max_elapsed: Duration,
    monitor: BackpressureMonitor,
}

impl RetryController {
    pub fn new(config: &RetryConfig, monitor: BackpressureMonitor) -> Self {
        Self {
            backoff: Backoff::new(
                Duration::from_millis(config.initial_delay_ms),
                Duration::from_secs(config.max_delay_secs),
            ),
            max_attempts: config.max_attempts.max(1),
            max_elapsed: Duration::from_secs(config.max_elapsed_secs),
            monitor,
        }
    }

    /// 🔁 Runs `operation(size)` until it succeeds, fails for real, or the budget runs out.
    ///
    /// `requested_size` only matters to operations that page; everything else passes `1`
    /// and ignores the argument.
    pub async fn attempt<T, F, Fut>(
        &self,
        what: &str,
        requested_size: usize,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<Attempted<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut retry = 0u32;
        loop {
            let size = shrunk_size(requested_size, retry);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                outcome = operation(size) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        size,
                        retries: retry,
                    });
                }
                Err(err) => err,
            };

            if !is_transient(&err) {
                return Err(err.context(format!("💀 {what} failed and it's not the retrying kind")));
            }

            retry += 1;
            if retry >= self.max_attempts || started.elapsed() >= self.max_elapsed {
                return Err(err.context(format!(
                    "💀 {what} still failing after {retry} attempt(s) over {:?}, giving up",
                    started.elapsed()
                )));
            }

            let delay = self.backoff.delay(retry);
            warn!(
                "🔁 {what} failed ({err:#}), retry {retry}/{} in {delay:?} at size {}",
                self.max_attempts - 1,
                shrunk_size(requested_size, retry)
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(delay) => {}
            }
            self.monitor.wait_until_healthy(cancel).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BreakerSnapshot;
    use crate::backends::in_mem::InMemoryCluster;
    use crate::backpressure::BackpressureConfig;
    use crate::error::{TransientError, is_cancelled};
    use std::sync::{Arc, Mutex};

    fn controller(cluster: Arc<InMemoryCluster>, max_attempts: u32) -> RetryController {
        let monitor = BackpressureMonitor::new(cluster, &BackpressureConfig::default());
        RetryController::new(
            &RetryConfig {
                max_attempts,
                initial_delay_ms: 100,
                max_delay_secs: 1,
                max_elapsed_secs: 3600,
            },
            monitor,
        )
    }

    fn transient() -> anyhow::Error {
        anyhow::Error::new(TransientError::new(Some(429), "too many requests"))
    }

    #[test]
    fn the_one_where_backoff_doubles_until_it_hits_the_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u128> = (1..=6).map(|k| backoff.delay(k).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.delay(500), Duration::from_millis(1000), "huge retry counts must not overflow");
    }

    #[test]
    fn the_one_where_the_size_halves_but_never_hits_zero() {
        let sizes: Vec<usize> = (0..=11).map(|k| shrunk_size(1000, k)).collect();
        assert_eq!(sizes, vec![1000, 500, 250, 125, 62, 31, 15, 7, 3, 1, 1, 1]);
        assert_eq!(shrunk_size(7, 200), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_each_retry_asks_for_half_as_much() -> Result<()> {
        let controller = controller(Arc::new(InMemoryCluster::with_docs("idx", 0)), 10);
        let asked = Arc::new(Mutex::new(Vec::new()));
        let asked_in_op = asked.clone();

        let done = controller
            .attempt("search", 1000, &CancellationToken::new(), |size| {
                let asked = asked_in_op.clone();
                async move {
                    let mut asked = asked.lock().unwrap_or_else(|p| p.into_inner());
                    asked.push(size);
                    if asked.len() <= 4 { Err(transient()) } else { Ok(size) }
                }
            })
            .await?;

        assert_eq!(*asked.lock().unwrap_or_else(|p| p.into_inner()), vec![1000, 500, 250, 125, 62]);
        assert_eq!(done.size, 62);
        assert_eq!(done.retries, 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_fatal_error_gets_exactly_one_shot() {
        let controller = controller(Arc::new(InMemoryCluster::with_docs("idx", 0)), 10);
        let calls = Arc::new(Mutex::new(0u32));
        let calls_in_op = calls.clone();

        let result: Result<Attempted<()>> = controller
            .attempt("search", 10, &CancellationToken::new(), |_| {
                let calls = calls_in_op.clone();
                async move {
                    *calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
                    Err(anyhow::anyhow!("💀 response did not decode"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap_or_else(|p| p.into_inner()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_budget_runs_out() {
        let controller = controller(Arc::new(InMemoryCluster::with_docs("idx", 0)), 3);
        let calls = Arc::new(Mutex::new(0u32));
        let calls_in_op = calls.clone();

        let err = controller
            .attempt("search", 10, &CancellationToken::new(), |_| {
                let calls = calls_in_op.clone();
                async move {
                    *calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
                    Err::<(), _>(transient())
                }
            })
            .await
            .expect_err("three strikes");

        assert_eq!(*calls.lock().unwrap_or_else(|p| p.into_inner()), 3);
        assert!(format!("{err:#}").contains("giving up"));
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_retry_waits_for_the_breakers_to_cool_down() -> Result<()> {
        let tripped = Some(vec![BreakerSnapshot::new("n", "parent", 200, 100)]);
        let cluster = Arc::new(InMemoryCluster::with_docs("idx", 0).breaker_script([tripped.clone(), tripped]));
        let controller = controller(cluster.clone(), 5);
        let calls = Arc::new(Mutex::new(0u32));
        let calls_in_op = calls.clone();

        let started = Instant::now();
        controller
            .attempt("search", 10, &CancellationToken::new(), |_| {
                let calls = calls_in_op.clone();
                async move {
                    let mut calls = calls.lock().unwrap_or_else(|p| p.into_inner());
                    *calls += 1;
                    if *calls == 1 { Err(transient()) } else { Ok(()) }
                }
            })
            .await?;

        // 100ms backoff + two 10s breaker polls
        assert_eq!(started.elapsed(), Duration::from_millis(20_100));
        assert_eq!(cluster.breaker_polls.load(std::sync::atomic::Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_cancel_interrupts_the_backoff_nap() {
        let controller = controller(Arc::new(InMemoryCluster::with_docs("idx", 0)), 10);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let err = controller
            .attempt("search", 10, &cancel, |_| {
                let canceller = canceller.clone();
                async move {
                    canceller.cancel();
                    Err::<(), _>(transient())
                }
            })
            .await
            .expect_err("cancelled");
        assert!(is_cancelled(&err));
    }
}
