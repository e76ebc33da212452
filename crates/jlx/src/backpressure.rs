//! 🔥 Backpressure monitor: the bouncer who checks the cluster's pulse before letting us back in.
//!
//! Retrying into a cluster whose memory breakers are tripped is like knocking louder on the
//! door of someone who's already asked you to leave. So before every retry, the controller
//! asks this module to wait until every breaker on every node is back under its limit.
//!
//! 🧠 Knowledge graph:
//! - fresh `breaker_stats()` on every poll, nothing cached between polls
//! - healthy = stats call succeeded AND every breaker is strictly below its limit
//! - no upper bound on waiting. Only cancellation gets you out early.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backends::Cluster;
use crate::error::Cancelled;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackpressureConfig {
    /// Turn the health gate off entirely. Retries then only back off.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

// ⏱️ 10 seconds: long enough for a GC cycle to free something, short enough to not nap through it
fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureMonitor {
    cluster: Arc<dyn Cluster>,
    poll_interval: Duration,
    enabled: bool,
}

impl BackpressureMonitor {
    pub fn new(cluster: Arc<dyn Cluster>, config: &BackpressureConfig) -> Self {
        Self {
            cluster,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            enabled: config.enabled,
        }
    }

    /// 🩺 Blocks until the cluster looks healthy. Returns how many poll intervals were slept.
    pub async fn wait_until_healthy(&self, cancel: &CancellationToken) -> Result<u32> {
        if !self.enabled {
            return Ok(0);
        }

        let mut intervals_waited = 0u32;
        loop {
            let stats = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                stats = self.cluster.breaker_stats() => stats,
            };

            match stats {
                Ok(snapshots) => {
                    let mut pressured = snapshots.iter().filter(|snapshot| !snapshot.is_healthy()).peekable();
                    if pressured.peek().is_none() {
                        if intervals_waited > 0 {
                            debug!("✅ breakers cleared after {intervals_waited} poll(s), carrying on");
                        }
                        return Ok(intervals_waited);
                    }
                    for snapshot in pressured {
                        warn!(
                            "🔥 breaker '{}' on '{}' at {} / {} bytes, waiting it out",
                            snapshot.breaker, snapshot.node, snapshot.estimated_bytes, snapshot.limit_bytes
                        );
                    }
                }
                Err(err) => warn!("⚠️ breaker stats unavailable, treating the cluster as unhealthy: {err:#}"),
            }

            intervals_waited += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
