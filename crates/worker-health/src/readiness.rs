//! Bounded readiness wait.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};
use worker_core::config::ReadinessConfig;

use crate::checker::{ProbeResult, ProbeTracker, http_probe};

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error(
        "server at {address} not ready after {waited:?} ({attempts} probes, last result: {last:?})"
    )]
    Timeout {
        address: String,
        waited: Duration,
        attempts: u32,
        last: Option<ProbeResult>,
    },
}

/// How long and how often to poll.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub endpoint: String,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
    pub probe_timeout: Duration,
    pub max_wait: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&ReadinessConfig::default())
    }
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            initial_delay: config.initial_delay.as_duration(),
            interval: config.interval.as_duration(),
            max_interval: config.max_interval.as_duration(),
            probe_timeout: config.probe_timeout.as_duration(),
            max_wait: config.max_wait.as_duration(),
        }
    }
}

/// Outcome of a successful wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyReport {
    pub attempts: u32,
    pub waited: Duration,
}

/// Poll `address` until its status endpoint returns 2xx or `max_wait`
/// elapses. The deadline also bounds each probe and each sleep, so the
/// call never overruns `max_wait` by more than scheduling jitter.
pub async fn wait_until_ready(
    address: &str,
    policy: &ReadinessPolicy,
) -> Result<ReadyReport, ReadinessError> {
    let started = Instant::now();
    let deadline = started + policy.max_wait;
    let mut tracker = ProbeTracker::new(policy.interval, policy.max_interval);

    if !policy.initial_delay.is_zero() {
        debug!(delay = ?policy.initial_delay, "waiting before first readiness probe");
        tokio::time::sleep_until((started + policy.initial_delay).min(deadline)).await;
    }

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe_timeout = policy.probe_timeout.min(remaining.max(Duration::from_millis(1)));
        let result = http_probe(address, &policy.endpoint, probe_timeout).await;
        tracker.record(result);

        if result.is_ready() {
            let waited = started.elapsed();
            info!(
                %address,
                endpoint = %policy.endpoint,
                attempts = tracker.attempts(),
                waited_ms = waited.as_millis() as u64,
                "server ready"
            );
            return Ok(ReadyReport {
                attempts: tracker.attempts(),
                waited,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadinessError::Timeout {
                address: address.to_string(),
                waited: started.elapsed(),
                attempts: tracker.attempts(),
                last: tracker.last(),
            });
        }

        let interval = tracker.next_interval();
        debug!(
            %address,
            attempt = tracker.attempts(),
            ?result,
            next_in_ms = interval.as_millis() as u64,
            "server not ready yet"
        );
        tokio::time::sleep_until((now + interval).min(deadline)).await;
    }
}
