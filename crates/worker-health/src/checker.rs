//! Readiness probe logic.
//!
//! A probe is one HTTP/1 GET against the server's status endpoint over a
//! fresh connection. [`ProbeTracker`] turns a run of probe outcomes into the
//! delay before the next attempt.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tracing::debug;

const USER_AGENT: &str = concat!("comfy-worker/", env!("CARGO_PKG_VERSION"));

/// Longest run of doublings applied to the base interval.
const MAX_DOUBLINGS: u32 = 16;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The status endpoint returned 2xx.
    Ready,
    /// The server answered, but not with 2xx.
    NotReady,
    /// No answer: connection refused, handshake error or timeout.
    Failed,
}

impl ProbeResult {
    pub fn is_ready(self) -> bool {
        self == ProbeResult::Ready
    }
}

/// Probe history for one readiness wait.
///
/// The delay stays at the base interval after the first miss, then doubles
/// with every further consecutive miss up to the cap. A `Ready` result
/// resets it.
#[derive(Debug)]
pub struct ProbeTracker {
    base: Duration,
    cap: Duration,
    attempts: u32,
    consecutive_failures: u32,
    last: Option<ProbeResult>,
}

impl ProbeTracker {
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            base: interval,
            cap: max_backoff.max(interval),
            attempts: 0,
            consecutive_failures: 0,
            last: None,
        }
    }

    pub fn record(&mut self, result: ProbeResult) {
        self.attempts += 1;
        self.last = Some(result);
        self.consecutive_failures = if result.is_ready() {
            0
        } else {
            self.consecutive_failures + 1
        };
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last(&self) -> Option<ProbeResult> {
        self.last
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        let doublings = self.consecutive_failures.saturating_sub(1).min(MAX_DOUBLINGS);
        self.base.saturating_mul(1 << doublings).min(self.cap)
    }
}

/// Probe `http://{address}{path}` once, bounded by `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, get_status(address, path)).await {
        Ok(Ok(status)) if status.is_success() => ProbeResult::Ready,
        Ok(Ok(status)) => {
            debug!(%status, address, path, "status endpoint not ready");
            ProbeResult::NotReady
        }
        Ok(Err(e)) => {
            debug!(error = %e, address, path, "readiness probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(address, path, ?timeout, "readiness probe timed out");
            ProbeResult::Failed
        }
    }
}

async fn get_status(address: &str, path: &str) -> Result<http::StatusCode, BoxError> {
    let stream = tokio::net::TcpStream::connect(address).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(conn);

    let request = http::Request::get(path)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, USER_AGENT)
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await;
    driver.abort();

    Ok(response?.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn tracker_starts_empty() {
        let tracker = ProbeTracker::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(tracker.attempts(), 0);
        assert_eq!(tracker.last(), None);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn tracker_first_failure_keeps_base_interval() {
        let mut tracker = ProbeTracker::new(Duration::from_secs(1), Duration::from_secs(8));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn tracker_exponential_backoff() {
        let mut tracker = ProbeTracker::new(Duration::from_secs(1), Duration::from_secs(60));

        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));

        tracker.record(ProbeResult::NotReady);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));
    }

    #[test]
    fn tracker_backoff_caps_at_max() {
        let mut tracker = ProbeTracker::new(Duration::from_millis(500), Duration::from_secs(5));
        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(5));
        assert_eq!(tracker.attempts(), 10);
    }

    #[test]
    fn tracker_resets_on_ready() {
        let mut tracker = ProbeTracker::new(Duration::from_secs(1), Duration::from_secs(60));
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        tracker.record(ProbeResult::Ready);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(tracker.last().unwrap().is_ready());
    }

    #[test]
    fn tracker_max_never_below_base() {
        let tracker = ProbeTracker::new(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(tracker.next_interval(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_returns_failed() {
        let result = http_probe("127.0.0.1:1", "/system_stats", Duration::from_millis(200)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn http_probe_ready_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let address = server.address().to_string();
        let result = http_probe(&address, "/system_stats", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Ready);
    }

    #[tokio::test]
    async fn http_probe_not_ready_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let address = server.address().to_string();
        let result = http_probe(&address, "/system_stats", Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::NotReady);
    }

    #[tokio::test]
    async fn http_probe_times_out_on_slow_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let address = server.address().to_string();
        let result = http_probe(&address, "/system_stats", Duration::from_millis(200)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
