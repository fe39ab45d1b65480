//! worker-health — readiness probing for the background GUI server.
//!
//! The launcher must not start the handler before the server answers on
//! its status endpoint. Instead of sleeping for a fixed time, it polls:
//!
//! ```text
//! wait_until_ready(address, policy)
//!   ├── optional initial delay
//!   ├── loop
//!   │   ├── http_probe() → ProbeResult
//!   │   ├── ProbeTracker (consecutive failures, backoff)
//!   │   └── sleep(next interval), bounded by max_wait
//!   └── Ok(ReadyReport) | Err(ReadinessError::Timeout)
//! ```
//!
//! Backoff doubles from `interval` up to `max_interval` while the server
//! keeps failing. A single 2xx ends the wait.

pub mod checker;
pub mod readiness;

pub use checker::{ProbeResult, ProbeTracker, http_probe};
pub use readiness::{ReadinessError, ReadinessPolicy, ReadyReport, wait_until_ready};
