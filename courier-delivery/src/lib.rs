//! Pooled, retrying delivery of built messages over SMTP.
//!
//! The pool keeps a bounded set of idle sessions with a background NOOP
//! probe per session; the sender wraps it with a bounded retry loop that
//! discards failed sessions and returns healthy ones.

use std::time::Duration;

mod error;
mod pool;
mod sender;

pub use error::{PoolError, SendError};
pub use pool::SessionPool;
pub use sender::Sender;

/// Tuning knobs for the session pool and retry loop.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Upper bound on idle pooled sessions.
    pub capacity: usize,
    /// How long to wait for a pooled session before dialing a new one.
    pub acquire_grace: Duration,
    /// Cadence of the per-session keep-alive NOOP probe.
    pub probe_interval: Duration,
    /// Attempts per message before the failure is surfaced.
    pub max_attempts: u32,
    /// Deadline for draining QUITs at shutdown.
    pub quit_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            acquire_grace: Duration::from_millis(250),
            probe_interval: Duration::from_secs(30),
            max_attempts: 10,
            quit_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_contract() {
        let config = DeliveryConfig::default();
        assert_eq!(config.capacity, 100);
        assert_eq!(config.acquire_grace, Duration::from_millis(250));
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.quit_timeout, Duration::from_secs(2));
    }
}
