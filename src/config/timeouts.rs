//! Timeout settings.
//!
//! The engines are timerless; callers schedule wake-ups from these
//! values and feed expiry back via the engines' `on_timeout` inputs.

use std::time::Duration;

/// Deadlines the caller enforces around engine operations.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Whole-request budget, headers through final body byte.
    pub request_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}
