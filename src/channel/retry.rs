//! Reconnect policy.

use std::time::Duration;

/// Default number of consecutive reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between reconnect attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Default bound on one dial plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed-delay retry policy with a hard attempt cap.
///
/// Not exponential: every attempt waits the same [`Self::delay`]. The
/// attempt counter lives on the channel and is only reset by a successful
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum consecutive attempts without a successful open.
    pub max_attempts: u32,
    /// Delay before each attempt.
    pub delay: Duration,
    /// How long one open may take before it counts as failed.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with the default connect timeout.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Delay before the next attempt, or `None` once `attempts_made` has
    /// reached the cap.
    #[must_use]
    pub fn next_delay(&self, attempts_made: u32) -> Option<Duration> {
        (attempts_made < self.max_attempts).then_some(self.delay)
    }
}
