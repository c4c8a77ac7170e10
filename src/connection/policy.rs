use std::time::Duration;

/// Bounds a single reconnection episode of a [`Connection`](super::Connection).
///
/// Backoff grows linearly: a failed attempt `n` (1-based) is followed by a pause of
/// `n * base_delay`.
/// Every dial, including the initial one, must complete within `connect_timeout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// How long to wait after the failed attempt number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    pub(crate) fn attempts(&self) -> u32 {
        // Zero would make `reconnect` a guaranteed failure.
        self.max_attempts.max(1)
    }
}
