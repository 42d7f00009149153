//! Relay retry policy

use std::time::Duration;

/// Dial and reconnect settings for outbound relays
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Dial attempts before the relay is marked failed (at least 1)
    pub max_attempts: u32,

    /// Wait after the first failed attempt; doubles after each further one
    pub initial_backoff: Duration,

    /// Upper bound for the wait between attempts
    pub max_backoff: Duration,

    /// TCP connect, handshake and publish must finish within this time
    pub dial_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RelayConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(2));
        assert_eq!(config.backoff(5), Duration::from_secs(5));
        assert_eq!(config.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RelayConfig::default().max_attempts(0).max_attempts, 1);
    }
}
