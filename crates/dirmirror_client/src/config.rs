//! Configuration for the mirror client.

use dirmirror_protocol::{FrameLimits, IgnoreRules};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Configuration for a mirror.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`.
    pub server_addr: String,
    /// Local directory the source tree is replayed into.
    pub mirror_root: PathBuf,
    /// Extensions the server should not send creations for.
    pub ignore_rules: IgnoreRules,
    /// Connection retry configuration.
    pub retry: RetryConfig,
    /// Limits applied to inbound frames.
    pub limits: FrameLimits,
}

impl ClientConfig {
    /// Creates a new client configuration.
    pub fn new(server_addr: impl Into<String>, mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            server_addr: server_addr.into(),
            mirror_root: mirror_root.into(),
            ignore_rules: IgnoreRules::new(),
            retry: RetryConfig::default(),
            limits: FrameLimits::default(),
        }
    }

    /// Sets the ignore rules sent in the handshake.
    pub fn with_ignore_rules(mut self, rules: IgnoreRules) -> Self {
        self.ignore_rules = rules;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the inbound frame limits.
    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Longest wait between two connection attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How many times, and how patiently, the client tries to connect.
///
/// The wait doubles after every failed attempt up to [`MAX_RETRY_DELAY`],
/// plus up to a quarter more when jitter is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Connection attempts before giving up. Always at least one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Whether waits are spread out at random.
    pub jitter: bool,
}

impl RetryConfig {
    /// `max_attempts` attempts, one second apart at first.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            jitter: true,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Sets the wait before the second attempt.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Makes waits exact.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Wait before attempt number `attempt`, counting from zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1 << doublings)
            .min(MAX_RETRY_DELAY);
        if self.jitter {
            base + base.mul_f64(0.25 * jitter_fraction())
        } else {
            base
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// A fraction in `[0, 1)` taken from the clock.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let rules: IgnoreRules = ["tmp", "log"].into_iter().collect();
        let config = ClientConfig::new("127.0.0.1:7878", "/var/mirror")
            .with_ignore_rules(rules.clone())
            .with_retry(RetryConfig::no_retry())
            .with_limits(FrameLimits::new(4096));

        assert_eq!(config.server_addr, "127.0.0.1:7878");
        assert_eq!(config.mirror_root, PathBuf::from("/var/mirror"));
        assert_eq!(config.ignore_rules, rules);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.limits.max_field_len, 4096);
    }

    #[test]
    fn retry_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert!(config.jitter);
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
        assert_eq!(RetryConfig::no_retry().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn waits_double_and_stop_at_the_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(500))
            .without_jitter();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(9), MAX_RETRY_DELAY);
        assert_eq!(config.delay_for_attempt(u32::MAX), MAX_RETRY_DELAY);
    }

    #[test]
    fn jitter_adds_at_most_a_quarter() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));
        for _ in 0..20 {
            let delay = config.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }
}
