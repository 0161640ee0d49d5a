//! Retention policy shared by both buffer variants.

use std::time::Duration;

use replay_ipc::RecorderConfig;

/// How much history a buffer keeps.
///
/// Entries older than `window + safety_margin` are evicted. The margin covers
/// chunk and segment granularity plus scheduling jitter, so that at least
/// `window` of content is always on hand. `hard_byte_cap` bounds memory use
/// independently of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Duration of history the buffer must guarantee.
    pub window: Duration,

    /// Extra history kept beyond the window.
    pub safety_margin: Duration,

    /// Upper bound on buffered bytes.
    pub hard_byte_cap: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&RecorderConfig::default())
    }
}

impl RetentionPolicy {
    /// Build the policy from the persisted configuration.
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            window: Duration::from_secs(u64::from(config.window_seconds)),
            safety_margin: Duration::from_secs(u64::from(config.safety_margin_seconds)),
            hard_byte_cap: config.hard_byte_cap,
        }
    }

    /// Age beyond which an entry is stale.
    pub fn max_age(&self) -> Duration {
        self.window + self.safety_margin
    }

    /// Check if an entry of the given age should be evicted.
    pub fn is_stale(&self, age: Duration) -> bool {
        age > self.max_age()
    }

    /// Check if the byte total exceeds the cap.
    pub fn is_over_cap(&self, bytes: u64) -> bool {
        bytes > self.hard_byte_cap
    }
}
