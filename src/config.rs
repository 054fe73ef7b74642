//! Engine tuning knobs.
//!
//! All fields are public with documented defaults, in the same spirit as a
//! plain builder struct: construct with struct-update syntax from
//! [`EngineConfig::default()`].

use std::time::Duration;

/// Configuration shared by the command engine and the projection engine.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventgate::EngineConfig;
///
/// let config = EngineConfig {
///     projection_batch_size: 500,
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.projection_batch_size, 500);
/// assert_eq!(config.command_max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many times the command engine re-runs the whole
    /// load-validate-push procedure after a concurrency conflict before
    /// surfacing the conflict to the caller.
    ///
    /// Default: 3.
    pub command_max_retries: u32,

    /// Base delay before the first command retry. Doubles per attempt, with
    /// up to [`command_retry_jitter`](EngineConfig::command_retry_jitter)
    /// of uniform jitter added so contending writers spread out.
    ///
    /// Default: 25 milliseconds.
    pub command_retry_base_delay: Duration,

    /// Upper bound of the uniform jitter added to each command retry delay.
    ///
    /// Default: 50 milliseconds.
    pub command_retry_jitter: Duration,

    /// Maximum number of events a projection worker reads from the store
    /// per catch-up batch.
    ///
    /// Default: 200.
    pub projection_batch_size: i64,

    /// How long a projection lock is valid before other workers may steal
    /// it. Must comfortably exceed the time one batch takes; the worker
    /// renews the lock when less than half the TTL remains.
    ///
    /// Default: 30 seconds.
    pub projection_lock_ttl: Duration,

    /// Interval between projection worker ticks when the stream is drained.
    ///
    /// Default: 1 second.
    pub projection_tick_interval: Duration,

    /// Base delay before a failed event is retried. Doubles per recorded
    /// failure, capped at
    /// [`failed_event_max_delay`](EngineConfig::failed_event_max_delay).
    ///
    /// Default: 1 second.
    pub failed_event_base_delay: Duration,

    /// Cap on the per-failed-event retry delay.
    ///
    /// Default: 5 minutes.
    pub failed_event_max_delay: Duration,

    /// Failure count after which an event is quarantined: no automatic
    /// retries, operator resolution required. Never silently dropped.
    ///
    /// Default: 5.
    pub failed_event_max_failures: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_max_retries: 3,
            command_retry_base_delay: Duration::from_millis(25),
            command_retry_jitter: Duration::from_millis(50),
            projection_batch_size: 200,
            projection_lock_ttl: Duration::from_secs(30),
            projection_tick_interval: Duration::from_secs(1),
            failed_event_base_delay: Duration::from_secs(1),
            failed_event_max_delay: Duration::from_secs(300),
            failed_event_max_failures: 5,
        }
    }
}

impl EngineConfig {
    /// Backoff delay before retrying an event that has failed
    /// `failure_count` times already: exponential in the count, capped.
    pub(crate) fn failed_event_delay(&self, failure_count: i32) -> Duration {
        let shift = failure_count.clamp(0, 20) as u32;
        let delay = self
            .failed_event_base_delay
            .saturating_mul(2u32.saturating_pow(shift.saturating_sub(1)));
        delay.min(self.failed_event_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = EngineConfig::default();
        assert_eq!(config.command_max_retries, 3);
        assert_eq!(config.projection_batch_size, 200);
        assert_eq!(config.projection_lock_ttl, Duration::from_secs(30));
        assert_eq!(config.failed_event_max_failures, 5);
    }

    #[test]
    fn failed_event_delay_doubles_and_caps() {
        let config = EngineConfig {
            failed_event_base_delay: Duration::from_secs(1),
            failed_event_max_delay: Duration::from_secs(8),
            ..EngineConfig::default()
        };
        assert_eq!(config.failed_event_delay(1), Duration::from_secs(1));
        assert_eq!(config.failed_event_delay(2), Duration::from_secs(2));
        assert_eq!(config.failed_event_delay(3), Duration::from_secs(4));
        assert_eq!(config.failed_event_delay(4), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(config.failed_event_delay(10), Duration::from_secs(8));
        assert_eq!(config.failed_event_delay(1000), Duration::from_secs(8));
    }
}
