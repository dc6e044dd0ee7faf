//! Metrics hooks and staleness policy.

use crate::error::Error;
use crate::key::QueryKey;
use std::collections::HashMap;
use std::time::Duration;

/// Staleness window used when neither the descriptor nor the policy says otherwise.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Hooks called by the [`QueryRunner`](crate::runner::QueryRunner).
///
/// Every method defaults to a no-op; implement the ones you care about.
pub trait QueryMetrics: Send + Sync {
    /// A network fetch was started for `key`.
    fn record_fetch_started(&self, _key: &QueryKey) {}

    /// A caller attached to a fetch already in flight.
    fn record_deduplicated(&self, _key: &QueryKey) {}

    /// The entry was fresh, no fetch needed.
    fn record_fresh(&self, _key: &QueryKey) {}

    fn record_success(&self, _key: &QueryKey, _elapsed: Duration) {}

    fn record_failure(&self, _key: &QueryKey, _error: &Error) {}

    /// A completion arrived for a superseded fetch and was dropped.
    fn record_discarded(&self, _key: &QueryKey) {}
}

/// Metrics sink that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {}

/// How long a settled entry stays fresh when a descriptor sets no window.
#[derive(Debug, Clone, Default)]
pub enum StalePolicy {
    /// [`DEFAULT_STALE_TIME`] for every key.
    #[default]
    Default,

    /// The same window for every key.
    Fixed(Duration),

    /// Windows keyed by the first key segment, falling back to `default`.
    PerPrefix {
        default: Duration,
        overrides: HashMap<String, Duration>,
    },
}

impl StalePolicy {
    /// Per-prefix policy starting from `default`.
    pub fn per_prefix(default: Duration) -> Self {
        StalePolicy::PerPrefix {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Add a prefix override. Turns any other policy into `PerPrefix`.
    pub fn with_prefix(self, prefix: impl Into<String>, stale_time: Duration) -> Self {
        let (default, mut overrides) = match self {
            StalePolicy::Default => (DEFAULT_STALE_TIME, HashMap::new()),
            StalePolicy::Fixed(d) => (d, HashMap::new()),
            StalePolicy::PerPrefix { default, overrides } => (default, overrides),
        };
        overrides.insert(prefix.into(), stale_time);
        StalePolicy::PerPrefix { default, overrides }
    }

    pub fn stale_time_for(&self, key: &QueryKey) -> Duration {
        match self {
            StalePolicy::Default => DEFAULT_STALE_TIME,
            StalePolicy::Fixed(d) => *d,
            StalePolicy::PerPrefix { default, overrides } => key
                .prefix()
                .and_then(|p| overrides.get(p))
                .copied()
                .unwrap_or(*default),
        }
    }
}
