//! Cache entry state.

use crate::error::Error;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Decoded payload of a resolved query.
///
/// Type-erased so one store can hold every query's output; use
/// [`CacheEntry::value_as`] to get the concrete type back.
pub type QueryValue = Arc<dyn Any + Send + Sync>;

/// Identifies one fetch of one key.
///
/// Tokens are allocated by the store in increasing order, so a newer fetch
/// always carries a larger token than any fetch it supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchToken(pub(crate) u64);

impl fmt::Display for FetchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Idle,
    Pending,
    Resolved,
    Failed,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Resolved => write!(f, "resolved"),
            QueryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status together with the data that only exists in that status.
#[derive(Clone, Default)]
pub enum QueryState {
    #[default]
    Idle,
    Pending,
    Resolved(QueryValue),
    Failed(Arc<Error>),
}

impl QueryState {
    pub fn status(&self) -> QueryStatus {
        match self {
            QueryState::Idle => QueryStatus::Idle,
            QueryState::Pending => QueryStatus::Pending,
            QueryState::Resolved(_) => QueryStatus::Resolved,
            QueryState::Failed(_) => QueryStatus::Failed,
        }
    }
}

impl fmt::Debug for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            other => write!(f, "{:?}", other.status()),
        }
    }
}

/// Snapshot of one cache slot.
///
/// Cloning is cheap: the value and error are reference counted.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) state: QueryState,
    pub(crate) fetched_at: Option<Instant>,
    pub(crate) stale_time: Duration,
    pub(crate) in_flight: Option<FetchToken>,
    pub(crate) invalidated: bool,
}

impl Default for CacheEntry {
    fn default() -> Self {
        CacheEntry {
            state: QueryState::Idle,
            fetched_at: None,
            stale_time: Duration::ZERO,
            in_flight: None,
            invalidated: false,
        }
    }
}

impl CacheEntry {
    pub fn state(&self) -> &QueryState {
        &self.state
    }

    pub fn status(&self) -> QueryStatus {
        self.state.status()
    }

    /// The resolved value, present only while `Resolved`.
    pub fn value(&self) -> Option<&QueryValue> {
        match &self.state {
            QueryState::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// The resolved value downcast to `T`.
    pub fn value_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value().cloned()?.downcast::<T>().ok()
    }

    /// The failure, present only while `Failed`.
    pub fn error(&self) -> Option<&Arc<Error>> {
        match &self.state {
            QueryState::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Time of the last completion, successful or not.
    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    /// Staleness window recorded by the last fetch that started.
    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    /// Token of the fetch currently running for this key.
    pub fn in_flight(&self) -> Option<FetchToken> {
        self.in_flight
    }

    pub fn is_pending(&self) -> bool {
        self.status() == QueryStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == QueryStatus::Resolved
    }

    pub fn is_failed(&self) -> bool {
        self.status() == QueryStatus::Failed
    }

    /// Resolved or failed: the query produced an outcome.
    pub fn is_settled(&self) -> bool {
        matches!(self.status(), QueryStatus::Resolved | QueryStatus::Failed)
    }

    /// Whether a consumer should treat this source as loading.
    ///
    /// A source that is not enabled never counts as loading. An enabled source
    /// that has not produced an outcome yet (idle or pending) does.
    pub fn is_loading(&self, enabled: bool) -> bool {
        enabled && matches!(self.status(), QueryStatus::Idle | QueryStatus::Pending)
    }

    /// Stale per the entry's own timestamps, measured at `now`.
    ///
    /// Idle and pending entries are always stale. Resolved and failed entries
    /// become stale once `stale_time` has elapsed since `fetched_at`, or when
    /// explicitly invalidated.
    pub fn is_stale_at(&self, stale_time: Duration, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match (self.status(), self.fetched_at) {
            (QueryStatus::Resolved | QueryStatus::Failed, Some(at)) => {
                now.saturating_duration_since(at) > stale_time
            }
            _ => true,
        }
    }
}
