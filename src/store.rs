//! Keyed in-memory store of query results.

use crate::entry::{CacheEntry, FetchToken, QueryState, QueryValue};
use crate::error::Error;
use crate::key::QueryKey;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A state change requested for one entry.
///
/// Only the [`QueryRunner`](crate::runner::QueryRunner) produces patches that
/// move an entry between statuses.
#[derive(Debug, Clone)]
pub(crate) enum EntryPatch {
    /// Mark the entry pending under `token`. Refused while another fetch is in
    /// flight unless `supersede` is set.
    Begin {
        token: FetchToken,
        stale_time: Duration,
        supersede: bool,
    },
    /// Store a value, if `token` is still the in-flight one.
    Resolve { token: FetchToken, value: QueryValue },
    /// Store an error, if `token` is still the in-flight one.
    Fail { token: FetchToken, error: Arc<Error> },
    /// Force the next access to treat the entry as stale.
    Invalidate,
}

impl EntryPatch {
    fn apply(self, entry: &mut CacheEntry, now: Instant) -> bool {
        match self {
            EntryPatch::Begin {
                token,
                stale_time,
                supersede,
            } => {
                if entry.in_flight.is_some() && !supersede {
                    return false;
                }
                entry.state = QueryState::Pending;
                entry.in_flight = Some(token);
                entry.stale_time = stale_time;
                entry.invalidated = false;
                true
            }
            EntryPatch::Resolve { token, value } => {
                if entry.in_flight != Some(token) {
                    return false;
                }
                entry.state = QueryState::Resolved(value);
                entry.fetched_at = Some(now);
                entry.in_flight = None;
                true
            }
            EntryPatch::Fail { token, error } => {
                if entry.in_flight != Some(token) {
                    return false;
                }
                entry.state = QueryState::Failed(error);
                entry.fetched_at = Some(now);
                entry.in_flight = None;
                true
            }
            EntryPatch::Invalidate => {
                if entry.invalidated {
                    return false;
                }
                entry.invalidated = true;
                true
            }
        }
    }
}

/// Shared, cheaply cloneable store of [`CacheEntry`] slots.
///
/// Every key owns a `watch` channel: mutating an entry and announcing the
/// change is one atomic step on that key, and keys never block each other.
/// Entries are created lazily and retained for the lifetime of the store.
///
/// # Example
///
/// ```
/// use query_kit::{CacheStore, QueryKey, QueryStatus};
/// use std::time::Duration;
///
/// let store = CacheStore::new();
/// let key = QueryKey::from(["hackathons", "all"]);
/// assert_eq!(store.get(&key).status(), QueryStatus::Idle);
/// assert!(store.is_stale(&key, Duration::from_secs(300)));
/// ```
#[derive(Clone, Default)]
pub struct CacheStore {
    entries: Arc<DashMap<QueryKey, watch::Sender<CacheEntry>>>,
    next_token: Arc<AtomicU64>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot<R>(&self, key: &QueryKey, f: impl FnOnce(&watch::Sender<CacheEntry>) -> R) -> R {
        if let Some(slot) = self.entries.get(key) {
            return f(slot.value());
        }
        let slot = self.entries.entry(key.clone()).or_insert_with(|| {
            trace!("Creating idle entry for {}", key);
            watch::channel(CacheEntry::default()).0
        });
        f(slot.value())
    }

    /// Snapshot of the entry for `key`, creating an idle one on first reference.
    pub fn get(&self, key: &QueryKey) -> CacheEntry {
        self.with_slot(key, |slot| slot.borrow().clone())
    }

    /// Snapshot of the entry for `key` without creating it.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|slot| slot.borrow().clone())
    }

    /// True unless the entry settled less than `stale_time` ago.
    pub fn is_stale(&self, key: &QueryKey, stale_time: Duration) -> bool {
        self.with_slot(key, |slot| {
            slot.borrow().is_stale_at(stale_time, Instant::now())
        })
    }

    /// Apply `patch` atomically. Returns whether the entry changed; receivers
    /// subscribed to `key` are notified only in that case.
    pub(crate) fn set(&self, key: &QueryKey, patch: EntryPatch) -> bool {
        let now = Instant::now();
        self.with_slot(key, |slot| {
            slot.send_if_modified(|entry| patch.apply(entry, now))
        })
    }

    /// Mark `key` stale so its next access re-fetches. Does not fetch.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let changed = self.set(key, EntryPatch::Invalidate);
        if changed {
            debug!("Invalidated {}", key);
        }
        changed
    }

    /// Receive a notification every time the entry for `key` changes.
    pub fn subscribe(&self, key: &QueryKey) -> watch::Receiver<CacheEntry> {
        self.with_slot(key, |slot| slot.subscribe())
    }

    /// Allocate a token no earlier fetch has used.
    pub(crate) fn next_token(&self) -> FetchToken {
        FetchToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Keys currently held, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|slot| slot.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
