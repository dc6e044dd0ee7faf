//! Derived views over cache entries.
//!
//! Derived computations are pure: they read snapshots and never touch the
//! store. [`Memo`] reuses the previous result while the inputs are the same
//! references, and [`Subscription`] wakes a consumer only when one of its
//! declared keys changes.

use crate::entry::{CacheEntry, QueryValue};
use crate::key::QueryKey;
use crate::store::CacheStore;
use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

/// Inputs of a memoized computation.
///
/// Cache values compare by reference, so a re-fetch that produced a new value
/// counts as a change even when the data is equal. Scalars (such as the
/// current user id) compare by value.
#[derive(Clone, Default)]
pub struct MemoInputs {
    values: Vec<Option<QueryValue>>,
    scalars: Vec<Option<String>>,
}

impl MemoInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Depend on the value currently held by `entry`.
    pub fn value(mut self, entry: &CacheEntry) -> Self {
        self.values.push(entry.value().cloned());
        self
    }

    pub fn scalar(mut self, scalar: Option<&str>) -> Self {
        self.scalars.push(scalar.map(str::to_string));
        self
    }
}

impl PartialEq for MemoInputs {
    fn eq(&self, other: &Self) -> bool {
        self.scalars == other.scalars
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                })
    }
}

/// Remembers the last output and the inputs it was computed from.
pub struct Memo<O> {
    last: Option<(MemoInputs, O)>,
    recomputations: usize,
}

impl<O> Default for Memo<O> {
    fn default() -> Self {
        Memo {
            last: None,
            recomputations: 0,
        }
    }
}

impl<O: Clone> Memo<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached output if `inputs` match the previous call,
    /// otherwise run `compute` and remember its result.
    pub fn get_or_compute(&mut self, inputs: MemoInputs, compute: impl FnOnce() -> O) -> O {
        if let Some((last_inputs, output)) = &self.last {
            if *last_inputs == inputs {
                return output.clone();
            }
        }
        let output = compute();
        self.recomputations += 1;
        self.last = Some((inputs, output.clone()));
        output
    }

    /// How many times `compute` actually ran.
    pub fn recomputations(&self) -> usize {
        self.recomputations
    }
}

/// Outcome of picking one element out of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<T> {
    Found(T),
    /// Nothing matched (or there was nothing to search).
    NoMatch,
}

impl<T> Selection<T> {
    pub fn found(&self) -> Option<&T> {
        match self {
            Selection::Found(item) => Some(item),
            Selection::NoMatch => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Selection::Found(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Selection::Found(item) => Some(item),
            Selection::NoMatch => None,
        }
    }
}

/// First element of `items` satisfying `predicate`.
pub fn select_first<T: Clone>(items: &[T], predicate: impl Fn(&T) -> bool) -> Selection<T> {
    items
        .iter()
        .find(|item| predicate(item))
        .cloned()
        .map_or(Selection::NoMatch, Selection::Found)
}

/// Change notifications for a declared set of keys.
pub struct Subscription {
    keys: Vec<QueryKey>,
    receivers: Vec<watch::Receiver<CacheEntry>>,
}

impl Subscription {
    pub fn new(store: &CacheStore, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        let keys: Vec<QueryKey> = keys.into_iter().collect();
        let receivers = keys.iter().map(|key| store.subscribe(key)).collect();
        Subscription { keys, receivers }
    }

    pub fn keys(&self) -> &[QueryKey] {
        &self.keys
    }

    /// Current snapshots, in key order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.receivers.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Wait until any subscribed entry changes. Returns `false` immediately
    /// when nothing is subscribed.
    pub async fn changed(&mut self) -> bool {
        if self.receivers.is_empty() {
            return false;
        }
        let (result, index, _) =
            select_all(self.receivers.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
        trace!("Subscribed key {} changed", self.keys[index]);
        result.is_ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("keys", &self.keys).finish()
    }
}
