//! Query runner - executes descriptors against the store.

use crate::descriptor::QueryDescriptor;
use crate::entry::{CacheEntry, FetchToken, QueryValue};
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::observability::{NoOpMetrics, QueryMetrics, StalePolicy};
use crate::store::{CacheStore, EntryPatch};
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Resolves once the fetch it belongs to has written (or discarded) its result.
type CompletionChannel = Shared<oneshot::Receiver<()>>;

struct InFlight {
    token: FetchToken,
    done: CompletionChannel,
}

/// Executes [`QueryDescriptor`]s with single-flight deduplication.
///
/// At most one fetch runs per key. Callers arriving while it is pending
/// attach to it instead of starting another. Fetches are spawned on the
/// current tokio runtime, so the runner must be used from within one.
///
/// # Example
///
/// ```
/// use query_kit::{QueryDescriptor, QueryKey, QueryRunner};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let runner = QueryRunner::default();
/// let descriptor = QueryDescriptor::builder(QueryKey::from(["hackathons", "all"]))
///     .fetch_typed(|| async { Ok(vec!["hack-1".to_string()]) })
///     .build()
///     .expect("fetch procedure set");
///
/// let entry = runner.run(&descriptor).await;
/// assert_eq!(entry.value_as::<Vec<String>>().expect("resolved").len(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct QueryRunner {
    store: CacheStore,
    in_flight: Arc<DashMap<QueryKey, InFlight>>,
    metrics: Arc<dyn QueryMetrics>,
    stale_policy: Arc<StalePolicy>,
}

impl Default for QueryRunner {
    fn default() -> Self {
        Self::new(CacheStore::new())
    }
}

impl QueryRunner {
    /// Create a runner writing into `store`.
    pub fn new(store: CacheStore) -> Self {
        QueryRunner {
            store,
            in_flight: Arc::new(DashMap::new()),
            metrics: Arc::new(NoOpMetrics),
            stale_policy: Arc::new(StalePolicy::default()),
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the staleness policy for descriptors without their own window.
    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = Arc::new(policy);
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    fn stale_time_for(&self, descriptor: &QueryDescriptor) -> Duration {
        descriptor
            .stale_time
            .unwrap_or_else(|| self.stale_policy.stale_time_for(&descriptor.key))
    }

    /// Start a fetch if the query is enabled, stale and not already in flight.
    ///
    /// Returns the entry as it stands right after the decision, without waiting
    /// for the fetch. This is not `async` so the fetch is spawned eagerly even
    /// if the caller never awaits anything.
    pub fn trigger(&self, descriptor: &QueryDescriptor) -> CacheEntry {
        let key = &descriptor.key;

        if !descriptor.enabled {
            trace!("Query {} disabled, not fetching", key);
            return self.store.get(key);
        }

        let stale_time = self.stale_time_for(descriptor);
        let entry = self.store.get(key);

        if entry.in_flight().is_some() {
            debug!("» Query {} already in flight, attaching", key);
            self.metrics.record_deduplicated(key);
            return entry;
        }

        if !entry.is_stale_at(stale_time, Instant::now()) {
            debug!("✓ Query {} is fresh ({})", key, entry.status());
            self.metrics.record_fresh(key);
            return entry;
        }

        self.start(descriptor, stale_time, false)
    }

    /// Run the query and wait until its entry settles.
    ///
    /// Disabled queries return the current entry immediately. When a fetch is
    /// already in flight this attaches to it rather than starting another.
    pub async fn run(&self, descriptor: &QueryDescriptor) -> CacheEntry {
        let entry = self.trigger(descriptor);
        if !descriptor.enabled {
            return entry;
        }
        self.settled(&descriptor.key).await
    }

    /// Start a new fetch regardless of staleness, superseding any fetch in
    /// flight for the key. The superseded fetch's result is discarded when it
    /// arrives. Disabled queries are still never fetched.
    pub fn refetch(&self, descriptor: &QueryDescriptor) -> CacheEntry {
        if !descriptor.enabled {
            trace!("Query {} disabled, not refetching", descriptor.key);
            return self.store.get(&descriptor.key);
        }
        let stale_time = self.stale_time_for(descriptor);
        self.start(descriptor, stale_time, true)
    }

    /// Mark `key` stale; the next `trigger` or `run` fetches again.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.store.invalidate(key)
    }

    /// Wait until no fetch is in flight for `key`, then return its entry.
    ///
    /// Follows supersession: if a newer fetch replaces the one being awaited,
    /// the wait moves on to the newer one. A fetch whose task died without
    /// completing is failed here so the key does not stay pending.
    pub async fn settled(&self, key: &QueryKey) -> CacheEntry {
        let mut updates = self.store.subscribe(key);
        loop {
            let current = self.in_flight.get(key).map(|f| (f.token, f.done.clone()));
            match current {
                Some((token, done)) => {
                    tokio::select! {
                        finished = done => {
                            if finished.is_err() {
                                self.abandon(key, token);
                            }
                        }
                        // Re-read the in-flight record after every entry change.
                        _ = updates.changed() => {}
                    }
                }
                None => {
                    let entry = updates.borrow_and_update().clone();
                    if entry.in_flight().is_none() {
                        return entry;
                    }
                    // Begin was recorded but the completion channel is not registered yet.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn start(&self, descriptor: &QueryDescriptor, stale_time: Duration, supersede: bool) -> CacheEntry {
        let key = descriptor.key.clone();
        let token = self.store.next_token();

        let begun = self.store.set(
            &key,
            EntryPatch::Begin {
                token,
                stale_time,
                supersede,
            },
        );
        if !begun {
            // Another caller began a fetch between our check and now.
            debug!("» Query {} already in flight, attaching", key);
            self.metrics.record_deduplicated(&key);
            return self.store.get(&key);
        }

        let (sender, receiver) = oneshot::channel();
        self.in_flight.insert(
            key.clone(),
            InFlight {
                token,
                done: receiver.shared(),
            },
        );

        info!("» Fetching {} (token {}, stale after {:?})", key, token, stale_time);
        self.metrics.record_fetch_started(&key);

        let fetch = match panic::catch_unwind(AssertUnwindSafe(|| (descriptor.fetch)())) {
            Ok(fetch) => fetch,
            Err(payload) => {
                let error = Error::FetchAborted(format!(
                    "fetch procedure for {} panicked: {}",
                    key,
                    panic_message(&*payload)
                ));
                self.complete(&key, token, Err(error), Duration::ZERO);
                sender.send(()).ok();
                return self.store.get(&key);
            }
        };
        let runner = self.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = match AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(Error::FetchAborted(format!(
                    "fetch for {} panicked: {}",
                    task_key,
                    panic_message(&*payload)
                ))),
            };
            runner.complete(&task_key, token, result, started.elapsed());
            sender.send(()).ok();
        });

        self.store.get(&key)
    }

    fn complete(&self, key: &QueryKey, token: FetchToken, result: Result<QueryValue>, elapsed: Duration) {
        let applied = match result {
            Ok(value) => {
                let applied = self.store.set(key, EntryPatch::Resolve { token, value });
                if applied {
                    self.metrics.record_success(key, elapsed);
                    info!("✓ Query {} resolved in {:?}", key, elapsed);
                }
                applied
            }
            Err(e) => {
                let error = Arc::new(e);
                let applied = self.store.set(
                    key,
                    EntryPatch::Fail {
                        token,
                        error: error.clone(),
                    },
                );
                if applied {
                    self.metrics.record_failure(key, &error);
                    warn!("✗ Query {} failed after {:?}: {}", key, elapsed, error);
                }
                applied
            }
        };

        if !applied {
            debug!("Discarding result of superseded fetch {} for {}", token, key);
            self.metrics.record_discarded(key);
        }

        self.in_flight.remove_if(key, |_, f| f.token == token);
    }

    /// Fail a fetch whose completion channel closed without a result.
    fn abandon(&self, key: &QueryKey, token: FetchToken) {
        if self.store.get(key).in_flight() == Some(token) {
            warn!("Fetch {} for {} ended without an outcome", token, key);
            let error = Error::FetchAborted(format!("fetch task for {} was cancelled", key));
            self.complete(key, token, Err(error), Duration::ZERO);
        } else {
            self.in_flight.remove_if(key, |_, f| f.token == token);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl std::fmt::Debug for QueryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRunner")
            .field("store", &self.store)
            .field("in_flight", &self.in_flight.len())
            .field("stale_policy", &self.stale_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::QueryStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn key() -> QueryKey {
        QueryKey::from(["hackathons", "all"])
    }

    /// Descriptor whose fetch counts calls and waits on `gate` before answering.
    fn gated(calls: Arc<AtomicUsize>, gate: Arc<Notify>, result: Result<u32>) -> QueryDescriptor {
        QueryDescriptor::builder(key())
            .fetch_typed(move || {
                let calls = calls.clone();
                let gate = gate.clone();
                let result = result.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    result
                }
            })
            .stale_time(Duration::from_secs(60))
            .build()
            .expect("Failed to build")
    }

    fn counting(calls: Arc<AtomicUsize>, result: Result<u32>) -> QueryDescriptor {
        QueryDescriptor::builder(key())
            .fetch_typed(move || {
                let calls = calls.clone();
                let result = result.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    result
                }
            })
            .stale_time(Duration::from_secs(60))
            .build()
            .expect("Failed to build")
    }

    #[derive(Default)]
    struct TestMetrics {
        started: AtomicUsize,
        deduplicated: AtomicUsize,
        discarded: AtomicUsize,
    }

    impl QueryMetrics for TestMetrics {
        fn record_fetch_started(&self, _key: &QueryKey) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn record_deduplicated(&self, _key: &QueryKey) {
            self.deduplicated.fetch_add(1, Ordering::SeqCst);
        }

        fn record_discarded(&self, _key: &QueryKey) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_issue_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let descriptor = gated(calls.clone(), gate.clone(), Ok(7));
        let runner = QueryRunner::default();

        let release = async {
            tokio::task::yield_now().await;
            gate.notify_one();
        };
        let (a, b, ()) = tokio::join!(runner.run(&descriptor), runner.run(&descriptor), release);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*a.value_as::<u32>().expect("resolved"), 7);
        assert!(Arc::ptr_eq(
            a.value().expect("resolved"),
            b.value().expect("resolved")
        ));
    }

    #[tokio::test]
    async fn test_trigger_while_pending_attaches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let descriptor = gated(calls.clone(), gate.clone(), Ok(1));
        let metrics = Arc::new(TestMetrics::default());
        let runner = QueryRunner::default().with_metrics(metrics.clone());

        let first = runner.trigger(&descriptor);
        let second = runner.trigger(&descriptor);
        assert_eq!(first.status(), QueryStatus::Pending);
        assert_eq!(first.in_flight(), second.in_flight());

        gate.notify_one();
        let entry = runner.settled(&key()).await;
        assert!(entry.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.started.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.deduplicated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_not_refetched_until_stale() {
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = counting(calls.clone(), Ok(1));
        let runner = QueryRunner::default();

        runner.run(&descriptor).await;
        assert!(!runner.store().is_stale(&key(), Duration::from_secs(60)));

        runner.run(&descriptor).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(runner.store().is_stale(&key(), Duration::from_secs(60)));

        runner.run(&descriptor).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_query_never_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = QueryDescriptor {
            enabled: false,
            ..counting(calls.clone(), Ok(1))
        };
        let runner = QueryRunner::default();

        assert_eq!(runner.trigger(&descriptor).status(), QueryStatus::Idle);
        assert_eq!(runner.run(&descriptor).await.status(), QueryStatus::Idle);
        assert_eq!(runner.refetch(&descriptor).status(), QueryStatus::Idle);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_respects_stale_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = counting(
            calls.clone(),
            Err(Error::NetworkError("Failed to load hackathons".to_string())),
        );
        let runner = QueryRunner::default();

        let entry = runner.run(&descriptor).await;
        assert!(entry.is_failed());
        assert!(entry.error().expect("missing error").is_network());
        assert!(entry.fetched_at().is_some());

        // No retry loop: a failed entry waits for its window like a resolved one.
        runner.run(&descriptor).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        runner.run(&descriptor).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_superseded_result_is_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let old_gate = Arc::new(Notify::new());
        let new_gate = Arc::new(Notify::new());
        let descriptor = {
            let calls = calls.clone();
            let old_gate = old_gate.clone();
            let new_gate = new_gate.clone();
            QueryDescriptor::builder(key())
                .fetch_typed(move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    let (gate, value) = if n == 0 {
                        (old_gate.clone(), "old")
                    } else {
                        (new_gate.clone(), "new")
                    };
                    async move {
                        gate.notified().await;
                        Ok(value.to_string())
                    }
                })
                .build()
                .expect("Failed to build")
        };
        let metrics = Arc::new(TestMetrics::default());
        let runner = QueryRunner::default().with_metrics(metrics.clone());

        let old = runner.trigger(&descriptor);
        let new = runner.refetch(&descriptor);
        assert!(new.in_flight() > old.in_flight());

        new_gate.notify_one();
        let entry = runner.settled(&key()).await;
        assert_eq!(entry.value_as::<String>().expect("resolved").as_str(), "new");

        old_gate.notify_one();
        while metrics.discarded.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let entry = runner.store().get(&key());
        assert_eq!(entry.value_as::<String>().expect("resolved").as_str(), "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = counting(calls.clone(), Ok(1));
        let runner = QueryRunner::default();

        runner.run(&descriptor).await;
        assert!(runner.invalidate(&key()));
        let entry = runner.run(&descriptor).await;
        assert!(entry.is_resolved());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_stay_local_to_their_key() {
        let runner = QueryRunner::default();
        let failing = QueryDescriptor::builder(QueryKey::from(["teams", "u1"]))
            .fetch_typed(|| async { Err::<u32, _>(Error::DecodeError("bad body".to_string())) })
            .build()
            .expect("Failed to build");
        let ok = QueryDescriptor::builder(key())
            .fetch_typed(|| async { Ok(3u32) })
            .build()
            .expect("Failed to build");

        let (failed, resolved) = tokio::join!(runner.run(&failing), runner.run(&ok));
        assert!(failed.is_failed());
        assert!(resolved.is_resolved());
    }

    #[tokio::test]
    async fn test_policy_supplies_missing_stale_time() {
        let runner = QueryRunner::default()
            .with_stale_policy(StalePolicy::Fixed(Duration::from_secs(42)));
        let descriptor = QueryDescriptor::builder(key())
            .fetch_typed(|| async { Ok(1u32) })
            .build()
            .expect("Failed to build");

        let entry = runner.run(&descriptor).await;
        assert_eq!(entry.stale_time(), Duration::from_secs(42));
    }

    #[tokio::test]
    async fn test_panicking_fetch_fails_and_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let descriptor = {
            let calls = calls.clone();
            QueryDescriptor::builder(key())
                .fetch_typed(move || {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("decoder blew up");
                        }
                        Ok(5u32)
                    }
                })
                .build()
                .expect("Failed to build")
        };
        let runner = QueryRunner::default();

        let entry = tokio::time::timeout(Duration::from_secs(5), runner.run(&descriptor))
            .await
            .expect("settled must not hang after a panic");
        assert!(entry.is_failed());
        assert!(entry.error().expect("missing error").is_aborted());
        assert!(entry.in_flight().is_none());

        assert!(runner.invalidate(&key()));
        let entry = runner.run(&descriptor).await;
        assert_eq!(*entry.value_as::<u32>().expect("resolved"), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_fetch_procedure_fails_entry() {
        let descriptor = QueryDescriptor::builder(key())
            .fetch(|| -> futures::future::Ready<Result<QueryValue>> {
                panic!("no future for you")
            })
            .build()
            .expect("Failed to build");
        let runner = QueryRunner::default();

        let entry = runner.trigger(&descriptor);
        assert!(entry.is_failed());
        assert!(entry.in_flight().is_none());

        let entry = tokio::time::timeout(Duration::from_secs(5), runner.settled(&key()))
            .await
            .expect("settled must not hang");
        assert!(entry.error().expect("missing error").is_aborted());
    }

    #[tokio::test]
    async fn test_settled_follows_refetch_past_hung_fetch() {
        let hung = gated(
            Arc::new(AtomicUsize::new(0)),
            Arc::new(Notify::new()),
            Ok(1),
        );
        let quick = counting(Arc::new(AtomicUsize::new(0)), Ok(2));
        let runner = QueryRunner::default();

        runner.trigger(&hung);
        let replace = async {
            tokio::task::yield_now().await;
            runner.refetch(&quick);
        };
        let k = key();
        let (entry, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(runner.settled(&k), replace) },
        )
        .await
        .expect("waiter must follow the newer fetch");

        assert_eq!(*entry.value_as::<u32>().expect("resolved"), 2);
    }
}
