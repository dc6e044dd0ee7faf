//! Queries gated on the current identity.
//!
//! A dependent query has no descriptor until an identity is present, so it
//! cannot reach the runner, let alone the network, while blocked. The
//! coordinator only reads the identity provider; it never writes it and owns
//! no cache state.

use crate::descriptor::QueryDescriptor;
use crate::entry::{CacheEntry, QueryStatus};
use crate::runner::QueryRunner;
use crate::store::CacheStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// The signed-in user, as handed over by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    #[serde(alias = "$id")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>) -> Self {
        CurrentUser {
            id: id.into(),
            username: None,
            email: None,
        }
    }
}

/// What the identity provider currently knows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityState {
    pub user: Option<CurrentUser>,
    /// The provider is still working out who the user is.
    pub is_resolving: bool,
}

impl IdentityState {
    pub fn resolving() -> Self {
        IdentityState {
            user: None,
            is_resolving: true,
        }
    }

    pub fn signed_in(user: CurrentUser) -> Self {
        IdentityState {
            user: Some(user),
            is_resolving: false,
        }
    }

    pub fn signed_out() -> Self {
        IdentityState::default()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    pub fn is_present(&self) -> bool {
        self.user.is_some()
    }
}

/// Read-only handle on the identity provider.
#[derive(Debug, Clone)]
pub struct IdentitySource(watch::Receiver<IdentityState>);

impl IdentitySource {
    pub fn new(receiver: watch::Receiver<IdentityState>) -> Self {
        IdentitySource(receiver)
    }

    /// Source that never changes, for consumers without a live provider.
    pub fn fixed(state: IdentityState) -> Self {
        let (_, receiver) = watch::channel(state);
        IdentitySource(receiver)
    }

    pub fn current(&self) -> IdentityState {
        self.0.borrow().clone()
    }

    /// Wait for the next identity change. `false` once the provider is gone.
    pub async fn changed(&mut self) -> bool {
        self.0.changed().await.is_ok()
    }
}

/// Create a provider/source pair. The sender side belongs to whatever
/// acquires identities (login flow, token refresh).
pub fn identity_channel(initial: IdentityState) -> (watch::Sender<IdentityState>, IdentitySource) {
    let (sender, receiver) = watch::channel(initial);
    (sender, IdentitySource(receiver))
}

/// Where a dependent query stands for the current identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentState {
    /// No identity; the query must not run.
    Blocked,
    /// Identity present; the runner owns the query (idle or pending).
    Runnable,
    Resolved,
    Failed,
}

impl fmt::Display for DependentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependentState::Blocked => write!(f, "blocked"),
            DependentState::Runnable => write!(f, "runnable"),
            DependentState::Resolved => write!(f, "resolved"),
            DependentState::Failed => write!(f, "failed"),
        }
    }
}

type DescriptorFactory = Arc<dyn Fn(&CurrentUser) -> QueryDescriptor + Send + Sync>;

/// A query that can only be described once a user is known.
#[derive(Clone)]
pub struct DependentQuery {
    name: String,
    factory: DescriptorFactory,
}

impl DependentQuery {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&CurrentUser) -> QueryDescriptor + Send + Sync + 'static,
    {
        DependentQuery {
            name: name.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The descriptor for `identity`, or `None` while blocked.
    pub fn descriptor_for(&self, identity: &IdentityState) -> Option<QueryDescriptor> {
        identity.user.as_ref().map(|user| (self.factory)(user))
    }

    /// Entry backing this query for `identity`, if it is not blocked.
    pub fn entry(&self, identity: &IdentityState, store: &CacheStore) -> Option<CacheEntry> {
        let descriptor = self.descriptor_for(identity)?;
        Some(store.peek(&descriptor.key).unwrap_or_default())
    }

    pub fn state(&self, identity: &IdentityState, store: &CacheStore) -> DependentState {
        match self.entry(identity, store) {
            None => DependentState::Blocked,
            Some(entry) => match entry.status() {
                QueryStatus::Resolved => DependentState::Resolved,
                QueryStatus::Failed => DependentState::Failed,
                QueryStatus::Idle | QueryStatus::Pending => DependentState::Runnable,
            },
        }
    }
}

impl fmt::Debug for DependentQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentQuery")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Runs a set of dependent queries as the identity comes and goes.
#[derive(Debug, Clone)]
pub struct DependentQueries {
    runner: QueryRunner,
    identity: IdentitySource,
    queries: Vec<DependentQuery>,
}

impl DependentQueries {
    pub fn new(runner: QueryRunner, identity: IdentitySource) -> Self {
        DependentQueries {
            runner,
            identity,
            queries: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: DependentQuery) -> Self {
        self.queries.push(query);
        self
    }

    pub fn identity(&self) -> IdentityState {
        self.identity.current()
    }

    pub fn get(&self, name: &str) -> Option<&DependentQuery> {
        self.queries.iter().find(|q| q.name == name)
    }

    /// Trigger every query that is runnable for the current identity.
    pub fn sync(&self) -> Vec<(String, DependentState)> {
        let identity = self.identity.current();
        self.queries
            .iter()
            .map(|query| {
                if let Some(descriptor) = query.descriptor_for(&identity) {
                    self.runner.trigger(&descriptor);
                } else {
                    trace!("Dependent query {} blocked: no identity", query.name);
                }
                (
                    query.name.clone(),
                    query.state(&identity, self.runner.store()),
                )
            })
            .collect()
    }

    pub fn states(&self) -> Vec<(String, DependentState)> {
        let identity = self.identity.current();
        self.queries
            .iter()
            .map(|q| (q.name.clone(), q.state(&identity, self.runner.store())))
            .collect()
    }

    /// Sync now and again after every identity change, until the provider
    /// is dropped.
    pub async fn watch_identity(&mut self) {
        loop {
            self.sync();
            if !self.identity.changed().await {
                debug!("Identity provider closed, dependent queries stop following it");
                return;
            }
            debug!(
                "Identity changed to {:?}, re-syncing dependent queries",
                self.identity.current().user_id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::QueryKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn teams_query(calls: Arc<AtomicUsize>, gate: Arc<Notify>) -> DependentQuery {
        DependentQuery::new("teams", move |user: &CurrentUser| {
            let calls = calls.clone();
            let gate = gate.clone();
            let id = user.id.clone();
            QueryDescriptor::builder(QueryKey::from(["teams"]).with(user.id.as_str()))
                .fetch_typed(move || {
                    let calls = calls.clone();
                    let gate = gate.clone();
                    let id = id.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(format!("team of {}", id))
                    }
                })
                .stale_time(Duration::from_secs(300))
                .build()
                .expect("Failed to build")
        })
    }

    #[tokio::test]
    async fn test_blocked_query_never_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_provider, identity) = identity_channel(IdentityState::resolving());
        let runner = QueryRunner::default();
        let coordinator = DependentQueries::new(runner.clone(), identity)
            .with_query(teams_query(calls.clone(), Arc::new(Notify::new())));

        let states = coordinator.sync();
        assert_eq!(states, vec![("teams".to_string(), DependentState::Blocked)]);
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(runner.store().is_empty());
    }

    #[tokio::test]
    async fn test_identity_unblocks_query() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (provider, identity) = identity_channel(IdentityState::resolving());
        let runner = QueryRunner::default();
        let coordinator = DependentQueries::new(runner.clone(), identity)
            .with_query(teams_query(calls.clone(), gate.clone()));

        coordinator.sync();
        provider
            .send(IdentityState::signed_in(CurrentUser::new("u1")))
            .expect("source dropped");

        let states = coordinator.sync();
        assert_eq!(states[0].1, DependentState::Runnable);

        gate.notify_one();
        let entry = runner.settled(&QueryKey::from(["teams", "u1"])).await;
        assert_eq!(entry.value_as::<String>().expect("resolved").as_str(), "team of u1");
        assert_eq!(coordinator.states()[0].1, DependentState::Resolved);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identity_change_keeps_results_apart() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (provider, identity) = identity_channel(IdentityState::signed_in(CurrentUser::new("u1")));
        let runner = QueryRunner::default();
        let coordinator = DependentQueries::new(runner.clone(), identity)
            .with_query(teams_query(calls.clone(), gate.clone()));

        coordinator.sync();
        provider
            .send(IdentityState::signed_in(CurrentUser::new("u2")))
            .expect("source dropped");
        coordinator.sync();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Let both fetches start, then finish them one at a time.
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        tokio::task::yield_now().await;
        gate.notify_one();

        let u2 = runner.settled(&QueryKey::from(["teams", "u2"])).await;
        let u1 = runner.settled(&QueryKey::from(["teams", "u1"])).await;
        assert_eq!(u2.value_as::<String>().expect("resolved").as_str(), "team of u2");
        assert_eq!(u1.value_as::<String>().expect("resolved").as_str(), "team of u1");

        let current = coordinator
            .get("teams")
            .expect("registered")
            .entry(&coordinator.identity(), runner.store())
            .expect("not blocked");
        assert_eq!(current.value_as::<String>().expect("resolved").as_str(), "team of u2");
    }

    #[tokio::test]
    async fn test_watch_identity_follows_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (provider, identity) = identity_channel(IdentityState::resolving());
        let runner = QueryRunner::default();
        let mut coordinator = DependentQueries::new(runner.clone(), identity)
            .with_query(teams_query(calls.clone(), gate.clone()));

        let watcher = tokio::spawn(async move { coordinator.watch_identity().await });

        provider
            .send(IdentityState::signed_in(CurrentUser::new("u7")))
            .expect("source dropped");
        gate.notify_one();
        while runner.store().peek(&QueryKey::from(["teams", "u7"])).is_none() {
            tokio::task::yield_now().await;
        }
        let entry = runner.settled(&QueryKey::from(["teams", "u7"])).await;
        assert!(entry.is_resolved());

        drop(provider);
        watcher.await.expect("watcher panicked");
    }
}
