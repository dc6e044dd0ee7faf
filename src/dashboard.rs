//! The dashboard: three composed queries and the view derived from them.
//!
//! | Source                  | Key                          | Runs when        |
//! |-------------------------|------------------------------|------------------|
//! | all hackathons          | `hackathons:all`             | always           |
//! | the user's hackathons   | `hackathons:user:{id}`       | identity present |
//! | the user's teams        | `teams:{id}`                 | identity present |
//!
//! The three fetches are issued together and may complete in any order.

use crate::config::DashboardConfig;
use crate::dependent::{DependentQueries, DependentQuery, IdentitySource, IdentityState};
use crate::derived::{select_first, Memo, MemoInputs, Selection, Subscription};
use crate::descriptor::{FetchFn, QueryDescriptor};
use crate::entry::{CacheEntry, QueryValue};
use crate::key::QueryKey;
use crate::models::{decode, DocumentList, Hackathon, Team, UserHackathons};
use crate::runner::QueryRunner;
use crate::transport::Transport;
use futures::future::{join_all, FutureExt};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

pub const ALL_HACKATHONS_PATH: &str = "/hackathons";

const MY_HACKATHONS: &str = "my_hackathons";
const TEAMS: &str = "teams";

pub fn user_hackathons_path(user_id: &str) -> String {
    format!("/users/{}/hackathons", user_id)
}

/// `/teams?user_id={id}`, or every team when no id is given.
pub fn teams_path(user_id: Option<&str>) -> String {
    match user_id {
        Some(id) => format!("/teams?user_id={}", id),
        None => "/teams".to_string(),
    }
}

pub fn all_hackathons_key() -> QueryKey {
    QueryKey::from(["hackathons", "all"])
}

pub fn user_hackathons_key(user_id: Option<&str>) -> QueryKey {
    QueryKey::from(["hackathons", "user"]).with_opt(user_id)
}

pub fn teams_key(user_id: Option<&str>) -> QueryKey {
    QueryKey::from(["teams"]).with_opt(user_id)
}

/// Descriptor fetching `path`, decoding the envelope `E` and keeping the list
/// `extract` pulls out of it.
fn list_query<T, E, X>(
    key: QueryKey,
    transport: Arc<T>,
    path: String,
    stale_time: Duration,
    extract: fn(E) -> Vec<X>,
) -> QueryDescriptor
where
    T: Transport,
    E: DeserializeOwned + Send + 'static,
    X: Send + Sync + 'static,
{
    let fetch: FetchFn = Arc::new(move || {
        let transport = transport.clone();
        let path = path.clone();
        async move {
            let body = transport.fetch_json(&path).await?;
            let envelope: E = decode(&path, body)?;
            Ok(Arc::new(extract(envelope)) as QueryValue)
        }
        .boxed()
    });
    QueryDescriptor {
        key,
        fetch,
        enabled: true,
        stale_time: Some(stale_time),
    }
}

/// `GET /hackathons`, stored as `Vec<Hackathon>`.
pub fn all_hackathons_query<T: Transport>(transport: Arc<T>, stale_time: Duration) -> QueryDescriptor {
    list_query(
        all_hackathons_key(),
        transport,
        ALL_HACKATHONS_PATH.to_string(),
        stale_time,
        |list: DocumentList<Hackathon>| list.documents,
    )
}

/// `GET /users/{id}/hackathons`, stored as `Vec<Hackathon>`.
pub fn user_hackathons_query<T: Transport>(
    transport: Arc<T>,
    user_id: &str,
    stale_time: Duration,
) -> QueryDescriptor {
    list_query(
        user_hackathons_key(Some(user_id)),
        transport,
        user_hackathons_path(user_id),
        stale_time,
        |mine: UserHackathons| mine.hackathons,
    )
}

/// `GET /teams[?user_id=]`, stored as `Vec<Team>`. Enabled only with a user id.
pub fn teams_query<T: Transport>(
    transport: Arc<T>,
    user_id: Option<&str>,
    stale_time: Duration,
) -> QueryDescriptor {
    let mut descriptor = list_query(
        teams_key(user_id),
        transport,
        teams_path(user_id),
        stale_time,
        |list: DocumentList<Team>| list.documents,
    );
    descriptor.enabled = user_id.is_some();
    descriptor
}

/// Consumer-facing flags, computed from the identity and the three entries.
///
/// `mine` and `teams` are `None` while their queries are blocked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DashboardStatus {
    /// Identity still resolving, the global list outstanding, or the user's
    /// list outstanding once there is a user.
    pub is_loading: bool,
    /// A user is present and their team query has neither a value nor an error.
    pub is_teams_loading: bool,
    /// The global list failed. Dependent failures never set this.
    pub is_error: bool,
}

impl DashboardStatus {
    pub fn compute(
        identity: &IdentityState,
        all: &CacheEntry,
        mine: Option<&CacheEntry>,
        teams: Option<&CacheEntry>,
    ) -> Self {
        let present = identity.is_present();
        DashboardStatus {
            is_loading: identity.is_resolving
                || all.is_loading(true)
                || mine.map_or(false, |e| e.is_loading(present)),
            is_teams_loading: teams.map_or(false, |e| present && !e.is_settled()),
            is_error: all.is_failed(),
        }
    }
}

/// Read-only view handed to pages.
#[derive(Debug, Clone)]
pub struct DashboardSnapshot {
    pub all_hackathons: Arc<Vec<Hackathon>>,
    pub my_hackathons: Arc<Vec<Hackathon>>,
    /// The first team listing the current user as a member.
    pub my_team: Selection<Team>,
    pub is_loading: bool,
    pub is_teams_loading: bool,
    pub is_error: bool,
}

/// Keys the view depends on for `identity`.
fn dependency_keys(identity: &IdentityState) -> Vec<QueryKey> {
    let mut keys = vec![all_hackathons_key()];
    if let Some(id) = identity.user_id() {
        keys.push(user_hackathons_key(Some(id)));
        keys.push(teams_key(Some(id)));
    }
    keys
}

enum Wake {
    Entry(bool),
    Identity(bool),
}

/// Runs the dashboard queries and derives [`DashboardSnapshot`]s from them.
///
/// # Example
///
/// ```
/// use query_kit::dependent::{identity_channel, CurrentUser, IdentityState};
/// use query_kit::transport::InMemoryTransport;
/// use query_kit::{Dashboard, DashboardConfig, QueryRunner};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let transport = InMemoryTransport::new();
/// transport.respond("/hackathons", json!({ "documents": [{ "$id": "h1", "name": "Hack" }] }));
/// transport.respond("/users/u1/hackathons", json!({ "hackathons": [] }));
/// transport.respond("/teams?user_id=u1", json!({ "documents": [{ "$id": "t1", "members": ["u1"] }] }));
///
/// let (_provider, identity) = identity_channel(IdentityState::signed_in(CurrentUser::new("u1")));
/// let mut dashboard = Dashboard::new(
///     QueryRunner::default(),
///     Arc::new(transport),
///     identity,
///     &DashboardConfig::default(),
/// );
///
/// let snapshot = dashboard.load().await;
/// assert_eq!(snapshot.all_hackathons.len(), 1);
/// assert_eq!(snapshot.my_team.found().map(|t| t.id.as_str()), Some("t1"));
/// assert!(!snapshot.is_loading);
/// # }
/// ```
pub struct Dashboard {
    runner: QueryRunner,
    identity: IdentitySource,
    all_hackathons: QueryDescriptor,
    dependents: DependentQueries,
    subscription: Subscription,
    subscribed_user: Option<String>,
    my_team: Memo<Selection<Team>>,
    empty: Arc<Vec<Hackathon>>,
}

impl Dashboard {
    pub fn new<T: Transport>(
        runner: QueryRunner,
        transport: Arc<T>,
        identity: IdentitySource,
        config: &DashboardConfig,
    ) -> Self {
        let stale_time = config.stale_time;

        let mine = {
            let transport = transport.clone();
            DependentQuery::new(MY_HACKATHONS, move |user| {
                user_hackathons_query(transport.clone(), &user.id, stale_time)
            })
        };
        let teams = {
            let transport = transport.clone();
            DependentQuery::new(TEAMS, move |user| {
                teams_query(transport.clone(), Some(user.id.as_str()), stale_time)
            })
        };

        let dependents = DependentQueries::new(runner.clone(), identity.clone())
            .with_query(mine)
            .with_query(teams);

        let current = identity.current();
        let subscription = Subscription::new(runner.store(), dependency_keys(&current));

        Dashboard {
            all_hackathons: all_hackathons_query(transport, stale_time),
            runner,
            identity,
            dependents,
            subscription,
            subscribed_user: current.user_id().map(str::to_string),
            my_team: Memo::new(),
            empty: Arc::new(Vec::new()),
        }
    }

    /// Dashboard over HTTP against `config.api_url`, with a fresh cache.
    #[cfg(feature = "http")]
    pub fn over_http(config: &DashboardConfig, identity: IdentitySource) -> Self {
        let transport = crate::transport::HttpTransport::new(config.api_url.clone());
        Self::new(QueryRunner::default(), Arc::new(transport), identity, config)
    }

    pub fn runner(&self) -> &QueryRunner {
        &self.runner
    }

    pub fn identity(&self) -> IdentityState {
        self.identity.current()
    }

    /// Trigger every enabled query without waiting. Stale or missing entries
    /// are fetched concurrently; fresh ones are left alone.
    pub fn refresh(&self) {
        debug!("» Refreshing dashboard for {:?}", self.identity.current().user_id());
        self.runner.trigger(&self.all_hackathons);
        self.dependents.sync();
    }

    /// Mark every dashboard entry stale and re-fetch the enabled ones.
    pub fn invalidate(&self) {
        for key in dependency_keys(&self.identity.current()) {
            self.runner.invalidate(&key);
        }
        self.refresh();
    }

    /// Refresh, wait for every enabled query to settle, and snapshot.
    pub async fn load(&mut self) -> DashboardSnapshot {
        self.refresh();
        let keys = dependency_keys(&self.identity.current());
        join_all(keys.iter().map(|key| self.runner.settled(key))).await;
        self.snapshot()
    }

    /// Entries backing the view: global list, then the dependent ones
    /// (`None` while blocked).
    fn entries(&self, identity: &IdentityState) -> (CacheEntry, Option<CacheEntry>, Option<CacheEntry>) {
        let store = self.runner.store();
        let all = store.peek(&self.all_hackathons.key).unwrap_or_default();
        let mine = self
            .dependents
            .get(MY_HACKATHONS)
            .and_then(|q| q.entry(identity, store));
        let teams = self
            .dependents
            .get(TEAMS)
            .and_then(|q| q.entry(identity, store));
        (all, mine, teams)
    }

    /// Composite flags for the current state.
    pub fn status(&self) -> DashboardStatus {
        let identity = self.identity.current();
        let (all, mine, teams) = self.entries(&identity);
        DashboardStatus::compute(&identity, &all, mine.as_ref(), teams.as_ref())
    }

    /// The current view. `my_team` is recomputed only when the team list or
    /// the user changed since the previous snapshot.
    pub fn snapshot(&mut self) -> DashboardSnapshot {
        let identity = self.identity.current();
        let (all, mine, teams) = self.entries(&identity);
        let status = DashboardStatus::compute(&identity, &all, mine.as_ref(), teams.as_ref());

        let my_team = match (&teams, identity.user_id()) {
            (Some(teams), Some(user_id)) => self.my_team.get_or_compute(
                MemoInputs::new().value(teams).scalar(Some(user_id)),
                || match teams.value_as::<Vec<Team>>() {
                    Some(list) => select_first(&list, |team| team.has_member(user_id)),
                    None => Selection::NoMatch,
                },
            ),
            _ => Selection::NoMatch,
        };

        let list = |entry: Option<&CacheEntry>| {
            entry
                .and_then(|e| e.value_as::<Vec<Hackathon>>())
                .unwrap_or_else(|| self.empty.clone())
        };

        DashboardSnapshot {
            all_hackathons: list(Some(&all)),
            my_hackathons: list(mine.as_ref()),
            my_team,
            is_loading: status.is_loading,
            is_teams_loading: status.is_teams_loading,
            is_error: status.is_error,
        }
    }

    /// How many times the team selection actually ran.
    pub fn my_team_recomputations(&self) -> usize {
        self.my_team.recomputations()
    }

    /// Wait until one of the view's entries or the identity changes.
    ///
    /// On an identity change the dependent queries are re-synced and the
    /// subscription moves to the new user's keys. Returns `false` once the
    /// identity provider is gone.
    pub async fn changed(&mut self) -> bool {
        let wake = tokio::select! {
            alive = self.subscription.changed() => Wake::Entry(alive),
            alive = self.identity.changed() => Wake::Identity(alive),
        };

        match wake {
            Wake::Entry(alive) => alive,
            Wake::Identity(alive) => {
                let identity = self.identity.current();
                if identity.user_id() != self.subscribed_user.as_deref() {
                    debug!(
                        "Identity moved from {:?} to {:?}, resubscribing",
                        self.subscribed_user,
                        identity.user_id()
                    );
                    self.subscription = Subscription::new(self.runner.store(), dependency_keys(&identity));
                    self.subscribed_user = identity.user_id().map(str::to_string);
                }
                self.refresh();
                alive
            }
        }
    }
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("identity", &self.identity.current())
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
