//! Query descriptors and their fluent builder.

use crate::entry::QueryValue;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Procedure producing a query's value. Called once per network fetch.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<QueryValue>> + Send + Sync>;

/// Everything the runner needs to execute one query.
#[derive(Clone)]
pub struct QueryDescriptor {
    pub key: QueryKey,
    pub fetch: FetchFn,
    /// When false the runner leaves the entry untouched and never fetches.
    pub enabled: bool,
    /// `None` defers to the runner's [`StalePolicy`](crate::observability::StalePolicy).
    pub stale_time: Option<Duration>,
}

impl QueryDescriptor {
    /// Start building a descriptor for `key`.
    pub fn builder(key: QueryKey) -> QueryBuilder {
        QueryBuilder::new(key)
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`QueryDescriptor`].
///
/// # Example
///
/// ```
/// use query_kit::{QueryDescriptor, QueryKey};
/// use std::time::Duration;
///
/// let descriptor = QueryDescriptor::builder(QueryKey::from(["hackathons", "all"]))
///     .fetch_typed(|| async { Ok(vec!["hack-1".to_string()]) })
///     .stale_time(Duration::from_secs(300))
///     .build()
///     .expect("fetch procedure set");
/// assert!(descriptor.enabled);
/// ```
pub struct QueryBuilder {
    key: QueryKey,
    fetch: Option<FetchFn>,
    enabled: bool,
    stale_time: Option<Duration>,
}

impl QueryBuilder {
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            fetch: None,
            enabled: true,
            stale_time: None,
        }
    }

    /// Set a fetch procedure that already yields a type-erased value.
    pub fn fetch<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryValue>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(move || fetch().boxed()));
        self
    }

    /// Set a fetch procedure yielding a concrete `T`; the value is stored
    /// as `Arc<T>` and read back with [`CacheEntry::value_as`](crate::CacheEntry::value_as).
    pub fn fetch_typed<T, F, Fut>(self, fetch: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fetch(move || {
            let fut = fetch();
            async move { fut.await.map(|value| Arc::new(value) as QueryValue) }
        })
    }

    /// Gate the query. Disabled queries are never fetched.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Override the staleness window for this query.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// # Errors
    ///
    /// `Error::ValidationError` when no fetch procedure was set.
    pub fn build(self) -> Result<QueryDescriptor> {
        let fetch = self.fetch.ok_or_else(|| {
            Error::ValidationError(format!("Query {} has no fetch procedure", self.key))
        })?;
        Ok(QueryDescriptor {
            key: self.key,
            fetch,
            enabled: self.enabled,
            stale_time: self.stale_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_fetch() {
        let result = QueryBuilder::new(QueryKey::from(["teams"])).build();
        match result {
            Err(Error::ValidationError(msg)) => assert!(msg.contains("teams")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_builder_defaults() {
        let descriptor = QueryBuilder::new(QueryKey::from(["teams"]))
            .fetch_typed(|| async { Ok(1u32) })
            .build()
            .expect("Failed to build");
        assert!(descriptor.enabled);
        assert!(descriptor.stale_time.is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let descriptor = QueryBuilder::new(QueryKey::from(["teams"]))
            .fetch_typed(|| async { Ok(1u32) })
            .enabled(false)
            .stale_time(Duration::from_secs(10))
            .build()
            .expect("Failed to build");
        assert!(!descriptor.enabled);
        assert_eq!(descriptor.stale_time, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_fetch_typed_erases_value() {
        let descriptor = QueryBuilder::new(QueryKey::from(["teams"]))
            .fetch_typed(|| async { Ok(vec![1u32, 2]) })
            .build()
            .expect("Failed to build");
        let value = (descriptor.fetch)().await.expect("fetch failed");
        let list = value.downcast::<Vec<u32>>().expect("wrong type");
        assert_eq!(*list, vec![1, 2]);
    }
}
