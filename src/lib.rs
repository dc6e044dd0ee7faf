//! # query-kit
//!
//! A keyed, single-flight, staleness-aware query cache for async Rust.
//!
//! ## Features
//!
//! - **Keyed Entries:** Structural [`QueryKey`]s address one [`CacheEntry`] each
//! - **Single-Flight:** At most one fetch per key; concurrent callers attach to it
//! - **Staleness Windows:** Settled entries are reused until their window elapses
//! - **Out-of-Order Safe:** Results from superseded fetches are discarded by token
//! - **Dependent Queries:** Identity-gated queries never fetch while blocked
//! - **Derived Views:** Memoized, pure computations that wake only on their own keys
//!
//! ## Quick Start
//!
//! ```ignore
//! use query_kit::{QueryDescriptor, QueryKey, QueryRunner};
//!
//! // 1. Describe the query
//! let descriptor = QueryDescriptor::builder(QueryKey::from(["hackathons", "all"]))
//!     .fetch_typed(|| async { fetch_hackathons().await })
//!     .stale_time(Duration::from_secs(300))
//!     .build()?;
//!
//! // 2. Run it; concurrent runs share one fetch
//! let runner = QueryRunner::default();
//! let entry = runner.run(&descriptor).await;
//!
//! // 3. Read the typed value back
//! let hackathons = entry.value_as::<Vec<Hackathon>>();
//! ```

#[macro_use]
extern crate log;

pub mod config;
pub mod dashboard;
pub mod dependent;
pub mod derived;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod key;
pub mod models;
pub mod observability;
pub mod runner;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::DashboardConfig;
pub use dashboard::{Dashboard, DashboardSnapshot, DashboardStatus};
pub use dependent::{CurrentUser, DependentQueries, DependentQuery, IdentitySource, IdentityState};
pub use derived::{Memo, MemoInputs, Selection, Subscription};
pub use descriptor::{QueryBuilder, QueryDescriptor};
pub use entry::{CacheEntry, QueryStatus, QueryValue};
pub use error::{Error, Result};
pub use key::QueryKey;
pub use runner::QueryRunner;
pub use store::CacheStore;
pub use transport::Transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
