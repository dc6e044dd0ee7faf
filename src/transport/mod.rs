//! Transport boundary: fetching parsed JSON by path.
//!
//! The cache never talks to the network itself; query fetch procedures call a
//! [`Transport`] and decode what it returns.

#[cfg(feature = "http")]
mod http;
mod memory;

#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use memory::{InMemoryTransport, Release};

use crate::error::Result;
use serde_json::Value;
use std::future::Future;

/// Issues `GET {path}` and yields the parsed JSON body.
///
/// Non-success responses fail with `Error::NetworkError`; bodies that are not
/// JSON fail with `Error::DecodeError`.
pub trait Transport: Send + Sync + 'static {
    fn fetch_json(&self, path: &str) -> impl Future<Output = Result<Value>> + Send;
}
