//! Scripted in-memory transport.

use super::Transport;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Lets a held response through. Dropping it without calling
/// [`release`](Release::release) fails the waiting request.
#[derive(Debug)]
pub struct Release(oneshot::Sender<()>);

impl Release {
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

struct Held {
    response: Result<Value>,
    gate: oneshot::Receiver<()>,
}

#[derive(Default)]
struct Route {
    response: Option<Result<Value>>,
    held: VecDeque<Held>,
    calls: usize,
}

/// Transport answering from scripted responses, for tests and demos.
///
/// Each path has a standing response (set with [`respond`](Self::respond) or
/// [`fail`](Self::fail)) and a queue of held responses (from
/// [`hold`](Self::hold)) that are served first, each one waiting until its
/// [`Release`] fires. Unknown paths answer with a 404 network error.
///
/// # Example
///
/// ```
/// use query_kit::transport::{InMemoryTransport, Transport};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let transport = InMemoryTransport::new();
/// transport.respond("/hackathons", json!({ "documents": [] }));
/// let body = transport.fetch_json("/hackathons").await.expect("scripted");
/// assert_eq!(body["documents"], json!([]));
/// assert_eq!(transport.calls("/hackathons"), 1);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    routes: Arc<DashMap<String, Route>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `path` with `body` from now on.
    pub fn respond(&self, path: impl Into<String>, body: Value) {
        self.routes.entry(path.into()).or_default().response = Some(Ok(body));
    }

    /// Fail `path` with `error` from now on.
    pub fn fail(&self, path: impl Into<String>, error: Error) {
        self.routes.entry(path.into()).or_default().response = Some(Err(error));
    }

    /// Queue a one-off response for the next request to `path`, delivered
    /// only once the returned [`Release`] fires.
    pub fn hold(&self, path: impl Into<String>, response: Result<Value>) -> Release {
        let (sender, gate) = oneshot::channel();
        self.routes
            .entry(path.into())
            .or_default()
            .held
            .push_back(Held { response, gate });
        Release(sender)
    }

    /// Requests made to `path` so far.
    pub fn calls(&self, path: &str) -> usize {
        self.routes.get(path).map(|route| route.calls).unwrap_or(0)
    }

    /// Requests made to any path so far.
    pub fn total_calls(&self) -> usize {
        self.routes.iter().map(|route| route.calls).sum()
    }
}

impl Transport for InMemoryTransport {
    async fn fetch_json(&self, path: &str) -> Result<Value> {
        let (response, gate) = {
            let mut route = self.routes.entry(path.to_string()).or_default();
            route.calls += 1;
            match route.held.pop_front() {
                Some(held) => (held.response, Some(held.gate)),
                None => {
                    let response = route.response.clone().unwrap_or_else(|| {
                        Err(Error::NetworkError(format!(
                            "GET {} returned 404 Not Found",
                            path
                        )))
                    });
                    (response, None)
                }
            }
        };

        debug!("[transport] GET {}", path);

        if let Some(gate) = gate {
            gate.await
                .map_err(|_| Error::NetworkError(format!("GET {} was abandoned", path)))?;
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let transport = InMemoryTransport::new();
        let err = transport.fetch_json("/nope").await.unwrap_err();
        assert!(err.is_network());
        assert_eq!(transport.calls("/nope"), 1);
    }

    #[tokio::test]
    async fn test_fail_route() {
        let transport = InMemoryTransport::new();
        transport.fail("/teams", Error::NetworkError("Failed to load teams".to_string()));
        let err = transport.fetch_json("/teams").await.unwrap_err();
        assert_eq!(err, Error::NetworkError("Failed to load teams".to_string()));
    }

    #[tokio::test]
    async fn test_held_response_waits_for_release() {
        let transport = InMemoryTransport::new();
        transport.respond("/hackathons", json!({ "documents": ["standing"] }));
        let release = transport.hold("/hackathons", Ok(json!({ "documents": ["held"] })));

        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.fetch_json("/hackathons").await }
        });
        tokio::task::yield_now().await;
        assert_eq!(transport.calls("/hackathons"), 1);

        release.release();
        let body = pending.await.expect("task panicked").expect("scripted");
        assert_eq!(body["documents"][0], "held");

        // Held queue drained, standing response again.
        let body = transport.fetch_json("/hackathons").await.expect("scripted");
        assert_eq!(body["documents"][0], "standing");
        assert_eq!(transport.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_release_fails_request() {
        let transport = InMemoryTransport::new();
        drop(transport.hold("/teams", Ok(json!({}))));
        assert!(transport.fetch_json("/teams").await.is_err());
    }
}
