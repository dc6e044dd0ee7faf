//! HTTP transport over `reqwest`.

use super::Transport;
use crate::error::{Error, Result};
use serde_json::Value;

/// Transport issuing real HTTP requests against a base URL.
///
/// No request timeout is configured: a request that never answers keeps its
/// query pending.
///
/// # Example
///
/// ```no_run
/// # use query_kit::transport::{HttpTransport, Transport};
/// # async fn example() -> query_kit::Result<()> {
/// let transport = HttpTransport::new("http://localhost:8000/api");
/// let body = transport.fetch_json("/hackathons").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Use a preconfigured client (proxies, headers, TLS roots).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("✓ HTTP transport initialized for {}", base_url);
        HttpTransport { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

impl Transport for HttpTransport {
    async fn fetch_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        debug!("» GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::NetworkError(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::NetworkError(format!("GET {} returned {}", url, status)));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| Error::DecodeError(format!("GET {} returned invalid JSON: {}", url, e)))?;

        debug!("✓ GET {} -> {}", url, status);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new("http://localhost:8000/api/");
        assert_eq!(transport.base_url(), "http://localhost:8000/api");
        assert_eq!(
            transport.url("/hackathons"),
            "http://localhost:8000/api/hackathons"
        );
        assert_eq!(
            transport.url("teams?user_id=u1"),
            "http://localhost:8000/api/teams?user_id=u1"
        );
    }
}
