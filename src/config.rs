//! Dashboard configuration.

use crate::error::{Error, Result};
use crate::observability::DEFAULT_STALE_TIME;
use std::time::Duration;

/// Default REST backend location.
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Overrides [`DashboardConfig::api_url`].
pub const API_URL_ENV: &str = "QUERY_KIT_API_URL";

/// Overrides [`DashboardConfig::stale_time`], in whole seconds.
pub const STALE_SECS_ENV: &str = "QUERY_KIT_STALE_SECS";

/// Configuration for the dashboard queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DashboardConfig {
    pub api_url: String,
    /// Staleness window shared by the three dashboard queries.
    pub stale_time: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            api_url: DEFAULT_API_URL.to_string(),
            stale_time: DEFAULT_STALE_TIME,
        }
    }
}

impl DashboardConfig {
    /// Defaults, overridden by `QUERY_KIT_API_URL` and `QUERY_KIT_STALE_SECS`.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if `QUERY_KIT_STALE_SECS` is not a number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = DashboardConfig::default();

        if let Some(url) = lookup(API_URL_ENV).filter(|u| !u.trim().is_empty()) {
            config.api_url = url;
        }

        if let Some(secs) = lookup(STALE_SECS_ENV) {
            let secs = secs.trim().parse::<u64>().map_err(|e| {
                Error::ConfigError(format!("{} must be whole seconds, got {:?}: {}", STALE_SECS_ENV, secs, e))
            })?;
            config.stale_time = Duration::from_secs(secs);
        }

        debug!(
            "Dashboard config: api_url={} stale_time={:?}",
            config.api_url, config.stale_time
        );
        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }
}
