//! Process configuration: remote-platform credentials and database location.
//!
//! Read once at startup. A missing credential is a configuration error and is
//! reported before any network call is attempted.

use anyhow::{bail, Result};

use crate::util::env::{env_opt, env_parse};

/// Remote storefront API credentials plus local database location.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Storefront domain, e.g. `my-shop.example-platform.com`.
    pub store_domain: String,
    /// Admin API access token.
    pub access_token: String,
    /// API version segment of the endpoint path.
    pub api_version: String,
    /// sqlx connection URL for the local document store.
    pub database_url: String,
    /// HTTP timeout for remote requests, seconds.
    pub http_timeout_secs: u64,
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// Absence of either credential short-circuits with a configuration error
    /// rather than surfacing later as a network error.
    pub fn from_env() -> Result<Self> {
        let store_domain = env_opt("STORE_DOMAIN");
        let access_token = env_opt("STORE_API_TOKEN");
        let api_version = env_opt("STORE_API_VERSION").unwrap_or_else(|| "2024-07".to_string());

        let (store_domain, access_token) = match (store_domain, access_token) {
            (Some(d), Some(t)) => (d, t),
            (d, t) => {
                let mut missing = Vec::new();
                if d.is_none() {
                    missing.push("STORE_DOMAIN");
                }
                if t.is_none() {
                    missing.push("STORE_API_TOKEN");
                }
                bail!("sync not configured: missing {}", missing.join(", "));
            }
        };

        Ok(Self {
            store_domain,
            access_token,
            api_version,
            database_url: env_opt("SHOPSYNC_DB")
                .unwrap_or_else(|| "sqlite://shopsync.db".to_string()),
            http_timeout_secs: env_parse("STORE_HTTP_TIMEOUT_SECS", 30u64),
        })
    }

    /// Database-only configuration for commands that never touch the remote
    /// API (status, sequence numbers, the sale backfill).
    pub fn database_url_from_env() -> String {
        env_opt("SHOPSYNC_DB").unwrap_or_else(|| "sqlite://shopsync.db".to_string())
    }
}
