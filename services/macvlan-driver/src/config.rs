//! Configuration for the macvlan driver.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::state::{RetryPolicy, DEFAULT_DELETE_ATTEMPTS, DEFAULT_RETRY_BACKOFF};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator API base URL, used for network lookups this node missed.
    pub orchestrator_url: String,

    /// Orchestrator request timeout.
    pub orchestrator_timeout: Duration,

    /// Data directory for the local store.
    pub data_dir: PathBuf,

    /// Compare-and-delete attempts before giving up.
    pub store_delete_attempts: u32,

    /// Pause between compare-and-delete attempts.
    pub store_retry_backoff: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator_url: "http://localhost:6732".to_string(),
            orchestrator_timeout: Duration::from_secs(5),
            data_dir: PathBuf::from("/var/lib/macvlan-driver"),
            store_delete_attempts: DEFAULT_DELETE_ATTEMPTS,
            store_retry_backoff: DEFAULT_RETRY_BACKOFF,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset variables take their default; set but unparsable numbers are
    /// an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let orchestrator_url = lookup("MACVLAN_ORCHESTRATOR_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.orchestrator_url);

        let orchestrator_timeout = parse_var(&lookup, "MACVLAN_ORCHESTRATOR_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.orchestrator_timeout);

        let data_dir = lookup("MACVLAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let store_delete_attempts = parse_var(&lookup, "MACVLAN_STORE_DELETE_ATTEMPTS")?
            .unwrap_or(defaults.store_delete_attempts);
        if store_delete_attempts == 0 {
            anyhow::bail!("MACVLAN_STORE_DELETE_ATTEMPTS must be at least 1");
        }

        let store_retry_backoff = parse_var(&lookup, "MACVLAN_STORE_RETRY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.store_retry_backoff);

        let log_level = lookup("MACVLAN_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            orchestrator_url,
            orchestrator_timeout,
            data_dir,
            store_delete_attempts,
            store_retry_backoff,
            log_level,
        })
    }

    /// Path of the store database.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("macvlan.db")
    }

    /// Bound on record delete retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.store_delete_attempts,
            backoff: self.store_retry_backoff,
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", key, raw))
        })
        .transpose()
}
