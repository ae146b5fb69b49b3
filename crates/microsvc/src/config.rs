//! Host configuration.
//!
//! Durations are stored as milliseconds so the struct round-trips through
//! TOML and environment providers without a custom format.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every service started from one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory holding one namespace per installed remote service.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Root directory for `bundle:` URIs.
    #[serde(default = "default_bundle_root")]
    pub bundle_root: PathBuf,

    /// Network fetch timeout in milliseconds.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// How long the on-start callback may hold the synchronizer, in milliseconds.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// User agent sent with remote fetches.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("microsvc").join("cache")
}

fn default_bundle_root() -> PathBuf {
    PathBuf::from("./bundle")
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("microsvc/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            bundle_root: default_bundle_root(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl HostConfig {
    /// Set the cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set the bundle root
    pub fn with_bundle_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_root = dir.into();
        self
    }

    /// Set the network fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the synchronizer start timeout
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}
