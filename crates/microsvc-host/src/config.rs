//! Layered host configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `MICROSVC_*`
//! environment variables, then command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use microsvc::HostConfig;

/// Flags that override every other layer when present.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub cache_dir: Option<PathBuf>,
    pub bundle_root: Option<PathBuf>,
    pub fetch_timeout_ms: Option<u64>,
    pub start_timeout_ms: Option<u64>,
}

/// Defaults merged with the config file and environment.
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(HostConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MICROSVC_"))
}

pub fn load(path: &Path, overrides: &Overrides) -> Result<HostConfig> {
    let config: HostConfig = figment(path)
        .extract()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(apply(config, overrides))
}

fn apply(mut config: HostConfig, overrides: &Overrides) -> HostConfig {
    if let Some(dir) = &overrides.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &overrides.bundle_root {
        config.bundle_root = dir.clone();
    }
    if let Some(ms) = overrides.fetch_timeout_ms {
        config.fetch_timeout_ms = ms;
    }
    if let Some(ms) = overrides.start_timeout_ms {
        config.start_timeout_ms = ms;
    }
    config
}
