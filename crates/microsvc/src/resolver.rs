//! Resource Resolver
//!
//! Turns a [`ServiceIdentity`] into script source bytes. Bundled and local
//! files are read straight from disk; remote sources go through the
//! [`ServiceCache`] first and are fetched (and cached) on a miss.
//!
//! The bytes handed out are an in-memory copy. Nothing a caller holds refers
//! back to the cache directory, so uninstalling a URI never disturbs a
//! service that is already running from it.

use std::path::{Component, Path};
use std::sync::Arc;

use crate::cache::{CacheEntry, ServiceCache};
use crate::config::HostConfig;
use crate::error::{CacheError, ResolveError};
use crate::fetch::Fetcher;
use crate::identity::{BaseLocation, ServiceIdentity, SourceKind};

/// Resolved, loadable script source.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub identity: ServiceIdentity,
    pub bytes: Arc<[u8]>,
    /// Where relative sub-resources are loaded from
    pub base: BaseLocation,
}

impl ScriptSource {
    /// Source as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Resolves service URIs to source.
pub struct Resolver {
    config: HostConfig,
    cache: Arc<ServiceCache>,
    fetcher: Arc<dyn Fetcher>,
}

impl Resolver {
    pub fn new(config: HostConfig, cache: Arc<ServiceCache>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            cache,
            fetcher,
        }
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Resolve a service's source.
    pub async fn resolve(&self, identity: &ServiceIdentity) -> Result<ScriptSource, ResolveError> {
        match identity.kind() {
            SourceKind::Bundled | SourceKind::LocalFile => {
                let path = identity
                    .local_path(&self.config.bundle_root)
                    .ok_or_else(|| ResolveError::invalid(identity.uri(), "not a local path"))?;
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| ResolveError::io(path.display(), e))?;
                tracing::debug!(uri = %identity, path = %path.display(), "Resolved local service");
                Ok(ScriptSource {
                    identity: identity.clone(),
                    bytes: bytes.into(),
                    base: BaseLocation::for_path(&path),
                })
            }
            SourceKind::Remote => {
                let url = identity
                    .url()
                    .ok_or_else(|| ResolveError::invalid(identity.uri(), "not a URL"))?;

                let bytes = match self.cache.read_source(identity).await? {
                    Some((_, bytes)) => {
                        tracing::debug!(uri = %identity, "Service cache hit");
                        bytes
                    }
                    None => {
                        tracing::debug!(uri = %identity, "Service cache miss, fetching");
                        let bytes = self.fetcher.fetch(&url, self.config.fetch_timeout()).await?;
                        if let Err(e) = self.cache.store_source(identity, &bytes).await {
                            tracing::warn!(uri = %identity, error = %e, "Failed to cache service source");
                        }
                        bytes.into()
                    }
                };

                Ok(ScriptSource {
                    identity: identity.clone(),
                    bytes,
                    base: BaseLocation::Url(url),
                })
            }
        }
    }

    /// Fetch a remote service into the cache.
    ///
    /// Re-installing a cached URI only verifies the existing entry unless
    /// `force` is set.
    pub async fn install(
        &self,
        identity: &ServiceIdentity,
        force: bool,
    ) -> Result<CacheEntry, CacheError> {
        let url = identity
            .url()
            .ok_or_else(|| CacheError::NotRemote(identity.uri().to_string()))?;

        if !force {
            match self.cache.read_source(identity).await {
                Ok(Some((entry, _))) => return Ok(entry),
                Ok(None) | Err(ResolveError::CacheCorrupt(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let bytes = self.fetcher.fetch(&url, self.config.fetch_timeout()).await?;
        let entry = self.cache.store_source(identity, &bytes).await?;
        tracing::info!(uri = %identity, size = entry.size, "Installed service");
        Ok(entry)
    }

    /// Remove a service from the cache. Not an error if it was never installed.
    pub async fn uninstall(&self, identity: &ServiceIdentity) -> Result<bool, CacheError> {
        self.cache.uninstall(identity).await
    }

    /// Load a sub-resource relative to a service's base location.
    ///
    /// Remote sub-resources are stored in the owning service's cache namespace.
    pub async fn load_resource(
        &self,
        owner: &ServiceIdentity,
        base: &BaseLocation,
        path: &str,
    ) -> Result<Vec<u8>, ResolveError> {
        match base {
            BaseLocation::Directory(dir) => {
                let relative = Path::new(path);
                if relative.is_absolute() {
                    return Err(ResolveError::invalid(path, "resource path must be relative"));
                }
                if owner.kind() == SourceKind::Bundled
                    && relative.components().any(|c| matches!(c, Component::ParentDir))
                {
                    return Err(ResolveError::invalid(path, "resource escapes the bundle root"));
                }
                let full = dir.join(relative);
                tokio::fs::read(&full)
                    .await
                    .map_err(|e| ResolveError::io(full.display(), e))
            }
            BaseLocation::Url(base_url) => {
                let url = base_url
                    .join(path)
                    .map_err(|e| ResolveError::invalid(path, e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ResolveError::UnsupportedScheme(url.scheme().to_string()));
                }

                if let Some(bytes) = self.cache.read_resource(owner, url.as_str()).await? {
                    return Ok(bytes);
                }

                let bytes = self.fetcher.fetch(&url, self.config.fetch_timeout()).await?;
                if let Err(e) = self.cache.store_resource(owner, url.as_str(), &bytes).await {
                    tracing::warn!(uri = %owner, resource = %url, error = %e, "Failed to cache resource");
                }
                Ok(bytes)
            }
        }
    }
}
