//! Service Host
//!
//! Owns what every instance shares: configuration, the script engine, the
//! resolver and its cache. Instances themselves share no other state.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::cache::{CacheEntry, ServiceCache};
use crate::config::HostConfig;
use crate::engine::ScriptEngine;
use crate::error::{CacheError, ResolveError};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::identity::ServiceIdentity;
use crate::resolver::Resolver;
use crate::service::{MicroService, MicroServiceBuilder};

pub(crate) struct HostShared {
    pub(crate) config: HostConfig,
    pub(crate) resolver: Arc<Resolver>,
    pub(crate) engine: Arc<dyn ScriptEngine>,
    running: DashMap<Uuid, MicroService>,
}

impl HostShared {
    pub(crate) fn register(&self, svc: &MicroService) {
        self.running.insert(svc.id(), svc.clone());
    }

    pub(crate) fn unregister(&self, svc: &MicroService) {
        self.running.remove(&svc.id());
    }
}

/// Entry point for creating and managing services.
#[derive(Clone)]
pub struct ServiceHost {
    shared: Arc<HostShared>,
}

impl ServiceHost {
    /// Create a host that fetches remote services over HTTP.
    pub fn new(config: HostConfig, engine: Arc<dyn ScriptEngine>) -> Result<Self, ResolveError> {
        let fetcher = HttpFetcher::new(&config.user_agent)?;
        Ok(Self::with_fetcher(config, engine, Arc::new(fetcher)))
    }

    /// Create a host with a custom [`Fetcher`].
    pub fn with_fetcher(
        config: HostConfig,
        engine: Arc<dyn ScriptEngine>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let cache = Arc::new(ServiceCache::new(&config.cache_dir));
        let resolver = Arc::new(Resolver::new(config.clone(), cache, fetcher));
        tracing::debug!(cache_dir = %config.cache_dir.display(), "Service host created");

        Self {
            shared: Arc::new(HostShared {
                config,
                resolver,
                engine,
                running: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.shared.resolver
    }

    /// Begin building a service for `uri`.
    ///
    /// The URI is validated when the service starts; an invalid one is
    /// reported through on-error.
    pub fn service(&self, uri: &str) -> MicroServiceBuilder {
        MicroServiceBuilder::new(self.shared.clone(), uri)
    }

    /// Fetch a remote service into the cache ahead of time.
    pub async fn install(&self, uri: &str, force: bool) -> Result<CacheEntry, CacheError> {
        let identity = ServiceIdentity::parse(uri)?;
        self.shared.resolver.install(&identity, force).await
    }

    /// Remove a service from the cache. Running instances are unaffected.
    pub async fn uninstall(&self, uri: &str) -> Result<bool, CacheError> {
        let identity = ServiceIdentity::parse(uri)?;
        self.shared.resolver.uninstall(&identity).await
    }

    /// Cached services.
    pub async fn installed(&self) -> Result<Vec<CacheEntry>, CacheError> {
        self.shared.resolver.cache().entries().await
    }

    /// Instances that have started and not yet terminated.
    pub fn running(&self) -> Vec<MicroService> {
        self.shared
            .running
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("config", &self.shared.config)
            .field("running", &self.shared.running.len())
            .finish()
    }
}
