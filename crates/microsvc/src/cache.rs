//! Service Cache
//!
//! Persists fetched remote sources under one directory per URI:
//!
//! ```text
//! <cache_dir>/
//! └── <sha256(uri)>/
//!     ├── entry.json
//!     ├── source
//!     └── resources/
//!         └── <sha256(resource url)>
//! ```
//!
//! Every write lands in a temporary path first and is renamed into place, so a
//! reader sees either the old entry, the new entry or nothing. Operations on the
//! same URI serialize on a per-key lock; unrelated URIs never wait on each other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CacheError, ResolveError};
use crate::identity::{ServiceIdentity, sha256_hex};

const ENTRY_FILE: &str = "entry.json";
const SOURCE_FILE: &str = "source";
const RESOURCES_DIR: &str = "resources";

/// Metadata of a cached service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// URI the entry was installed from
    pub uri: String,
    /// When the source was fetched
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of the source bytes, hex encoded
    pub sha256: String,
    /// Source size in bytes
    pub size: u64,
    /// Sub-resources fetched on behalf of this service
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

/// A sub-resource stored in a service's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

/// On-disk cache of remote service sources.
pub struct ServiceCache {
    root: PathBuf,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl ServiceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn namespace(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn scratch_path(&self, prefix: &str) -> PathBuf {
        self.root.join(format!(".{}-{}", prefix, uuid::Uuid::new_v4()))
    }

    /// Metadata of a cached service, if present.
    pub async fn lookup(&self, identity: &ServiceIdentity) -> Result<Option<CacheEntry>, CacheError> {
        let key = identity.cache_key();
        let lock = self.lock_for(&key);
        let _guard = lock.read().await;
        read_entry(&self.namespace(&key)).await
    }

    /// All entries currently in the cache.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(key) = name.to_str() else { continue };
            if key.starts_with('.') {
                continue;
            }
            let lock = self.lock_for(key);
            let _guard = lock.read().await;
            match read_entry(&item.path()).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => tracing::warn!(key, error = %e, "Skipping unreadable cache entry"),
            }
        }

        Ok(entries)
    }

    /// Read and verify a cached source.
    ///
    /// A corrupt entry is evicted and reported as [`ResolveError::CacheCorrupt`],
    /// so the next resolution fetches a fresh copy.
    pub async fn read_source(
        &self,
        identity: &ServiceIdentity,
    ) -> Result<Option<(CacheEntry, Arc<[u8]>)>, ResolveError> {
        let key = identity.cache_key();
        let lock = self.lock_for(&key);
        let dir = self.namespace(&key);

        let outcome = {
            let _guard = lock.read().await;
            verify_source(&dir).await
        };

        match outcome {
            Verified::Missing => Ok(None),
            Verified::Valid(entry, bytes) => Ok(Some((entry, bytes))),
            Verified::Corrupt(reason) => {
                tracing::warn!(uri = %identity, reason = %reason, "Evicting corrupt cache entry");
                let _guard = lock.write().await;
                // A concurrent install may have replaced the entry in the meantime
                if let Verified::Corrupt(_) = verify_source(&dir).await {
                    if let Err(e) = remove_namespace(&dir).await {
                        tracing::warn!(uri = %identity, error = %e, "Failed to evict corrupt cache entry");
                    }
                }
                Err(ResolveError::CacheCorrupt(identity.uri().to_string()))
            }
        }
    }

    /// Store a freshly fetched source, replacing any previous entry.
    pub async fn store_source(
        &self,
        identity: &ServiceIdentity,
        bytes: &[u8],
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            uri: identity.uri().to_string(),
            fetched_at: Utc::now(),
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
            resources: Vec::new(),
        };

        tokio::fs::create_dir_all(&self.root).await?;
        let staging = self.scratch_path("staging");
        let staged = async {
            tokio::fs::create_dir_all(&staging).await?;
            tokio::fs::write(staging.join(SOURCE_FILE), bytes).await?;
            tokio::fs::write(staging.join(ENTRY_FILE), serde_json::to_vec_pretty(&entry)?).await?;
            Ok::<_, CacheError>(())
        }
        .await;
        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let key = identity.cache_key();
        let lock = self.lock_for(&key);
        let _guard = lock.write().await;

        let target = self.namespace(&key);
        let previous = self.scratch_path("evicted");
        let had_previous = match tokio::fs::rename(&target, &previous).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e.into());
            }
        };

        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }
        if had_previous {
            let _ = tokio::fs::remove_dir_all(&previous).await;
        }

        tracing::debug!(uri = %identity, size = entry.size, "Cached service source");
        Ok(entry)
    }

    /// Read a sub-resource stored in a service's namespace.
    pub async fn read_resource(
        &self,
        identity: &ServiceIdentity,
        url: &str,
    ) -> Result<Option<Vec<u8>>, ResolveError> {
        let key = identity.cache_key();
        let lock = self.lock_for(&key);
        let _guard = lock.read().await;

        let dir = self.namespace(&key);
        let Ok(Some(entry)) = read_entry(&dir).await else {
            return Ok(None);
        };
        let Some(resource) = entry.resources.iter().find(|r| r.url == url) else {
            return Ok(None);
        };

        let path = dir.join(RESOURCES_DIR).join(sha256_hex(url.as_bytes()));
        match tokio::fs::read(&path).await {
            Ok(bytes) if sha256_hex(&bytes) == resource.sha256 => Ok(Some(bytes)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ResolveError::io(path.display(), e)),
        }
    }

    /// Add a sub-resource to an installed service's namespace.
    ///
    /// Does nothing if the service itself is not cached (it was uninstalled
    /// while running, or was never installed).
    pub async fn store_resource(
        &self,
        identity: &ServiceIdentity,
        url: &str,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        let key = identity.cache_key();
        let lock = self.lock_for(&key);
        let _guard = lock.write().await;

        let dir = self.namespace(&key);
        let Some(mut entry) = read_entry(&dir).await? else {
            return Ok(());
        };

        let resources = dir.join(RESOURCES_DIR);
        tokio::fs::create_dir_all(&resources).await?;
        let file = resources.join(sha256_hex(url.as_bytes()));
        write_atomic(&file, bytes).await?;

        let record = ResourceEntry {
            url: url.to_string(),
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
        };
        match entry.resources.iter_mut().find(|r| r.url == url) {
            Some(existing) => *existing = record,
            None => entry.resources.push(record),
        }
        write_atomic(&dir.join(ENTRY_FILE), &serde_json::to_vec_pretty(&entry)?).await?;
        Ok(())
    }

    /// Remove a service's namespace. Returns whether anything was removed.
    ///
    /// Removing a URI that is not cached is not an error.
    pub async fn uninstall(&self, identity: &ServiceIdentity) -> Result<bool, CacheError> {
        let key = identity.cache_key();
        let result = {
            let lock = self.lock_for(&key);
            let _guard = lock.write().await;
            remove_namespace(&self.namespace(&key)).await
        };
        // Nobody else holds or waits on the lock
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        let removed = result.map_err(|e| CacheError::UninstallFailed {
            uri: identity.uri().to_string(),
            message: e.to_string(),
        })?;
        if removed {
            tracing::info!(uri = %identity, "Uninstalled service");
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

enum Verified {
    Missing,
    Valid(CacheEntry, Arc<[u8]>),
    Corrupt(String),
}

async fn verify_source(dir: &Path) -> Verified {
    let entry = match read_entry(dir).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return Verified::Missing,
        Err(e) => return Verified::Corrupt(e.to_string()),
    };
    match tokio::fs::read(dir.join(SOURCE_FILE)).await {
        Ok(bytes) if sha256_hex(&bytes) == entry.sha256 => Verified::Valid(entry, bytes.into()),
        Ok(_) => Verified::Corrupt("checksum mismatch".to_string()),
        Err(e) => Verified::Corrupt(e.to_string()),
    }
}

async fn read_entry(dir: &Path) -> Result<Option<CacheEntry>, CacheError> {
    match tokio::fs::read(dir.join(ENTRY_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

async fn remove_namespace(dir: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
