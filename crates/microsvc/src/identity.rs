//! Service identity and URI classification.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ResolveError;

/// Scheme for resources bundled with the host application.
pub const BUNDLE_SCHEME: &str = "bundle";

/// Where a service's source comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// `bundle:<relative path>`, resolved under the host's bundle root
    Bundled,
    /// `file:///absolute/path`
    LocalFile,
    /// `http://` or `https://`
    Remote,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Bundled => write!(f, "bundled"),
            SourceKind::LocalFile => write!(f, "local-file"),
            SourceKind::Remote => write!(f, "remote"),
        }
    }
}

/// A URI plus its source kind. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    uri: String,
    kind: SourceKind,
}

impl ServiceIdentity {
    /// Classify a URI.
    ///
    /// Archive-prefixed URIs (`jar:file:` and friends) must be rewritten to a
    /// plain `file:` form by the caller before they get here.
    pub fn parse(uri: &str) -> Result<Self, ResolveError> {
        let uri = uri.trim();
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| ResolveError::invalid(uri, "missing scheme"))?;

        let kind = match scheme.to_ascii_lowercase().as_str() {
            BUNDLE_SCHEME => {
                bundle_relative_path(uri, rest)?;
                SourceKind::Bundled
            }
            "file" => {
                file_path(uri, rest)?;
                SourceKind::LocalFile
            }
            "http" | "https" => {
                let url = Url::parse(uri).map_err(|e| ResolveError::invalid(uri, e.to_string()))?;
                if url.host_str().is_none() {
                    return Err(ResolveError::invalid(uri, "missing host"));
                }
                SourceKind::Remote
            }
            other => return Err(ResolveError::UnsupportedScheme(other.to_string())),
        };

        Ok(Self {
            uri: uri.to_string(),
            kind,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn is_remote(&self) -> bool {
        self.kind == SourceKind::Remote
    }

    /// Key of this service's cache namespace.
    pub fn cache_key(&self) -> String {
        sha256_hex(self.uri.as_bytes())
    }

    /// Path of a bundled or local-file source. `None` for remote services.
    pub fn local_path(&self, bundle_root: &Path) -> Option<PathBuf> {
        let (_, rest) = self.uri.split_once(':')?;
        match self.kind {
            SourceKind::Bundled => bundle_relative_path(&self.uri, rest)
                .ok()
                .map(|p| bundle_root.join(p)),
            SourceKind::LocalFile => file_path(&self.uri, rest).ok(),
            SourceKind::Remote => None,
        }
    }

    /// URL of a remote source. `None` for local services.
    pub fn url(&self) -> Option<Url> {
        match self.kind {
            SourceKind::Remote => Url::parse(&self.uri).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Location that relative sub-resources are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseLocation {
    /// Directory containing a bundled or local-file source
    Directory(PathBuf),
    /// URL of a remote source
    Url(Url),
}

impl BaseLocation {
    pub(crate) fn for_path(path: &Path) -> Self {
        BaseLocation::Directory(path.parent().map(Path::to_path_buf).unwrap_or_default())
    }
}

impl fmt::Display for BaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseLocation::Directory(dir) => write!(f, "{}", dir.display()),
            BaseLocation::Url(url) => write!(f, "{}", url),
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn bundle_relative_path(uri: &str, rest: &str) -> Result<PathBuf, ResolveError> {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return Err(ResolveError::invalid(uri, "empty bundle path"));
    }
    let path = PathBuf::from(rest);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ResolveError::invalid(uri, "bundle path escapes the bundle root"));
    }
    Ok(path)
}

fn file_path(uri: &str, rest: &str) -> Result<PathBuf, ResolveError> {
    // file:///abs, file://localhost/abs and file:/abs are all accepted
    if !rest.starts_with('/') {
        return Err(ResolveError::invalid(uri, "file path must be absolute"));
    }
    let url = Url::parse(uri).map_err(|e| ResolveError::invalid(uri, e.to_string()))?;
    if url.host_str().is_some_and(|host| !host.is_empty() && host != "localhost") {
        return Err(ResolveError::invalid(uri, "file URI must not name a remote host"));
    }
    let path = url
        .to_file_path()
        .map_err(|_| ResolveError::invalid(uri, "not a local file path"))?;
    if !path.is_absolute() {
        return Err(ResolveError::invalid(uri, "file path must be absolute"));
    }
    Ok(path)
}
