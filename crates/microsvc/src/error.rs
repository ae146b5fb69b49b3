//! Error types for the service host.
//!
//! Failures that happen after `start()` has returned are never propagated to the
//! caller directly; they are wrapped in [`ServiceError`] and delivered through the
//! instance's on-error callbacks.

use std::time::Duration;

/// Errors that can occur while turning a URI into loadable script source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("I/O error reading {path}: {message}")]
    Io { path: String, message: String },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("Timed out after {timeout:?} fetching {url}")]
    Timeout { url: String, timeout: Duration },

    #[error("Cache entry for {0} is corrupt")]
    CacheCorrupt(String),
}

impl ResolveError {
    pub(crate) fn io(path: impl std::fmt::Display, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ResolveError::NotFound(path.to_string())
        } else {
            ResolveError::Io {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    }

    pub(crate) fn invalid(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        ResolveError::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the service cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cache metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Only remote services can be installed: {0}")]
    NotRemote(String),

    #[error("Failed to uninstall {uri}: {message}")]
    UninstallFailed { uri: String, message: String },
}

/// Errors raised while converting a script-side value into an event payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("Cyclic structure at heap node {0}")]
    Cycle(usize),

    #[error("Dangling heap reference {0}")]
    DanglingReference(usize),

    #[error("Payload nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("Payload expands to more than {0} values")]
    TooLarge(usize),
}

/// The script engine could not compile the service source.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Compile failed: {0}")]
pub struct CompileError(pub String);

/// Errors from the event bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("No running script is attached to this service")]
    Detached,
}

/// Errors reported for a service instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Uncaught script error: {0}")]
    RuntimeFault(String),

    #[error("Start timed out after {0:?} waiting for the synchronizer")]
    StartTimedOut(Duration),

    #[error("Synchronizer dropped before it was released")]
    StartAbandoned,

    #[error("Service already started: {0}")]
    AlreadyStarted(String),

    #[error("start() must be called from within a tokio runtime")]
    NoRuntime,
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
