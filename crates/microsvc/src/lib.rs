//! microsvc
//!
//! Host-side runtime for script micro-services. A service is a script
//! identified by a URI (bundled, local file, or http/https). The host
//! resolves and caches its source, hands it to a [`ScriptEngine`], and then
//! exchanges [`EventPayload`] events with it until it exits.
//!
//! # Architecture
//!
//! - [`ServiceHost`] owns the shared pieces: config, engine, resolver, cache
//! - [`MicroService`] is one instance; `start()` spawns its orchestrator task
//! - All callbacks of an instance run on that task, never concurrently
//! - A [`Synchronizer`] holds back script events until the host is ready
//! - Remote sources are cached per URI under [`HostConfig::cache_dir`]

mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
mod host;
pub mod identity;
pub mod payload;
mod process;
pub mod resolver;
mod service;
mod state;
mod sync;

pub use cache::{CacheEntry, ResourceEntry, ServiceCache};
pub use config::HostConfig;
pub use engine::{EngineHost, ScriptEngine, ScriptHandle};
pub use error::{
    BridgeError, CacheError, CompileError, MarshalError, ResolveError, ServiceError,
    ServiceResult,
};
pub use fetch::{Fetcher, HttpFetcher};
pub use host::ServiceHost;
pub use identity::{BaseLocation, ServiceIdentity, SourceKind};
pub use payload::{EventPayload, RawNode, RawValue, ScriptValue};
pub use process::Process;
pub use resolver::{Resolver, ScriptSource};
pub use service::{MicroService, MicroServiceBuilder};
pub use state::ServiceState;
pub use sync::Synchronizer;
