//! microsvc JavaScript Runtime
//!
//! A [`microsvc::ScriptEngine`] backed by `deno_core`. It follows Deno's
//! worker pattern: each service runs in its own OS thread with its own V8
//! isolate and current-thread tokio runtime.
//!
//! # Script API
//!
//! - `Host.emit(name, value)`, `Host.on/once/off(name, fn)` for events
//! - `Host.load(path)` for sub-resource text, `Host.require(path)` and
//!   `import` for modules resolved relative to the service
//! - `process.exit(code)`
//! - `console.*`, forwarded to tracing under target `microsvc.js`
//! - `setTimeout/setInterval/clearTimeout/clearInterval`
//!
//! Scripts are ES modules. Top-level code runs once the host has released
//! the start gate.
//!
//! A script whose event loop has drained and that has no `Host.on`
//! listeners exits with code 0.

mod command;
mod engine;
mod error;
mod handle;
mod loader;
mod ops;
mod spawn;
mod worker;

pub use engine::JsEngine;
pub use error::RuntimeError;
pub use handle::JsServiceHandle;
pub use spawn::spawn_service_runtime;
pub use worker::init_platform;
