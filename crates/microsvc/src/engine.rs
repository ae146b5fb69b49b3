//! Script engine seam.
//!
//! The core never executes script code itself. A [`ScriptEngine`] compiles a
//! [`ScriptSource`] and reports back through an [`EngineHost`]; the host
//! talks to the script through the returned [`ScriptHandle`]. Compiling and
//! running are separate steps: top-level code only starts once the host calls
//! [`ScriptHandle::run`], after the start gate has been released.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BridgeError, CompileError, ResolveError};
use crate::identity::{BaseLocation, ServiceIdentity};
use crate::payload::{EventPayload, ScriptValue};
use crate::resolver::{Resolver, ScriptSource};

/// Engine that can compile and run service scripts.
#[async_trait]
pub trait ScriptEngine: Send + Sync + 'static {
    /// Compile `source` without running any of it.
    ///
    /// Must return once compilation has succeeded or failed. Execution
    /// starts with [`ScriptHandle::run`] and is reported through `host`.
    async fn compile(
        &self,
        source: ScriptSource,
        host: EngineHost,
    ) -> Result<Arc<dyn ScriptHandle>, CompileError>;
}

/// Host-side handle to a compiled script.
pub trait ScriptHandle: Send + Sync + 'static {
    /// Start executing top-level code. Called at most once.
    fn run(&self);

    /// Deliver a host event to the script's listeners. Events sent before
    /// [`run`](Self::run) are delivered once the script is running, after its
    /// top-level code.
    fn dispatch_to_script(&self, event: &str, payload: EventPayload) -> Result<(), BridgeError>;

    /// Stop the script. Must be safe to call more than once and after the
    /// script has already exited.
    fn request_exit(&self, code: i32);
}

/// Signals from a running script, in the order they happened.
#[derive(Debug, Clone)]
pub(crate) enum EngineSignal {
    Emit { event: String, value: ScriptValue },
    Exit(i32),
    Fault(String),
}

/// Callbacks available to an engine for one instance.
#[derive(Clone)]
pub struct EngineHost {
    identity: ServiceIdentity,
    base: BaseLocation,
    resolver: Arc<Resolver>,
    signals: mpsc::UnboundedSender<EngineSignal>,
}

impl EngineHost {
    pub(crate) fn new(
        source: &ScriptSource,
        resolver: Arc<Resolver>,
        signals: mpsc::UnboundedSender<EngineSignal>,
    ) -> Self {
        Self {
            identity: source.identity.clone(),
            base: source.base.clone(),
            resolver,
            signals,
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn base(&self) -> &BaseLocation {
        &self.base
    }

    /// The script emitted `event`.
    pub fn on_script_emit(&self, event: impl Into<String>, value: ScriptValue) {
        self.signal(EngineSignal::Emit {
            event: event.into(),
            value,
        });
    }

    /// The script asked to exit, or ran out of work.
    pub fn on_script_exit(&self, code: i32) {
        self.signal(EngineSignal::Exit(code));
    }

    /// The script raised an error nothing caught.
    pub fn on_uncaught_fault(&self, description: impl Into<String>) {
        self.signal(EngineSignal::Fault(description.into()));
    }

    /// Load a sub-resource relative to the service's base location.
    pub async fn load_resource(&self, path: &str) -> Result<Vec<u8>, ResolveError> {
        self.resolver
            .load_resource(&self.identity, &self.base, path)
            .await
    }

    fn signal(&self, signal: EngineSignal) {
        // The orchestrator has finished with this instance
        if self.signals.send(signal).is_err() {
            tracing::trace!(service = %self.identity, "Dropping signal from detached script");
        }
    }
}

impl std::fmt::Debug for EngineHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHost")
            .field("identity", &self.identity)
            .field("base", &self.base)
            .finish()
    }
}
