//! MicroService
//!
//! One service instance and the task that drives it through its lifecycle:
//!
//! ```text
//! CREATED → RESOLVING → STARTING → RUNNING → EXITING → EXITED
//!               ↘           ↘          ↘
//!                 ─────────── ERROR ────
//! ```
//!
//! `start()` only spawns the orchestrator task. Every callback of an instance
//! (on-start, listeners, on-error, on-exit) runs on that one task, so they
//! never overlap. The script is compiled during STARTING but its top-level
//! code only runs once the [`Synchronizer`] is released.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::{EventBridge, ListenerFn};
use crate::engine::{EngineHost, EngineSignal, ScriptHandle};
use crate::error::{BridgeError, ResolveError, ServiceError, ServiceResult};
use crate::host::HostShared;
use crate::identity::ServiceIdentity;
use crate::payload::EventPayload;
use crate::process::{Control, Process};
use crate::state::{Lifecycle, ServiceState};
use crate::sync::{GateOutcome, Synchronizer};

type StartFn = Box<dyn Fn(&MicroService, Synchronizer) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&MicroService, &ServiceError) + Send + Sync>;
type ExitFn = Box<dyn Fn(&MicroService, i32) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_start: Vec<StartFn>,
    on_error: Vec<ErrorFn>,
    on_exit: Vec<ExitFn>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder returned by [`ServiceHost::service`](crate::ServiceHost::service).
#[must_use]
pub struct MicroServiceBuilder {
    host: Arc<HostShared>,
    uri: String,
    callbacks: Callbacks,
}

impl MicroServiceBuilder {
    pub(crate) fn new(host: Arc<HostShared>, uri: &str) -> Self {
        Self {
            host,
            uri: uri.to_string(),
            callbacks: Callbacks::default(),
        }
    }

    /// Called once the script is compiled. Event delivery starts when the
    /// [`Synchronizer`] is released. With no on-start callback the gate opens
    /// immediately.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&MicroService, Synchronizer) + Send + Sync + 'static,
    {
        self.callbacks.on_start.push(Box::new(f));
        self
    }

    /// Called when the instance fails. Never followed by on-exit.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MicroService, &ServiceError) + Send + Sync + 'static,
    {
        self.callbacks.on_error.push(Box::new(f));
        self
    }

    /// Called exactly once with the exit code when the script exits.
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&MicroService, i32) + Send + Sync + 'static,
    {
        self.callbacks.on_exit.push(Box::new(f));
        self
    }

    pub fn build(self) -> MicroService {
        let lifecycle = Arc::new(Lifecycle::new());
        let bridge = Arc::new(EventBridge::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        MicroService {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                identity: ServiceIdentity::parse(&self.uri),
                uri: self.uri,
                process: Process::new(lifecycle.clone(), bridge.clone(), control_tx),
                lifecycle,
                bridge,
                pending: Mutex::new(Some((self.callbacks, control_rx))),
                host: self.host,
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MicroService
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    id: Uuid,
    uri: String,
    /// Parse failures are reported through on-error when started
    identity: Result<ServiceIdentity, ResolveError>,
    lifecycle: Arc<Lifecycle>,
    bridge: Arc<EventBridge<MicroService>>,
    process: Process,
    /// Moved into the orchestrator task by `start()`
    pending: Mutex<Option<(Callbacks, mpsc::UnboundedReceiver<Control>)>>,
    host: Arc<HostShared>,
}

/// A service instance. Cheap to clone; clones refer to the same instance.
#[derive(Clone)]
pub struct MicroService {
    inner: Arc<Inner>,
}

impl MicroService {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Parsed identity, or `None` if the URI is invalid.
    pub fn identity(&self) -> Option<&ServiceIdentity> {
        self.inner.identity.as_ref().ok()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lifecycle.state()
    }

    /// Latched exit code, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lifecycle.exit_code()
    }

    pub fn process(&self) -> &Process {
        &self.inner.process
    }

    /// Start the instance. Returns immediately; progress is reported through
    /// the callbacks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> ServiceResult<()> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ServiceError::NoRuntime)?;

        if !self
            .inner
            .lifecycle
            .transition(ServiceState::Created, ServiceState::Resolving)
        {
            return Err(ServiceError::AlreadyStarted(self.inner.uri.clone()));
        }
        let Some((callbacks, control)) = self.inner.pending.lock().take() else {
            return Err(ServiceError::AlreadyStarted(self.inner.uri.clone()));
        };

        self.inner.host.register(self);

        let span = tracing::info_span!("service", instance = %self.inner.id, uri = %self.inner.uri);
        let orchestrator = Orchestrator {
            svc: self.clone(),
            callbacks,
            control,
        };
        runtime.spawn(orchestrator.run().instrument(span));
        Ok(())
    }

    /// Listen for `event` from the script.
    ///
    /// Listeners registered after the instance has terminated are accepted
    /// but never invoked.
    pub fn add_event_listener<F>(&self, event: &str, listener: F)
    where
        F: Fn(&MicroService, &str, &EventPayload) + Send + Sync + 'static,
    {
        let listener: ListenerFn<MicroService> = Arc::new(listener);
        self.inner.bridge.add_listener(event, listener);
    }

    /// Send `event` to the script.
    ///
    /// Events emitted from on-start are queued and delivered after the
    /// script's top-level code has run.
    pub fn emit(&self, event: &str, payload: impl Into<EventPayload>) -> Result<(), BridgeError> {
        self.inner.bridge.emit(event, payload.into())
    }

    /// Send `event` with a null payload.
    pub fn emit_null(&self, event: &str) -> Result<(), BridgeError> {
        self.emit(event, EventPayload::Null)
    }
}

impl std::fmt::Debug for MicroService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroService")
            .field("id", &self.inner.id)
            .field("uri", &self.inner.uri)
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

struct Orchestrator {
    svc: MicroService,
    callbacks: Callbacks,
    control: mpsc::UnboundedReceiver<Control>,
}

impl Orchestrator {
    async fn run(mut self) {
        self.drive().await;
        self.svc.inner.host.unregister(&self.svc);
    }

    async fn drive(&mut self) {
        let inner = self.svc.inner.clone();

        tracing::debug!(state = %ServiceState::Resolving, "Resolving service");
        let identity = match &inner.identity {
            Ok(identity) => identity.clone(),
            Err(e) => return self.fail(ServiceError::Resolution(e.clone())),
        };
        let source = match inner.host.resolver.resolve(&identity).await {
            Ok(source) => source,
            Err(e) => return self.fail(e.into()),
        };

        inner.lifecycle.set_state(ServiceState::Starting);
        tracing::debug!(state = %ServiceState::Starting, base = %source.base, "Compiling service");

        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let engine_host = EngineHost::new(&source, inner.host.resolver.clone(), signal_tx);
        let handle = match inner.host.engine.compile(source, engine_host).await {
            Ok(handle) => handle,
            Err(e) => return self.fail(e.into()),
        };
        inner.bridge.attach(handle.clone());

        let (sync, gate) = Synchronizer::new();
        if self.callbacks.on_start.is_empty() {
            sync.release();
        }
        for on_start in &self.callbacks.on_start {
            on_start(&self.svc, sync.clone());
        }
        drop(sync);

        let start_timeout = inner.host.config.start_timeout();
        match tokio::time::timeout(start_timeout, gate.wait()).await {
            Ok(GateOutcome::Released) => {}
            Ok(GateOutcome::Abandoned) => return self.fail(ServiceError::StartAbandoned),
            Err(_) => return self.fail(ServiceError::StartTimedOut(start_timeout)),
        }

        inner.lifecycle.set_state(ServiceState::Running);
        handle.run();
        inner.bridge.open();
        tracing::info!(state = %ServiceState::Running, "Service running");

        self.run_loop(&handle, &mut signals).await;
    }

    async fn run_loop(
        &mut self,
        handle: &Arc<dyn ScriptHandle>,
        signals: &mut mpsc::UnboundedReceiver<EngineSignal>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(Control::Exit(code)) = self.control.recv() => {
                    tracing::debug!(code, "Host requested exit");
                    return self.exit(handle, code);
                }

                signal = signals.recv() => match signal {
                    Some(EngineSignal::Emit { event, value }) => {
                        let invoked = self.svc.inner.bridge.dispatch(&self.svc, &event, &value);
                        tracing::trace!(event = %event, listeners = invoked, "Dispatched script event");
                    }
                    Some(EngineSignal::Exit(code)) => return self.exit(handle, code),
                    Some(EngineSignal::Fault(description)) => return self.fault(description),
                    None => return self.fault("script engine detached".to_string()),
                },
            }
        }
    }

    fn exit(&self, handle: &Arc<dyn ScriptHandle>, code: i32) {
        let lifecycle = &self.svc.inner.lifecycle;
        lifecycle.latch_exit(code);
        let code = lifecycle.exit_code().unwrap_or(code);

        lifecycle.set_state(ServiceState::Exiting);
        self.svc.inner.bridge.close();
        handle.request_exit(code);

        lifecycle.set_state(ServiceState::Exited);
        tracing::info!(code, state = %ServiceState::Exited, "Service exited");
        for on_exit in &self.callbacks.on_exit {
            on_exit(&self.svc, code);
        }
    }

    fn fault(&self, description: String) {
        self.svc.inner.lifecycle.latch_exit(1);
        self.fail(ServiceError::RuntimeFault(description));
    }

    fn fail(&self, error: ServiceError) {
        let inner = &self.svc.inner;
        if let Some(handle) = inner.bridge.close() {
            handle.request_exit(inner.lifecycle.exit_code().unwrap_or(1));
        }
        inner.lifecycle.set_state(ServiceState::Error);
        tracing::warn!(error = %error, state = %ServiceState::Error, "Service failed");
        for on_error in &self.callbacks.on_error {
            on_error(&self.svc, &error);
        }
    }
}
