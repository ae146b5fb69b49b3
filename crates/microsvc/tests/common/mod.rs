//! Shared test harness.
//!
//! `ProgramEngine` is a script engine whose "source" is the name of a Rust
//! program registered by the test. Programs run as tokio tasks and talk to the
//! host through a [`ScriptContext`], the same way a real engine would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use microsvc::{
    BridgeError, CompileError, EngineHost, EventPayload, HostConfig, MicroService,
    MicroServiceBuilder, ResolveError, ScriptEngine, ScriptHandle, ScriptSource, ScriptValue,
    ServiceError, ServiceHost,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("microsvc=debug")
        .with_test_writer()
        .try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Program engine
// ─────────────────────────────────────────────────────────────────────────────

type Program = Arc<dyn Fn(ScriptContext) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub struct ProgramEngine {
    programs: Mutex<HashMap<String, Program>>,
    compiled: AtomicUsize,
}

impl ProgramEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F, Fut>(&self, name: &str, program: F)
    where
        F: Fn(ScriptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let program: Program = Arc::new(move |ctx| Box::pin(program(ctx)));
        self.programs.lock().insert(name.to_string(), program);
    }

    /// How many sources compiled successfully.
    pub fn compiled(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScriptEngine for ProgramEngine {
    async fn compile(
        &self,
        source: ScriptSource,
        host: EngineHost,
    ) -> Result<Arc<dyn ScriptHandle>, CompileError> {
        let name = source.text().trim().to_string();
        let program = self
            .programs
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| CompileError(format!("SyntaxError: unknown program '{}'", name)))?;
        self.compiled.fetch_add(1, Ordering::SeqCst);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = ScriptContext {
            host,
            events: events_rx,
        };

        Ok(Arc::new(ProgramHandle {
            events: events_tx,
            pending: Mutex::new(Some((program, ctx))),
            task: Mutex::new(None),
            exit_requests: Mutex::new(Vec::new()),
        }))
    }
}

pub struct ProgramHandle {
    events: mpsc::UnboundedSender<(String, EventPayload)>,
    /// Compiled but not yet started
    pending: Mutex<Option<(Program, ScriptContext)>>,
    task: Mutex<Option<AbortHandle>>,
    exit_requests: Mutex<Vec<i32>>,
}

impl ScriptHandle for ProgramHandle {
    fn run(&self) {
        if let Some((program, ctx)) = self.pending.lock().take() {
            let task = tokio::spawn(program(ctx));
            *self.task.lock() = Some(task.abort_handle());
        }
    }

    fn dispatch_to_script(&self, event: &str, payload: EventPayload) -> Result<(), BridgeError> {
        self.events
            .send((event.to_string(), payload))
            .map_err(|_| BridgeError::Detached)
    }

    fn request_exit(&self, code: i32) {
        self.exit_requests.lock().push(code);
        // Never started
        self.pending.lock().take();
        if let Some(task) = self.task.lock().as_ref() {
            task.abort();
        }
    }
}

/// What a program sees of the host.
pub struct ScriptContext {
    host: EngineHost,
    events: mpsc::UnboundedReceiver<(String, EventPayload)>,
}

impl ScriptContext {
    pub fn emit(&self, event: &str, payload: impl Into<EventPayload>) {
        self.host
            .on_script_emit(event, ScriptValue::from(&payload.into()));
    }

    pub fn emit_raw(&self, event: &str, value: ScriptValue) {
        self.host.on_script_emit(event, value);
    }

    /// Next host event, or `None` once the host has detached.
    pub async fn next_event(&mut self) -> Option<(String, EventPayload)> {
        self.events.recv().await
    }

    /// Wait for a specific event, skipping others.
    pub async fn wait_for(&mut self, name: &str) -> Option<EventPayload> {
        while let Some((event, payload)) = self.next_event().await {
            if event == name {
                return Some(payload);
            }
        }
        None
    }

    pub fn exit(&self, code: i32) {
        self.host.on_script_exit(code);
    }

    pub fn fault(&self, description: &str) {
        self.host.on_uncaught_fault(description);
    }

    pub async fn load(&self, path: &str) -> Result<Vec<u8>, ResolveError> {
        self.host.load_resource(path).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host setup
// ─────────────────────────────────────────────────────────────────────────────

pub fn config(temp: &TempDir) -> HostConfig {
    HostConfig::default()
        .with_cache_dir(temp.path().join("cache"))
        .with_bundle_root(temp.path().join("bundle"))
        .with_fetch_timeout(Duration::from_secs(5))
        .with_start_timeout(Duration::from_secs(5))
}

pub fn host(temp: &TempDir, engine: Arc<ProgramEngine>) -> ServiceHost {
    init_tracing();
    ServiceHost::new(config(temp), engine).expect("http client")
}

/// Write a bundled script and return its `bundle:` URI.
pub fn bundle(temp: &TempDir, name: &str, program: &str) -> String {
    let root = temp.path().join("bundle");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join(name), program).unwrap();
    format!("bundle:{}", name)
}

pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

// ─────────────────────────────────────────────────────────────────────────────
// Observing instances
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Outcome {
    Started,
    Error(ServiceError),
    Exit(i32),
}

/// Attach recording callbacks. The synchronizer is released right away.
pub fn observe(builder: MicroServiceBuilder) -> (MicroService, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (start_tx, error_tx, exit_tx) = (tx.clone(), tx.clone(), tx);
    let svc = builder
        .on_start(move |_, sync| {
            let _ = start_tx.send(Outcome::Started);
            sync.release();
        })
        .on_error(move |_, error| {
            let _ = error_tx.send(Outcome::Error(error.clone()));
        })
        .on_exit(move |_, code| {
            let _ = exit_tx.send(Outcome::Exit(code));
        })
        .build();
    (svc, rx)
}

/// Attach error and exit recorders only; the caller supplies on-start.
pub fn observe_end(builder: MicroServiceBuilder) -> (MicroService, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let error_tx = tx.clone();
    let svc = builder
        .on_error(move |_, error| {
            let _ = error_tx.send(Outcome::Error(error.clone()));
        })
        .on_exit(move |_, code| {
            let _ = tx.send(Outcome::Exit(code));
        })
        .build();
    (svc, rx)
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

/// Wait for the terminal outcome, skipping `Started`.
pub async fn terminal(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    loop {
        match next(rx).await {
            Outcome::Started => continue,
            other => return other,
        }
    }
}

/// Assert nothing further arrives within a short grace period.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(extra)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected callback: {:?}", extra);
    }
}

/// Wait until `svc` reaches `state`.
pub async fn wait_state(svc: &MicroService, state: microsvc::ServiceState) {
    tokio::time::timeout(WAIT, async {
        while svc.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("service never reached {}, stuck in {}", state, svc.state()));
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP fixtures
// ─────────────────────────────────────────────────────────────────────────────

/// Serve `router` on an ephemeral localhost port.
pub async fn serve(router: axum::Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    port
}

/// A localhost port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
