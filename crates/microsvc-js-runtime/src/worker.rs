//! Worker thread implementation for the JavaScript runtime.
//!
//! This module contains the main event loop that runs in a dedicated thread
//! for each service, handling commands and managing the V8 isolate.
//!
//! The main script is loaded as an ES module together with its static
//! imports, then held until the host sends [`WorkerCommand::Run`].

use std::rc::Rc;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use deno_core::JsRuntime;
use deno_core::ModuleId;
use deno_core::PollEventLoopOptions;
use deno_core::RuntimeOptions;
use deno_core::futures::FutureExt;
use deno_core::serde_v8;
use deno_core::v8;
use tokio::sync::{mpsc, oneshot, watch};

use crate::command::WorkerCommand;
use crate::error::RuntimeError;
use crate::loader::{ResourceModuleLoader, main_specifier};
use crate::ops::{ExitRequest, ServiceContext, microsvc_runtime};

/// Ensure V8 platform is initialized exactly once.
static V8_INIT: Once = Once::new();

/// Serializes V8 isolate creation; concurrent creation can crash V8.
pub(crate) static ISOLATE_CREATE_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Initialize the V8 platform. Safe to call multiple times.
pub fn init_platform() {
    V8_INIT.call_once(|| {
        JsRuntime::init_platform(None, false);
    });
}

/// Everything the worker needs to run one service.
pub(crate) struct WorkerParams {
    pub(crate) name: String,
    pub(crate) source: String,
    pub(crate) context: ServiceContext,
    pub(crate) terminated: Arc<AtomicBool>,
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) init_tx: oneshot::Sender<Result<v8::IsolateHandle, String>>,
}

/// How the script ended.
enum Ending {
    Exit(i32),
    Fault(String),
    /// The host terminated the runtime
    Shutdown,
}

/// The main worker loop that runs inside the spawned thread.
pub(crate) async fn run_worker(params: WorkerParams) -> Result<(), RuntimeError> {
    let WorkerParams {
        name,
        source,
        context,
        terminated,
        mut cmd_rx,
        mut shutdown_rx,
        init_tx,
    } = params;
    let host = context.host.clone();
    let loader = ResourceModuleLoader {
        context: context.clone(),
    };

    let mut js_runtime = {
        let _lock = ISOLATE_CREATE_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(worker = %name, "Creating JsRuntime");
        JsRuntime::new(RuntimeOptions {
            extensions: vec![microsvc_runtime::init_ops_and_esm()],
            module_loader: Some(Rc::new(loader)),
            ..Default::default()
        })
    };

    let isolate_handle = js_runtime.v8_isolate().thread_safe_handle();
    {
        let op_state = js_runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(context);
        state.put(ExitRequest::default());
        state.put(isolate_handle.clone());
    }

    // Load only; a syntax error anywhere in the module graph is reported
    // before anything runs
    let module_id = match load_main(&mut js_runtime, source, host.identity().uri()).await {
        Ok(id) => id,
        Err(e) => {
            let _ = init_tx.send(Err(e.clone()));
            return Err(RuntimeError::JavaScript(e));
        }
    };
    if init_tx.send(Ok(isolate_handle)).is_err() {
        return Err(RuntimeError::ChannelClosed);
    }

    let mut ending = match wait_for_run(&terminated, &mut cmd_rx, &mut shutdown_rx).await {
        Some(early) => {
            tracing::debug!(worker = %name, "Running main module");
            drive(
                &mut js_runtime,
                module_id,
                early,
                &terminated,
                &mut cmd_rx,
                &mut shutdown_rx,
            )
            .await
        }
        None => Ending::Shutdown,
    };
    // A host-side terminate also surfaces as an execution error
    if terminated.load(Ordering::SeqCst) {
        ending = Ending::Shutdown;
    }
    match ending {
        Ending::Exit(code) => {
            tracing::debug!(worker = %name, code, "Script exited");
            host.on_script_exit(code);
        }
        Ending::Fault(description) => {
            tracing::debug!(worker = %name, error = %description, "Script faulted");
            host.on_uncaught_fault(description);
        }
        Ending::Shutdown => tracing::debug!(worker = %name, "Worker shut down by host"),
    }

    terminated.store(true, Ordering::SeqCst);
    tracing::debug!(worker = %name, "Worker finished");
    Ok(())
}

/// Hold the compiled script until the host releases it. Events that arrive
/// first are returned for delivery after top-level code. `None` if the host
/// shut the worker down instead.
async fn wait_for_run(
    terminated: &AtomicBool,
    cmd_rx: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Vec<WorkerCommand>> {
    let mut early = Vec::new();
    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            return None;
        }
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return None;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(WorkerCommand::Run) => return Some(early),
                Some(cmd) => early.push(cmd),
                None => return None,
            },
        }
    }
}

/// Evaluate the main module, then serve host events until the script ends.
async fn drive(
    js_runtime: &mut JsRuntime,
    module_id: ModuleId,
    early: Vec<WorkerCommand>,
    terminated: &AtomicBool,
    cmd_rx: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Ending {
    // Synchronous top-level code has run once this returns
    let mut evaluation = Box::pin(js_runtime.mod_evaluate(module_id));
    let mut evaluated = false;

    if requested_exit(js_runtime).is_none() {
        for cmd in early {
            if let Err(e) = handle_command(js_runtime, cmd) {
                return failure(js_runtime, e);
            }
        }
    }

    // Idle: the event loop has nothing left to do but listeners are waiting
    let mut idle = false;

    loop {
        if *shutdown_rx.borrow() || terminated.load(Ordering::SeqCst) {
            return Ending::Shutdown;
        }
        if let Some(code) = requested_exit(js_runtime) {
            return Ending::Exit(code);
        }

        if idle {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ending::Shutdown;
                    }
                }

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ending::Shutdown };
                    if let Err(e) = handle_command(js_runtime, cmd) {
                        return failure(js_runtime, e);
                    }
                    idle = false;
                }
            }
        } else {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ending::Shutdown;
                    }
                }

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ending::Shutdown };
                    if let Err(e) = handle_command(js_runtime, cmd) {
                        return failure(js_runtime, e);
                    }
                }

                result = &mut evaluation, if !evaluated => {
                    evaluated = true;
                    if let Err(e) = result {
                        return failure(js_runtime, e.to_string());
                    }
                }

                result = js_runtime.run_event_loop(PollEventLoopOptions {
                    wait_for_inspector: false,
                    pump_v8_message_loop: true,
                }) => {
                    if let Err(e) = result {
                        return failure(js_runtime, e.to_string());
                    }
                    if let Some(code) = requested_exit(js_runtime) {
                        return Ending::Exit(code);
                    }
                    if !evaluated {
                        match (&mut evaluation).now_or_never() {
                            Some(Ok(())) => evaluated = true,
                            Some(Err(e)) => return failure(js_runtime, e.to_string()),
                            None => {
                                return failure(
                                    js_runtime,
                                    "Top-level await never resolved".to_string(),
                                )
                            }
                        }
                    }
                    match has_listeners(js_runtime) {
                        Ok(true) => idle = true,
                        // Nothing pending and nobody listening
                        Ok(false) => return Ending::Exit(0),
                        Err(e) => return failure(js_runtime, e),
                    }
                }
            }
        }
    }
}

/// An execution error is an exit if `process.exit` caused it, a fault otherwise.
fn failure(js_runtime: &mut JsRuntime, error: String) -> Ending {
    match requested_exit(js_runtime) {
        Some(code) => Ending::Exit(code),
        None => Ending::Fault(error),
    }
}

fn requested_exit(js_runtime: &mut JsRuntime) -> Option<i32> {
    js_runtime.op_state().borrow().borrow::<ExitRequest>().0
}

// ─────────────────────────────────────────────────────────────────────────────
// JS Execution Functions
// ─────────────────────────────────────────────────────────────────────────────

async fn load_main(
    js_runtime: &mut JsRuntime,
    source: String,
    uri: &str,
) -> Result<ModuleId, String> {
    let specifier = main_specifier(uri).map_err(|e| e.to_string())?;
    js_runtime
        .load_main_es_module_from_code(&specifier, source)
        .await
        .map_err(|e| e.to_string())
}

fn handle_command(js_runtime: &mut JsRuntime, cmd: WorkerCommand) -> Result<(), String> {
    match cmd {
        WorkerCommand::Dispatch {
            event_json,
            payload_json,
        } => {
            let script = format!(
                "globalThis.__microsvc.dispatch({}, {})",
                event_json, payload_json
            );
            js_runtime
                .execute_script("<dispatch>", script)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        // Already running
        WorkerCommand::Run => Ok(()),
    }
}

fn has_listeners(js_runtime: &mut JsRuntime) -> Result<bool, String> {
    let result = js_runtime
        .execute_script("<has_listeners>", "globalThis.__microsvc.hasListeners()")
        .map_err(|e| e.to_string())?;

    let scope = &mut js_runtime.handle_scope();
    let local = v8::Local::new(scope, result);
    serde_v8::from_v8(scope, local).map_err(|e| format!("Failed to deserialize result: {}", e))
}

pub(crate) fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
