//! Deno ops for the service runtime.
//!
//! Ops are the bridge between JavaScript and Rust. The [`EngineHost`] of the
//! service is stored in OpState; ops report to it directly.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::error::{AnyError, generic_error};
use deno_core::{OpState, op2, v8};
use microsvc::{EngineHost, ScriptValue};

/// Host callbacks for the service this runtime belongs to.
#[derive(Clone)]
pub(crate) struct ServiceContext {
    pub(crate) host: EngineHost,
    /// Runtime that owns the host's I/O resources
    pub(crate) host_runtime: tokio::runtime::Handle,
}

/// Exit code requested through `process.exit`.
#[derive(Debug, Default)]
pub(crate) struct ExitRequest(pub(crate) Option<i32>);

/// Synchronous logging op - writes `console.*` output to tracing.
#[op2(fast)]
pub fn op_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    let service = state.borrow::<ServiceContext>().host.identity();
    match level {
        "error" => tracing::error!(target: "microsvc.js", service = %service, "{}", msg),
        "warn" => tracing::warn!(target: "microsvc.js", service = %service, "{}", msg),
        "debug" => tracing::debug!(target: "microsvc.js", service = %service, "{}", msg),
        "trace" => tracing::trace!(target: "microsvc.js", service = %service, "{}", msg),
        _ => tracing::info!(target: "microsvc.js", service = %service, "{}", msg),
    }
}

/// Emit an event to the host. `value` is a flattened value graph as JSON.
#[op2]
pub fn op_host_emit(
    state: &mut OpState,
    #[string] event: String,
    #[string] value: String,
) -> Result<(), AnyError> {
    let value: ScriptValue = serde_json::from_str(&value)
        .map_err(|e| generic_error(format!("Malformed event value: {}", e)))?;
    state
        .borrow::<ServiceContext>()
        .host
        .on_script_emit(event, value);
    Ok(())
}

/// Record the exit code and stop executing JavaScript.
#[op2(fast)]
pub fn op_host_exit(state: &mut OpState, code: i32) {
    let request = state.borrow_mut::<ExitRequest>();
    if request.0.is_none() {
        request.0 = Some(code);
    }
    state.borrow::<v8::IsolateHandle>().terminate_execution();
}

/// Load a sub-resource relative to the service's base location.
#[op2(async)]
#[string]
pub async fn op_host_load(
    state: Rc<RefCell<OpState>>,
    #[string] path: String,
) -> Result<String, AnyError> {
    let ctx = state.borrow().borrow::<ServiceContext>().clone();

    // Fetching happens on the host runtime, which owns the HTTP client
    let bytes = ctx
        .host_runtime
        .spawn(async move { ctx.host.load_resource(&path).await })
        .await
        .map_err(|e| generic_error(e.to_string()))?
        .map_err(|e| generic_error(e.to_string()))?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

deno_core::extension!(
    microsvc_runtime,
    ops = [op_log, op_host_emit, op_host_exit, op_host_load],
    esm_entry_point = "ext:microsvc_runtime/bootstrap.js",
    esm = [dir "src", "bootstrap.js"],
);
