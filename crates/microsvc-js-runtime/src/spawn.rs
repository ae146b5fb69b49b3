//! Runtime spawn functions.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use microsvc::{EngineHost, ScriptSource};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::RuntimeError;
use crate::handle::JsServiceHandle;
use crate::ops::ServiceContext;
use crate::worker::{WorkerParams, init_platform, run_worker};

/// Spawn a dedicated worker thread for one service and wait until its module
/// graph has loaded. Nothing runs until the handle's `run` is called.
///
/// Must be called from within the host's tokio runtime; sub-resource loads
/// are executed there.
pub async fn spawn_service_runtime(
    name: String,
    source: ScriptSource,
    host: EngineHost,
) -> Result<JsServiceHandle, RuntimeError> {
    tracing::debug!(worker = %name, service = %source.identity, "Spawning service runtime");
    init_platform();

    let terminated = Arc::new(AtomicBool::new(false));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (init_tx, init_rx) = oneshot::channel();

    let params = WorkerParams {
        name: name.clone(),
        source: source.text(),
        context: ServiceContext {
            host,
            host_runtime: tokio::runtime::Handle::current(),
        },
        terminated: terminated.clone(),
        cmd_rx,
        shutdown_rx,
        init_tx,
    };

    let thread_name = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<(), RuntimeError> {
            tracing::debug!(worker = %thread_name, "Thread started");

            // Each service gets its own single-threaded tokio runtime
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::SpawnFailed)?;

            let result = rt.block_on(run_worker(params));

            rt.shutdown_background();
            tracing::debug!(worker = %thread_name, "Thread exiting");
            result
        })?;

    let isolate_handle = init_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::JavaScript)?;

    tracing::debug!(worker = %name, "Service runtime ready");

    Ok(JsServiceHandle {
        cmd_tx,
        shutdown_tx,
        terminated,
        isolate_handle,
    })
}
