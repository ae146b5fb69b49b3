//! Host-side handle to a service worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use deno_core::v8;
use microsvc::{BridgeError, EventPayload, ScriptHandle};
use tokio::sync::{mpsc, watch};

use crate::command::WorkerCommand;
use crate::worker::json_string;

/// Handle to a running service runtime.
pub struct JsServiceHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    /// Set by the host on terminate and by the worker when it finishes
    pub(crate) terminated: Arc<AtomicBool>,
    /// V8 isolate handle for forced termination
    pub(crate) isolate_handle: v8::IsolateHandle,
}

impl JsServiceHandle {
    /// Terminate the runtime.
    ///
    /// Signals the worker thread to shut down and forcefully terminates V8
    /// execution if it's stuck.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.isolate_handle.terminate_execution();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl ScriptHandle for JsServiceHandle {
    fn run(&self) {
        if self.cmd_tx.send(WorkerCommand::Run).is_err() {
            tracing::debug!("Worker finished before it was started");
        }
    }

    fn dispatch_to_script(&self, event: &str, payload: EventPayload) -> Result<(), BridgeError> {
        if self.is_terminated() {
            return Err(BridgeError::Detached);
        }
        let payload_json = serde_json::Value::from(payload).to_string();
        self.cmd_tx
            .send(WorkerCommand::Dispatch {
                event_json: json_string(event),
                payload_json,
            })
            .map_err(|_| BridgeError::Detached)
    }

    fn request_exit(&self, code: i32) {
        tracing::debug!(code, "Terminating script runtime");
        self.terminate();
    }
}

impl Drop for JsServiceHandle {
    fn drop(&mut self) {
        // The worker thread is detached; it exits once V8 is terminated
        self.terminate();
    }
}

impl std::fmt::Debug for JsServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsServiceHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
