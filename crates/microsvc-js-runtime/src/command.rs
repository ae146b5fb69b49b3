//! Commands sent to the runtime worker thread.

/// Commands for a service worker.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Evaluate the main module. Sent once the start gate is released.
    Run,

    /// Deliver a host event to the script's `Host.on` listeners.
    Dispatch {
        /// Event name as a JSON string literal
        event_json: String,
        /// Payload as JSON text
        payload_json: String,
    },
}
