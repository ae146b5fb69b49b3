//! Event Bridge
//!
//! Bidirectional pub/sub between the host and one running script. Host
//! listeners are kept per event name in registration order; script-side
//! values are marshalled into [`EventPayload`]s before any listener runs.
//! Host events emitted while the instance is still starting are queued and
//! handed to the script when the bridge opens.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::ScriptHandle;
use crate::error::BridgeError;
use crate::payload::{EventPayload, ScriptValue};

/// A host-side listener. `T` is the owner passed back to the callback.
pub(crate) type ListenerFn<T> = Arc<dyn Fn(&T, &str, &EventPayload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Listeners may be registered, host events are queued
    Pending,
    /// Events flow both ways
    Open,
    /// Terminal; listeners are dropped and never invoked
    Closed,
}

struct Inner<T> {
    phase: Phase,
    listeners: HashMap<String, Vec<ListenerFn<T>>>,
    handle: Option<Arc<dyn ScriptHandle>>,
    queued: Vec<(String, EventPayload)>,
}

pub(crate) struct EventBridge<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> EventBridge<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Pending,
                listeners: HashMap::new(),
                handle: None,
                queued: Vec::new(),
            }),
        }
    }

    /// Register a listener. Ignored once the bridge is closed.
    pub(crate) fn add_listener(&self, event: &str, listener: ListenerFn<T>) {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::Closed {
            tracing::debug!(event, "Listener registered after termination is never invoked");
            return;
        }
        inner
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    pub(crate) fn attach(&self, handle: Arc<dyn ScriptHandle>) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Closed {
            inner.handle = Some(handle);
        }
    }

    /// Start delivery, flushing host events queued while starting.
    pub(crate) fn open(&self) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Pending {
            return;
        }
        inner.phase = Phase::Open;

        let queued = std::mem::take(&mut inner.queued);
        if let Some(handle) = &inner.handle {
            // Flushed under the lock so later emits cannot overtake
            for (event, payload) in queued {
                if let Err(e) = handle.dispatch_to_script(&event, payload) {
                    tracing::warn!(event, error = %e, "Dropping queued host event");
                }
            }
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.lock().phase == Phase::Open
    }

    /// Stop delivery in both directions and hand back the script handle.
    pub(crate) fn close(&self) -> Option<Arc<dyn ScriptHandle>> {
        let mut inner = self.inner.lock();
        inner.phase = Phase::Closed;
        inner.listeners.clear();
        inner.queued.clear();
        inner.handle.take()
    }

    /// Send a host event to the script. Queued while the script is compiled
    /// but not yet running; detached before compilation and after close.
    pub(crate) fn emit(&self, event: &str, payload: EventPayload) -> Result<(), BridgeError> {
        let handle = {
            let mut inner = self.inner.lock();
            match (&inner.phase, &inner.handle) {
                (Phase::Open, Some(handle)) => handle.clone(),
                (Phase::Pending, Some(_)) => {
                    inner.queued.push((event.to_string(), payload));
                    return Ok(());
                }
                _ => return Err(BridgeError::Detached),
            }
        };
        handle.dispatch_to_script(event, payload)
    }

    /// Marshal a script-emitted value and run the matching listeners in
    /// registration order. Returns how many listeners ran.
    pub(crate) fn dispatch(&self, owner: &T, event: &str, value: &ScriptValue) -> usize {
        let listeners = {
            let inner = self.inner.lock();
            if inner.phase != Phase::Open {
                return 0;
            }
            match inner.listeners.get(event) {
                Some(listeners) if !listeners.is_empty() => listeners.clone(),
                _ => return 0,
            }
        };

        let payload = match value.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(event, error = %e, "Dropping script event that cannot be marshalled");
                return 0;
            }
        };

        // Listeners run outside the lock so they can register more listeners
        // or emit back to the script.
        let mut invoked = 0;
        for listener in listeners {
            if !self.is_open() {
                break;
            }
            listener(owner, event, &payload);
            invoked += 1;
        }
        invoked
    }
}
