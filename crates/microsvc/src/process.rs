//! Process handle: host-side exit control for one instance.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::EventBridge;
use crate::service::MicroService;
use crate::state::{Lifecycle, ServiceState};

/// Messages from public handles to the orchestrator task.
#[derive(Debug)]
pub(crate) enum Control {
    Exit(i32),
}

/// Host-side control of a running script.
#[derive(Clone)]
pub struct Process {
    lifecycle: Arc<Lifecycle>,
    bridge: Arc<EventBridge<MicroService>>,
    control: mpsc::UnboundedSender<Control>,
}

impl Process {
    pub(crate) fn new(
        lifecycle: Arc<Lifecycle>,
        bridge: Arc<EventBridge<MicroService>>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            lifecycle,
            bridge,
            control,
        }
    }

    /// Ask the script to exit with `code`.
    ///
    /// Only valid while the instance is running. Moves the instance to
    /// EXITING at once: listeners still queued for the current event are
    /// skipped and host emits fail. The first code latched wins; returns
    /// `false` when the request was ignored.
    pub fn exit(&self, code: i32) -> bool {
        if !self
            .lifecycle
            .transition(ServiceState::Running, ServiceState::Exiting)
        {
            tracing::debug!(code, state = %self.lifecycle.state(), "Ignoring exit request");
            return false;
        }
        if !self.lifecycle.latch_exit(code) {
            return false;
        }
        self.bridge.close();
        self.control.send(Control::Exit(code)).is_ok()
    }

    /// Exit code, once latched.
    pub fn exit_code(&self) -> Option<i32> {
        self.lifecycle.exit_code()
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(lifecycle: Arc<Lifecycle>) -> (Process, mpsc::UnboundedReceiver<Control>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Process::new(lifecycle, Arc::new(EventBridge::new()), tx), rx)
    }

    #[test]
    fn test_exit_before_running_is_ignored() {
        let lifecycle = Arc::new(Lifecycle::new());
        let (process, mut rx) = process(lifecycle.clone());

        assert!(!process.exit(1));
        assert_eq!(process.exit_code(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_exit_latches_first_code() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set_state(ServiceState::Running);
        let (process, mut rx) = process(lifecycle);

        assert!(process.exit(2));
        assert_eq!(process.state(), ServiceState::Exiting);
        assert!(!process.exit(7));
        assert_eq!(process.exit_code(), Some(2));
        assert!(matches!(rx.try_recv(), Ok(Control::Exit(2))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_exit_closes_the_bridge() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set_state(ServiceState::Running);
        let (process, _rx) = process(lifecycle);
        process.bridge.open();
        assert!(process.bridge.is_open());

        assert!(process.exit(0));
        assert!(!process.bridge.is_open());
    }
}
