//! Service lifecycle state.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

// ─────────────────────────────────────────────────────────────────────────────
// Service State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceState {
    /// Built but not started
    Created = 0,
    /// Turning the URI into source
    Resolving = 1,
    /// Compiling and waiting for the synchronizer
    Starting = 2,
    /// Script is running and events flow both ways
    Running = 3,
    /// An exit code has been latched, listeners no longer run
    Exiting = 4,
    /// on-exit has fired
    Exited = 5,
    /// on-error has fired
    Error = 6,
}

impl ServiceState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Resolving,
            2 => Self::Starting,
            3 => Self::Running,
            4 => Self::Exiting,
            5 => Self::Exited,
            _ => Self::Error,
        }
    }

    /// Check if the service is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Exited | ServiceState::Error)
    }

    /// Check if the service is running
    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "created"),
            ServiceState::Resolving => write!(f, "resolving"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Exiting => write!(f, "exiting"),
            ServiceState::Exited => write!(f, "exited"),
            ServiceState::Error => write!(f, "error"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

const NO_EXIT_CODE: i64 = i64::MIN;

/// State and exit code of one instance, shared lock-free between the
/// orchestrator task and the public handles.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    exit_code: AtomicI64,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ServiceState::Created as u8),
            exit_code: AtomicI64::new(NO_EXIT_CODE),
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`. Fails if another transition got there first.
    pub(crate) fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Latch `code` unless a code is already latched. Returns whether this
    /// call set it.
    pub(crate) fn latch_exit(&self, code: i32) -> bool {
        self.exit_code
            .compare_exchange(NO_EXIT_CODE, code as i64, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        match self.exit_code.load(Ordering::SeqCst) {
            NO_EXIT_CODE => None,
            code => Some(code as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrips_through_u8() {
        for state in [
            ServiceState::Created,
            ServiceState::Resolving,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Exiting,
            ServiceState::Exited,
            ServiceState::Error,
        ] {
            assert_eq!(ServiceState::from_u8(state as u8), state);
        }
        assert!(ServiceState::Exited.is_terminal());
        assert!(ServiceState::Error.is_terminal());
        assert!(!ServiceState::Exiting.is_terminal());
    }

    #[test]
    fn test_first_exit_code_wins() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.exit_code(), None);
        assert!(lifecycle.latch_exit(3));
        assert!(!lifecycle.latch_exit(0));
        assert_eq!(lifecycle.exit_code(), Some(3));
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition(ServiceState::Created, ServiceState::Resolving));
        assert!(!lifecycle.transition(ServiceState::Created, ServiceState::Resolving));
        assert_eq!(lifecycle.state(), ServiceState::Resolving);
    }
}
