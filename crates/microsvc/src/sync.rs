//! Start gate.
//!
//! A [`Synchronizer`] is handed to the on-start callbacks. Until it is
//! released, events the script emits stay queued, so listeners registered
//! during start-up (even asynchronously) never miss the first event.

use std::sync::Arc;

use tokio::sync::watch;

/// One-shot, host-controlled start gate.
///
/// Clones share the same gate. Dropping every clone without calling
/// [`release`](Self::release) abandons the start.
#[derive(Clone)]
pub struct Synchronizer {
    tx: Arc<watch::Sender<bool>>,
}

impl Synchronizer {
    pub(crate) fn new() -> (Self, StartGate) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, StartGate { rx })
    }

    /// Signal that start-up is complete. Later calls are no-ops.
    pub fn release(&self) {
        self.tx.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        });
    }

    pub fn is_released(&self) -> bool {
        *self.tx.borrow()
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("released", &self.is_released())
            .finish()
    }
}

/// How the gate opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateOutcome {
    Released,
    /// Every synchronizer was dropped unreleased
    Abandoned,
}

/// Orchestrator side of a [`Synchronizer`].
pub(crate) struct StartGate {
    rx: watch::Receiver<bool>,
}

impl StartGate {
    pub(crate) async fn wait(mut self) -> GateOutcome {
        match self.rx.wait_for(|released| *released).await {
            Ok(_) => GateOutcome::Released,
            Err(_) => GateOutcome::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_opens_gate() {
        let (sync, gate) = Synchronizer::new();
        let waiter = tokio::spawn(gate.wait());
        sync.release();
        sync.release();
        assert!(sync.is_released());
        assert_eq!(waiter.await.unwrap(), GateOutcome::Released);
    }

    #[tokio::test]
    async fn test_released_then_dropped_is_still_released() {
        let (sync, gate) = Synchronizer::new();
        sync.clone().release();
        drop(sync);
        assert_eq!(gate.wait().await, GateOutcome::Released);
    }

    #[tokio::test]
    async fn test_dropping_all_clones_abandons() {
        let (sync, gate) = Synchronizer::new();
        let other = sync.clone();
        drop(sync);
        let waiter = tokio::spawn(gate.wait());
        tokio::task::yield_now().await;
        drop(other);
        assert_eq!(waiter.await.unwrap(), GateOutcome::Abandoned);
    }
}
