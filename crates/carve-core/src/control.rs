use std::sync::Arc;

use tokio::sync::watch;

use crate::models::SystemState;

/// Shared run/pause switch.
///
/// Cloning is cheap and every clone observes the same state. Waiters are
/// woken when the state changes, so paused workers do not poll.
#[derive(Debug, Clone)]
pub struct SystemControl {
    tx: Arc<watch::Sender<SystemState>>,
}

impl Default for SystemControl {
    fn default() -> Self {
        Self::new(SystemState::Running)
    }
}

impl SystemControl {
    pub fn new(initial: SystemState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> SystemState {
        *self.tx.borrow()
    }

    /// Set the state. Returns the previous one.
    pub fn set(&self, state: SystemState) -> SystemState {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "System state changed");
        }
        previous
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.tx.subscribe()
    }

    /// Resolve once the state is `Running`. Returns immediately if it
    /// already is.
    pub async fn wait_until_running(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| *s == SystemState::Running).await;
    }
}
