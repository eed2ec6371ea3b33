//! Post-commit event fan-out
//!
//! Subscribers (plugin managers, frontends) register at construction time.
//! Transactions buffer their events and the coordinator emits them only
//! after a successful commit, so observers never see half-applied state.

use tokio::sync::broadcast;

use crate::ledger::ModKey;

/// Events published by the core after a transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A mod was enabled or disabled in the overlay.
    ModActivationChanged { key: ModKey, active: bool },
    /// All materializations were removed from the game directory.
    LinksPurged,
    /// The active profile changed.
    ProfileSwitched { name: String },
}

/// Broadcast channel wrapper. Lagging receivers drop old events rather than
/// blocking the committer.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Send an event; a send with no live subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!("no subscribers for event: {:?}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::LinksPurged);
        assert_eq!(rx.recv().await.unwrap(), CoreEvent::LinksPurged);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(CoreEvent::LinksPurged);
    }
}
