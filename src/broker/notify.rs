//! Tab notifications (`AccountsChanged`, `Disconnected`).

use tokio::sync::broadcast;

use crate::broker::{BridgeEvent, Origin, TabEvent, TabId};

/// Delivers events to the tabs of a site. Fire-and-forget: a tab that is
/// not listening simply misses the event.
pub trait TabNotifier: Send + Sync {
    fn notify(&self, event: BridgeEvent);

    /// Send `event` to one tab, or to every tab of `origin` when `tab_id` is `None`.
    fn notify_tab(&self, origin: &Origin, tab_id: Option<TabId>, event: TabEvent) {
        self.notify(BridgeEvent {
            origin: origin.clone(),
            tab_id,
            event,
        });
    }
}

/// In-process fan-out backed by a tokio broadcast channel. Each bridge
/// event stream subscribes and filters for its own origin and tab.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<BridgeEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl TabNotifier for BroadcastNotifier {
    fn notify(&self, event: BridgeEvent) {
        let delivered = self.tx.send(event.clone()).unwrap_or(0);
        tracing::debug!(
            origin = %event.origin,
            tab_id = ?event.tab_id,
            event = ?event.event,
            delivered,
            "Tab notification sent"
        );
    }
}
