//! Watcher plumbing
//!
//! Watchers receive the full document value after every effective change,
//! except changes originating from the connection a watcher is bound to
//! (echo suppression).

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies a client binding to a link. Real connections start at 2; the
/// two reserved ids below never identify a real connection.
pub type ConnectionId = u32;

/// Suppression target recorded for watch-all watchers: matches no writer,
/// so such watchers are never suppressed.
pub const WATCH_ALL_CONNECTION_ID: ConnectionId = 0;

/// Source id used when applying changes that arrived from the store, so
/// remote updates reach every watcher.
pub const ON_CHANGE_CONNECTION_ID: ConnectionId = 1;

pub(crate) const FIRST_CONNECTION_ID: ConnectionId = 2;

/// Receiving half handed to the client. The first notification is the
/// document value at registration time.
pub struct LinkWatcher {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl LinkWatcher {
    pub(crate) fn new(id: Uuid, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next notification; None once the link is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Already-delivered notification, if any, without waiting.
    pub fn try_next(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

pub(crate) struct WatcherEntry {
    pub id: Uuid,
    /// Connection this watcher lives on; removed when it disconnects.
    /// WATCH_ALL_CONNECTION_ID marks an independent, link-level watcher.
    pub owner: ConnectionId,
    /// Writes from this connection are not echoed back to the watcher.
    pub target: ConnectionId,
    pub tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
pub(crate) struct WatcherRegistry {
    entries: Vec<WatcherEntry>,
}

impl WatcherRegistry {
    pub fn insert(&mut self, entry: WatcherEntry) {
        log::trace!("watcher {} registered on connection {}", entry.id, entry.owner);
        self.entries.push(entry);
    }

    /// Deliver `value` to every watcher not bound to `src`. Watchers whose
    /// receiver has been dropped are pruned here.
    pub fn notify(&mut self, value: &Value, src: ConnectionId) {
        self.entries.retain(|watcher| {
            if watcher.target == src {
                return true;
            }
            watcher.tx.send(value.clone()).is_ok()
        });
    }

    /// Drop every watcher owned by a disconnecting connection.
    pub fn remove_owned_by(&mut self, conn: ConnectionId) {
        self.entries.retain(|watcher| watcher.owner != conn);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(
        owner: ConnectionId,
        target: ConnectionId,
    ) -> (WatcherEntry, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            WatcherEntry {
                id: Uuid::new_v4(),
                owner,
                target,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn notify_suppresses_the_originating_connection() {
        let mut registry = WatcherRegistry::default();
        let (on_a, mut rx_a) = entry(2, 2);
        let (on_b, mut rx_b) = entry(3, 3);
        registry.insert(on_a);
        registry.insert(on_b);

        registry.notify(&json!({"x": 1}), 2);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), json!({"x": 1}));
    }

    #[test]
    fn watch_all_watchers_are_never_suppressed() {
        let mut registry = WatcherRegistry::default();
        let (all, mut rx) = entry(2, WATCH_ALL_CONNECTION_ID);
        registry.insert(all);

        registry.notify(&json!(1), 2);
        registry.notify(&json!(2), ON_CHANGE_CONNECTION_ID);

        assert_eq!(rx.try_recv().unwrap(), json!(1));
        assert_eq!(rx.try_recv().unwrap(), json!(2));
    }

    #[test]
    fn closed_watchers_are_pruned_on_notify() {
        let mut registry = WatcherRegistry::default();
        let (entry_a, rx) = entry(2, 2);
        registry.insert(entry_a);
        drop(rx);

        registry.notify(&json!(1), ON_CHANGE_CONNECTION_ID);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn disconnect_removes_owned_watchers_only() {
        let mut registry = WatcherRegistry::default();
        let (owned, _rx1) = entry(2, 2);
        let (independent, _rx2) = entry(WATCH_ALL_CONNECTION_ID, WATCH_ALL_CONNECTION_ID);
        registry.insert(owned);
        registry.insert(independent);

        registry.remove_owned_by(2);
        assert_eq!(registry.len(), 1);
    }
}
