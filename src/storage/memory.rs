//! In-memory ledger
//!
//! Backs tests and single-process demos. Every write is routed to all
//! matching prefix subscribers, own writes included, which is exactly what
//! the link's echo detection relies on. Two links sharing one MemoryLedger
//! behave like two devices behind a fully synchronized store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Ledger, RecordEvent, StoreError};

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, Vec<u8>>,
    watchers: Vec<PrefixWatcher>,
}

struct PrefixWatcher {
    prefix: String,
    tx: mpsc::UnboundedSender<RecordEvent>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn put_record(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Closed)?;
        inner.records.insert(key.to_string(), value.clone());
        // Dead subscribers drop out here.
        inner.watchers.retain(|watcher| {
            if !key.starts_with(&watcher.prefix) {
                return true;
            }
            watcher.tx.send((key.to_string(), value.clone())).is_ok()
        });
        Ok(())
    }

    async fn get_snapshot(&self, prefix: &str) -> Result<Vec<RecordEvent>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Closed)?;
        Ok(inner
            .records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn watch_prefix(&self, prefix: &str) -> mpsc::UnboundedReceiver<RecordEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.watchers.push(PrefixWatcher {
                prefix: prefix.to_string(),
                tx,
            });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_is_scoped_to_the_prefix_and_sorted() {
        let store = MemoryLedger::new();
        store.put_record("a/2", b"two".to_vec()).await.unwrap();
        store.put_record("a/1", b"one".to_vec()).await.unwrap();
        store.put_record("b/1", b"other".to_vec()).await.unwrap();

        let snapshot = store.get_snapshot("a/").await.unwrap();
        let keys: Vec<&str> = snapshot.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn watchers_see_own_writes_under_their_prefix() {
        let store = MemoryLedger::new();
        let mut rx = store.watch_prefix("a/");

        store.put_record("a/1", b"one".to_vec()).await.unwrap();
        store.put_record("b/1", b"other".to_vec()).await.unwrap();

        let (key, value) = rx.recv().await.unwrap();
        assert_eq!(key, "a/1");
        assert_eq!(value, b"one");
        assert!(rx.try_recv().is_err());
    }
}
