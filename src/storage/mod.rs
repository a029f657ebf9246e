//! Persistence adapter for the synchronized key-value store
//!
//! Links consume the replicated store through this narrow contract: write
//! one record, snapshot a prefix, watch a prefix. The store's own
//! replication and conflict handling live behind it and are not modeled
//! here.

mod memory;

pub use memory::MemoryLedger;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying read or write failure. The in-memory ledger never fails
    /// this way; disk- or network-backed implementations surface their
    /// transport errors here.
    #[error("store I/O failed: {0}")]
    Io(String),

    #[error("store closed")]
    Closed,
}

/// One change notification: full record key and serialized record bytes.
pub type RecordEvent = (String, Vec<u8>);

/// The versioned key-value store a link persists its change log into.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Write one entry.
    async fn put_record(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Point-in-time read of every entry under `prefix`, ascending by key.
    async fn get_snapshot(&self, prefix: &str) -> Result<Vec<RecordEvent>, StoreError>;

    /// Push notifications for every write under `prefix`. Own writes are
    /// included; echo detection in the link depends on that.
    fn watch_prefix(&self, prefix: &str) -> mpsc::UnboundedReceiver<RecordEvent>;
}
