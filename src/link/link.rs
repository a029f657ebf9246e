//! The link document store
//!
//! A Link holds one shared JSON document, its unconfirmed local changes and
//! the machinery that keeps the document converging across devices. Every
//! mutation, whether a local API call or a remote change notification, runs as an
//! operation on the link's own OperationQueue, so the document is only ever
//! touched by one logical step at a time.
//!
//! Local writes are applied in memory first, recorded as ChangeRecords with
//! locally generated keys, and persisted asynchronously. Remote records are
//! merged incrementally when they arrive in key order; a record older than
//! the latest applied key triggers a full replay of the change log merged
//! with the still-unconfirmed local changes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::operation::OperationQueue;
use crate::storage::Ledger;

use super::change::{merge_sorted, ChangeRecord, KeyGenerator, OrderedKey};
use super::document;
use super::entity;
use super::schema::SchemaValidator;
use super::watcher::{
    ConnectionId, LinkWatcher, WatcherEntry, WatcherRegistry, FIRST_CONNECTION_ID,
    ON_CHANGE_CONNECTION_ID, WATCH_ALL_CONNECTION_ID,
};
use super::LinkPath;

/// Creation-time settings for a link.
#[derive(Clone, Debug, Default)]
pub struct LinkConfig {
    /// Seed value, as JSON text, applied as a single synthetic Set when the
    /// change log turns out to be empty on first load.
    pub initial_data: Option<String>,

    /// When set, only primary connections may write.
    pub read_only_for_others: bool,
}

/// One shared JSON document plus its change history, scoped to one
/// identity. Requires a running tokio runtime.
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    path: LinkPath,
    config: LinkConfig,
    store: Arc<dyn Ledger>,
    queue: OperationQueue,
    state: Mutex<LinkState>,
}

struct LinkState {
    doc: Value,
    /// Local changes not yet observed coming back from the store, ascending
    /// by key.
    pending: Vec<ChangeRecord>,
    /// Key of the most recently applied record; a remote key below this one
    /// means the store observed history out of order and we must replay.
    latest_key: Option<OrderedKey>,
    keys: KeyGenerator,
    watchers: WatcherRegistry,
    connections: Vec<ConnectionId>,
    primary_ids: HashSet<ConnectionId>,
    next_connection_id: ConnectionId,
    /// False until the initial reload completes; connection requests made
    /// before that are buffered in arrival order.
    ready: bool,
    pending_connects: Vec<(bool, oneshot::Sender<LinkConnection>)>,
    schema: Option<SchemaValidator>,
    orphaned_handler: Option<Box<dyn Fn() + Send>>,
}

impl Link {
    pub fn new(path: LinkPath, config: LinkConfig, store: Arc<dyn Ledger>) -> Self {
        Self::with_key_generator(path, config, store, KeyGenerator::new())
    }

    /// Like `new`, with an injected key generator for deterministic tests.
    pub fn with_key_generator(
        path: LinkPath,
        config: LinkConfig,
        store: Arc<dyn Ledger>,
        keys: KeyGenerator,
    ) -> Self {
        let queue = OperationQueue::new(path.link_key());
        let inner = Arc::new(LinkInner {
            path,
            config,
            store,
            queue,
            state: Mutex::new(LinkState {
                doc: Value::Null,
                pending: Vec::new(),
                latest_key: None,
                keys,
                watchers: WatcherRegistry::default(),
                connections: Vec::new(),
                primary_ids: HashSet::new(),
                next_connection_id: FIRST_CONNECTION_ID,
                ready: false,
                pending_connects: Vec::new(),
                schema: None,
                orphaned_handler: None,
            }),
        });

        inner.queue.enqueue("Link::ReloadCall", reload(Arc::downgrade(&inner)));

        // Remote change notifications feed the same queue as local calls.
        let mut changes = inner.store.watch_prefix(&inner.path.record_prefix());
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some((key, value)) = changes.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner
                    .queue
                    .enqueue("Link::ChangeCall", on_change(Arc::downgrade(&inner), key, value));
            }
        });

        Link { inner }
    }

    pub fn path(&self) -> &LinkPath {
        &self.inner.path
    }

    /// Register a new connection. Resolves once the initial load has
    /// completed; requests made during the load are served in arrival
    /// order. None only if the link is torn down first.
    pub async fn connect(&self, primary: bool) -> Option<LinkConnection> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock_state()?;
            if state.ready {
                return Some(make_connection(&self.inner, &mut state, primary));
            }
            state.pending_connects.push((primary, tx));
        }
        rx.await.ok()
    }

    /// Current value at `path` (root when empty), serialized through the
    /// queue so it observes a consistent snapshot relative to in-flight
    /// writes.
    pub async fn get(&self, path: &[&str]) -> Option<Value> {
        let path = owned_path(path);
        let weak = Arc::downgrade(&self.inner);
        let result = self.inner.queue.run("Link::GetCall", async move {
            let inner = weak.upgrade()?;
            let state = inner.lock_state()?;
            document::get_at(&state.doc, &path).cloned()
        });
        result.await.ok().flatten()
    }

    /// Replace the subtree at `path` with the parsed `json`. Fire and
    /// forget: parse failures and permission violations are logged, the
    /// document is left unchanged, and the caller is not signaled.
    pub fn set(&self, path: &[&str], json: &str, src: ConnectionId) {
        enqueue_set(&self.inner, owned_path(path), json.to_string(), src);
    }

    /// Shallow key-union merge of the parsed `json` into the value at
    /// `path`. A merge that changes nothing writes no record and notifies
    /// nobody.
    pub fn update(&self, path: &[&str], json: &str, src: ConnectionId) {
        enqueue_update(&self.inner, owned_path(path), json.to_string(), src);
    }

    /// Remove the value at `path`; no-op when absent.
    pub fn erase(&self, path: &[&str], src: ConnectionId) {
        enqueue_erase(&self.inner, owned_path(path), src);
    }

    /// Store an opaque entity reference as the whole document value.
    pub fn set_entity(&self, reference: &str, src: ConnectionId) {
        // Just a variation on set at the root.
        self.set(&[], &entity::to_json(reference), src);
    }

    /// The entity reference held by this link, if it holds one.
    pub async fn get_entity(&self) -> Option<String> {
        let value = self.get(&[]).await?;
        entity::from_value(&value)
    }

    /// Install a schema for advisory validation. Best-effort: a schema that
    /// fails to parse is logged and ignored, and existing content is not
    /// re-validated.
    pub fn set_schema(&self, json_schema: &str) {
        let weak = Arc::downgrade(&self.inner);
        let json = json_schema.to_string();
        self.inner.queue.enqueue("Link::SetSchemaCall", async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match SchemaValidator::parse(&json) {
                Ok(validator) => {
                    if let Some(mut state) = inner.lock_state() {
                        state.schema = Some(validator);
                    }
                }
                Err(e) => log::error!("{}: schema parse failed: {}", inner.path, e),
            }
        });
    }

    /// Watcher not associated with any connection; never suppressed, never
    /// removed by a disconnect.
    pub fn watch_all(&self) -> LinkWatcher {
        watch_impl(&self.inner, WATCH_ALL_CONNECTION_ID, WATCH_ALL_CONNECTION_ID)
    }

    /// Resolves after every previously enqueued operation on this link,
    /// including its persistence write, has completed.
    pub async fn sync(&self) {
        self.inner.queue.sync().await;
    }

    /// Called once, after a full drain, when the last connection has gone
    /// and none has re-attached. The owner decides whether to tear the
    /// link down.
    pub fn set_orphaned_handler(&self, handler: impl Fn() + Send + 'static) {
        if let Some(mut state) = self.inner.lock_state() {
            state.orphaned_handler = Some(Box::new(handler));
        }
    }
}

impl LinkInner {
    fn lock_state(&self) -> Option<MutexGuard<'_, LinkState>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::error!("{}: link state poisoned", self.path);
                None
            }
        }
    }

    fn is_read_only(&self, state: &LinkState, src: ConnectionId) -> bool {
        self.config.read_only_for_others && !state.primary_ids.contains(&src)
    }
}

/// A client binding to a link. Writes made through it carry its connection
/// id, which is what echo suppression keys on. Dropping the connection
/// disconnects it and removes its watchers.
pub struct LinkConnection {
    inner: Weak<LinkInner>,
    id: ConnectionId,
}

impl LinkConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn set(&self, path: &[&str], json: &str) {
        if let Some(inner) = self.inner.upgrade() {
            enqueue_set(&inner, owned_path(path), json.to_string(), self.id);
        }
    }

    pub fn update(&self, path: &[&str], json: &str) {
        if let Some(inner) = self.inner.upgrade() {
            enqueue_update(&inner, owned_path(path), json.to_string(), self.id);
        }
    }

    pub fn erase(&self, path: &[&str]) {
        if let Some(inner) = self.inner.upgrade() {
            enqueue_erase(&inner, owned_path(path), self.id);
        }
    }

    pub fn set_entity(&self, reference: &str) {
        self.set(&[], &entity::to_json(reference));
    }

    pub async fn get(&self, path: &[&str]) -> Option<Value> {
        let inner = self.inner.upgrade()?;
        Link { inner }.get(path).await
    }

    pub async fn get_entity(&self) -> Option<String> {
        let value = self.get(&[]).await?;
        entity::from_value(&value)
    }

    /// Watcher bound to this connection: it is not notified of writes made
    /// through this connection, and is removed on disconnect.
    pub fn watch(&self) -> Option<LinkWatcher> {
        let inner = self.inner.upgrade()?;
        Some(watch_impl(&inner, self.id, self.id))
    }

    /// Watcher that sees every change including this connection's own
    /// writes; still removed when this connection disconnects.
    pub fn watch_all(&self) -> Option<LinkWatcher> {
        let inner = self.inner.upgrade()?;
        Some(watch_impl(&inner, self.id, WATCH_ALL_CONNECTION_ID))
    }

    pub fn set_schema(&self, json_schema: &str) {
        if let Some(inner) = self.inner.upgrade() {
            Link { inner }.set_schema(json_schema);
        }
    }

    pub async fn sync(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.queue.sync().await;
        }
    }
}

impl Drop for LinkConnection {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            disconnect(&inner, self.id);
        }
    }
}

fn owned_path(path: &[&str]) -> Vec<String> {
    path.iter().map(|segment| segment.to_string()).collect()
}

fn make_connection(
    inner: &Arc<LinkInner>,
    state: &mut LinkState,
    primary: bool,
) -> LinkConnection {
    let id = state.next_connection_id;
    state.next_connection_id += 1;
    if primary {
        state.primary_ids.insert(id);
    }
    state.connections.push(id);
    LinkConnection {
        inner: Arc::downgrade(inner),
        id,
    }
}

fn watch_impl(inner: &Arc<LinkInner>, owner: ConnectionId, target: ConnectionId) -> LinkWatcher {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    let weak = Arc::downgrade(inner);
    inner.queue.enqueue("Link::WatchCall", async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let Some(mut state) = inner.lock_state() else {
            return;
        };
        // The new watcher sees the current value as its first notification,
        // so a client that watches right after writing observes its own
        // write.
        let _ = tx.send(state.doc.clone());
        state.watchers.insert(WatcherEntry {
            id,
            owner,
            target,
            tx,
        });
    });
    LinkWatcher::new(id, rx)
}

fn disconnect(inner: &Arc<LinkInner>, id: ConnectionId) {
    let weak = Arc::downgrade(inner);
    inner.queue.enqueue("Link::DisconnectCall", async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let orphaned = {
            let Some(mut state) = inner.lock_state() else {
                return;
            };
            state.connections.retain(|conn| *conn != id);
            state.primary_ids.remove(&id);
            state.watchers.remove_owned_by(id);
            state.connections.is_empty() && state.orphaned_handler.is_some()
        };
        if orphaned {
            // Re-check after a full drain: the link must be synced before
            // the owner may tear it down, and a once-orphaned link can
            // acquire new connections in the meantime.
            let weak = Arc::downgrade(&inner);
            inner.queue.enqueue("Link::OrphanedCall", async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Some(state) = inner.lock_state() else {
                    return;
                };
                if state.connections.is_empty() {
                    if let Some(handler) = &state.orphaned_handler {
                        handler();
                    }
                }
            });
        }
    });
}

async fn persist(inner: &Arc<LinkInner>, record: &ChangeRecord) {
    let key = inner.path.record_key(&record.key);
    let bytes = match serde_json::to_vec(record) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("{}: record {} failed to serialize: {}", inner.path, record.key, e);
            return;
        }
    };
    if let Err(e) = inner.store.put_record(&key, bytes).await {
        // In-memory state stays authoritative; a later replay may supersede
        // it. No retry at this layer.
        log::error!("{}: write failed for {}: {}", inner.path, record.key, e);
    }
}

fn validate_schema(inner: &LinkInner, state: &LinkState, entry_point: &str) {
    if let Some(schema) = &state.schema {
        for violation in schema.validate(&state.doc) {
            log::warn!(
                "{}: schema violation after {}: {}",
                inner.path,
                entry_point,
                violation
            );
        }
    }
}

fn enqueue_set(inner: &Arc<LinkInner>, path: Vec<String>, json: String, src: ConnectionId) {
    let weak = Arc::downgrade(inner);
    inner.queue.enqueue("Link::SetCall", async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let record = {
            let Some(mut state) = inner.lock_state() else {
                return;
            };
            if inner.is_read_only(&state, src) {
                log::warn!("{}: set from read-only connection {}", inner.path, src);
                return;
            }
            let value = match serde_json::from_str::<Value>(&json) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("{}: set: JSON parse failed: {}", inner.path, e);
                    return;
                }
            };
            let key = state.keys.next();
            let record = ChangeRecord::set(key, path, value);
            document::apply_record(&mut state.doc, &record);
            state.latest_key = Some(record.key.clone());
            state.pending.push(record.clone());
            record
        };
        persist(&inner, &record).await;
        finish_local_write(&inner, "set", src);
    });
}

fn enqueue_update(inner: &Arc<LinkInner>, path: Vec<String>, json: String, src: ConnectionId) {
    let weak = Arc::downgrade(inner);
    inner.queue.enqueue("Link::UpdateCall", async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let record = {
            let Some(mut state) = inner.lock_state() else {
                return;
            };
            if inner.is_read_only(&state, src) {
                log::warn!("{}: update from read-only connection {}", inner.path, src);
                return;
            }
            let value = match serde_json::from_str::<Value>(&json) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("{}: update: JSON parse failed: {}", inner.path, e);
                    return;
                }
            };
            if !document::update_at(&mut state.doc, &path, value.clone()) {
                // No keys differed; nothing to record or announce.
                return;
            }
            let key = state.keys.next();
            let record = ChangeRecord::update(key, path, value);
            state.latest_key = Some(record.key.clone());
            state.pending.push(record.clone());
            record
        };
        persist(&inner, &record).await;
        finish_local_write(&inner, "update", src);
    });
}

fn enqueue_erase(inner: &Arc<LinkInner>, path: Vec<String>, src: ConnectionId) {
    let weak = Arc::downgrade(inner);
    inner.queue.enqueue("Link::EraseCall", async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let record = {
            let Some(mut state) = inner.lock_state() else {
                return;
            };
            if inner.is_read_only(&state, src) {
                log::warn!("{}: erase from read-only connection {}", inner.path, src);
                return;
            }
            if !document::erase_at(&mut state.doc, &path) {
                return;
            }
            let key = state.keys.next();
            let record = ChangeRecord::erase(key, path);
            state.latest_key = Some(record.key.clone());
            state.pending.push(record.clone());
            record
        };
        persist(&inner, &record).await;
        finish_local_write(&inner, "erase", src);
    });
}

/// Post-persistence tail shared by the local mutations: advisory schema
/// check, then notify everyone except the originating connection.
fn finish_local_write(inner: &Arc<LinkInner>, entry_point: &str, src: ConnectionId) {
    let Some(mut state) = inner.lock_state() else {
        return;
    };
    validate_schema(inner, &state, entry_point);
    let value = state.doc.clone();
    state.watchers.notify(&value, src);
}

/// Initial load: rebuild the document from the persisted change log, or
/// seed it when the log is empty, then serve the buffered connections.
async fn reload(weak: Weak<LinkInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let snapshot = match inner.store.get_snapshot(&inner.path.record_prefix()).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::error!("{}: initial snapshot failed: {}", inner.path, e);
            Vec::new()
        }
    };

    let seed_record = {
        let Some(mut state) = inner.lock_state() else {
            return;
        };
        if snapshot.is_empty() {
            seed_document(&inner, &mut state)
        } else {
            // Startup has no pending local changes yet; replay history
            // directly.
            let records = decode_records(&inner.path, &snapshot);
            state.latest_key = records.last().map(|record| record.key.clone());
            state.doc = document::replay(&records);
            None
        }
    };

    if let Some(record) = seed_record {
        persist(&inner, &record).await;
    }

    let Some(mut state) = inner.lock_state() else {
        return;
    };
    state.ready = true;
    let waiting = std::mem::take(&mut state.pending_connects);
    for (primary, tx) in waiting {
        let connection = make_connection(&inner, &mut state, primary);
        let _ = tx.send(connection);
    }
}

/// Turn configured initial data into a single synthetic Set record.
fn seed_document(inner: &Arc<LinkInner>, state: &mut LinkState) -> Option<ChangeRecord> {
    let json = inner.config.initial_data.as_ref()?;
    match serde_json::from_str::<Value>(json) {
        Ok(value) => {
            let key = state.keys.next();
            let record = ChangeRecord::set(key, Vec::new(), value);
            document::apply_record(&mut state.doc, &record);
            state.latest_key = Some(record.key.clone());
            state.pending.push(record.clone());
            Some(record)
        }
        Err(e) => {
            log::error!("{}: initial data is not valid JSON: {}", inner.path, e);
            None
        }
    }
}

fn decode_records(path: &LinkPath, snapshot: &[(String, Vec<u8>)]) -> Vec<ChangeRecord> {
    let mut records: Vec<ChangeRecord> = snapshot
        .iter()
        .filter_map(|(key, value)| match serde_json::from_slice(value) {
            Ok(record) => Some(record),
            Err(e) => {
                log::error!("{}: undecodable record at {}: {}", path, key, e);
                None
            }
        })
        .collect();
    records.sort_by(|a, b| a.key.cmp(&b.key));
    records
}

/// Merge one change notification from the store into local state.
async fn on_change(weak: Weak<LinkInner>, store_key: String, value: Vec<u8>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let record: ChangeRecord = match serde_json::from_slice(&value) {
        Ok(record) => record,
        Err(e) => {
            log::error!("{}: undecodable record at {}: {}", inner.path, store_key, e);
            return;
        }
    };

    {
        let Some(mut state) = inner.lock_state() else {
            return;
        };
        // Echo of our own write coming back: already applied, just confirm.
        if state
            .pending
            .first()
            .map_or(false, |head| head.key == record.key)
        {
            state.pending.remove(0);
            return;
        }
        match &state.latest_key {
            // Out-of-order arrival; repaired below by a full replay.
            Some(latest) if record.key < *latest => {}
            _ => {
                let before = state.doc.clone();
                document::apply_record(&mut state.doc, &record);
                state.latest_key = Some(record.key.clone());
                if state.doc != before {
                    let value = state.doc.clone();
                    state.watchers.notify(&value, ON_CHANGE_CONNECTION_ID);
                }
                return;
            }
        }
    }
    log::debug!(
        "{}: stale key {} observed, replaying change log",
        inner.path,
        record.key
    );
    replay_from_store(&inner).await;
}

/// Rebuild the document from the full persisted history merged with the
/// unconfirmed local changes, in ascending key order. The only O(changes)
/// path; taken when key order was observed violated.
async fn replay_from_store(inner: &Arc<LinkInner>) {
    let snapshot = match inner.store.get_snapshot(&inner.path.record_prefix()).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::error!("{}: replay snapshot failed: {}", inner.path, e);
            return;
        }
    };
    let history = decode_records(&inner.path, &snapshot);

    let Some(mut state) = inner.lock_state() else {
        return;
    };
    let merged = merge_sorted(history, &state.pending);
    let before = std::mem::replace(&mut state.doc, Value::Null);
    state.doc = document::replay(&merged);
    state.latest_key = merged.last().map(|record| record.key.clone());
    if state.doc != before {
        let value = state.doc.clone();
        state.watchers.notify(&value, ON_CHANGE_CONNECTION_ID);
    }
}
