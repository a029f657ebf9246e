//! End-to-end behavior of links over a shared in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use storylink::link::{
    ChangeRecord, Link, LinkConfig, LinkPath, OrderedKey, WATCH_ALL_CONNECTION_ID,
};
use storylink::storage::{Ledger, MemoryLedger};

fn test_link(store: &Arc<MemoryLedger>, name: &str) -> Link {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = LinkPath::new(&["root", "module"], name);
    Link::new(path, LinkConfig::default(), store.clone() as Arc<dyn Ledger>)
}

/// Poll until the value at `path` equals `expected`; remote changes travel
/// through the store subscription, which is not covered by sync().
async fn await_value(link: &Link, path: &[&str], expected: &Value) {
    for _ in 0..100 {
        if link.get(path).await.as_ref() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "value at {:?} never became {}, last seen {:?}",
        path,
        expected,
        link.get(path).await
    );
}

#[tokio::test]
async fn set_and_get_round_trip() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "doc");
    let conn = link.connect(false).await.unwrap();

    conn.set(&[], r#"{"title": "hello", "count": 3}"#);
    assert_eq!(conn.get(&["title"]).await, Some(json!("hello")));
    assert_eq!(conn.get(&[]).await, Some(json!({"title": "hello", "count": 3})));
    assert_eq!(conn.get(&["missing"]).await, None);
}

#[tokio::test]
async fn watchers_observe_writes_in_order() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "doc");
    let conn = link.connect(false).await.unwrap();

    let mut watcher = link.watch_all();
    // Registration delivers the current value first.
    assert_eq!(watcher.next().await, Some(Value::Null));

    conn.set(&[], r#"{"step": 1}"#);
    conn.set(&[], r#"{"step": 2}"#);
    conn.sync().await;

    assert_eq!(watcher.next().await, Some(json!({"step": 1})));
    assert_eq!(watcher.next().await, Some(json!({"step": 2})));
}

#[tokio::test]
async fn a_connections_own_writes_are_not_echoed_to_its_watcher() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "doc");
    let writer = link.connect(false).await.unwrap();
    let other = link.connect(false).await.unwrap();

    let mut suppressed = writer.watch().unwrap();
    let mut all = writer.watch_all().unwrap();
    let mut on_other = other.watch().unwrap();
    // Each registration is its own subscription, even on one connection.
    assert_ne!(suppressed.id(), all.id());
    assert_eq!(suppressed.next().await, Some(Value::Null));
    assert_eq!(all.next().await, Some(Value::Null));
    assert_eq!(on_other.next().await, Some(Value::Null));

    writer.set(&[], r#"{"n": 1}"#);
    writer.sync().await;

    assert_eq!(suppressed.try_next(), None);
    assert_eq!(all.try_next(), Some(json!({"n": 1})));
    assert_eq!(on_other.try_next(), Some(json!({"n": 1})));
}

#[tokio::test]
async fn non_primary_writes_are_rejected_on_a_read_only_link() {
    let store = Arc::new(MemoryLedger::new());
    let path = LinkPath::new(&["root"], "guarded");
    let config = LinkConfig {
        read_only_for_others: true,
        ..Default::default()
    };
    let link = Link::new(path, config, store.clone() as Arc<dyn Ledger>);

    let owner = link.connect(true).await.unwrap();
    let guest = link.connect(false).await.unwrap();

    guest.set(&[], r#"{"by": "guest"}"#);
    guest.sync().await;
    assert_eq!(guest.get(&[]).await, Some(Value::Null));

    owner.set(&[], r#"{"by": "owner"}"#);
    owner.sync().await;
    assert_eq!(guest.get(&["by"]).await, Some(json!("owner")));
}

#[tokio::test]
async fn update_merges_one_level_and_skips_no_ops() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "doc");
    let conn = link.connect(false).await.unwrap();

    conn.set(&[], r#"{"b": 2, "nested": {"x": 1, "y": 2}}"#);
    conn.update(&[], r#"{"a": 1, "nested": {"x": 9}}"#);
    conn.sync().await;
    assert_eq!(
        conn.get(&[]).await,
        Some(json!({"a": 1, "b": 2, "nested": {"x": 9}}))
    );

    let before = store.get_snapshot("").await.unwrap().len();
    // Nothing differs; no record is written and no watcher fires.
    let mut watcher = link.watch_all();
    watcher.next().await;
    conn.update(&[], r#"{"a": 1}"#);
    conn.sync().await;
    assert_eq!(store.get_snapshot("").await.unwrap().len(), before);
    assert_eq!(watcher.try_next(), None);

    // A refused non-object payload at a missing path writes no record and
    // must not leave grafted intermediate nodes in the document.
    conn.update(&["missing", "deep"], "5");
    conn.sync().await;
    assert_eq!(store.get_snapshot("").await.unwrap().len(), before);
    assert_eq!(
        conn.get(&[]).await,
        Some(json!({"a": 1, "b": 2, "nested": {"x": 9}}))
    );
}

#[tokio::test]
async fn initial_data_seeds_an_empty_link_once() {
    let store = Arc::new(MemoryLedger::new());
    let path = LinkPath::new(&["root"], "seeded");
    let config = LinkConfig {
        initial_data: Some(r#"{"seeded": true}"#.to_string()),
        ..Default::default()
    };
    let link = Link::new(path.clone(), config.clone(), store.clone() as Arc<dyn Ledger>);
    let conn = link.connect(false).await.unwrap();
    assert_eq!(conn.get(&["seeded"]).await, Some(json!(true)));

    conn.set(&[], r#"{"seeded": false}"#);
    conn.sync().await;
    drop(conn);
    drop(link);

    // A second instantiation finds history and must not re-seed.
    let link = Link::new(path, config, store.clone() as Arc<dyn Ledger>);
    let conn = link.connect(false).await.unwrap();
    assert_eq!(conn.get(&["seeded"]).await, Some(json!(false)));
}

#[tokio::test]
async fn two_instances_on_one_store_converge() {
    let store = Arc::new(MemoryLedger::new());
    let a = test_link(&store, "shared");
    let b = test_link(&store, "shared");
    let conn_a = a.connect(false).await.unwrap();
    let conn_b = b.connect(false).await.unwrap();

    conn_a.set(&[], r#"{"from": "a"}"#);
    conn_a.sync().await;
    await_value(&b, &["from"], &json!("a")).await;

    // The two writes come from independent key generators; a later
    // wall-clock millisecond guarantees the second key sorts after the
    // first.
    tokio::time::sleep(Duration::from_millis(5)).await;
    conn_b.update(&[], r#"{"and": "b"}"#);
    conn_b.sync().await;
    await_value(&a, &[], &json!({"from": "a", "and": "b"})).await;
}

#[tokio::test]
async fn a_stale_key_triggers_a_full_replay() {
    let store = Arc::new(MemoryLedger::new());
    let path = LinkPath::new(&["root", "module"], "doc");
    let link = Link::new(
        path.clone(),
        LinkConfig::default(),
        store.clone() as Arc<dyn Ledger>,
    );
    let conn = link.connect(false).await.unwrap();

    conn.set(&[], "{}");
    conn.update(&[], r#"{"x": 1}"#);
    conn.sync().await;

    let snapshot = store.get_snapshot(&path.record_prefix()).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    let first: ChangeRecord = serde_json::from_slice(&snapshot[0].1).unwrap();

    // A change from another device whose key sorts between the two local
    // ones: appending to the first key yields the immediate successor.
    let stale_key = OrderedKey::from_string(format!("{}0", first.key));
    let stale = ChangeRecord::update(stale_key.clone(), vec![], json!({"y": 2}));
    store
        .put_record(
            &path.record_key(&stale_key),
            serde_json::to_vec(&stale).unwrap(),
        )
        .await
        .unwrap();

    // Replay folds the merged log: {} then y then x.
    await_value(&link, &[], &json!({"x": 1, "y": 2})).await;
}

#[tokio::test]
async fn entity_references_round_trip() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "entity");
    let conn = link.connect(false).await.unwrap();

    conn.set_entity("entity://thing/42");
    assert_eq!(conn.get_entity().await, Some("entity://thing/42".to_string()));

    conn.set(&[], r#"{"plain": "data"}"#);
    assert_eq!(conn.get_entity().await, None);
}

#[tokio::test]
async fn schema_violations_do_not_block_writes() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "typed");
    let conn = link.connect(false).await.unwrap();

    conn.set_schema(r#"{"type": "object", "required": ["name"]}"#);
    conn.set(&[], "5");
    conn.sync().await;
    // Validation is advisory; the nonconforming value is still applied.
    assert_eq!(conn.get(&[]).await, Some(json!(5)));
}

#[tokio::test]
async fn dropping_a_connection_removes_its_watchers() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "doc");
    let conn = link.connect(false).await.unwrap();
    let survivor = link.connect(false).await.unwrap();

    let mut watcher = conn.watch().unwrap();
    assert_eq!(watcher.next().await, Some(Value::Null));
    drop(conn);
    link.sync().await;

    survivor.set(&[], r#"{"n": 1}"#);
    survivor.sync().await;
    // The watcher was removed on disconnect; its channel is closed.
    assert_eq!(watcher.next().await, None);
}

#[tokio::test]
async fn link_level_watchers_survive_disconnects() {
    let store = Arc::new(MemoryLedger::new());
    let link = test_link(&store, "doc");
    let conn = link.connect(false).await.unwrap();

    let mut watcher = link.watch_all();
    assert_eq!(watcher.next().await, Some(Value::Null));
    drop(conn);
    link.sync().await;

    let other = link.connect(false).await.unwrap();
    assert_ne!(other.id(), WATCH_ALL_CONNECTION_ID);
    other.set(&[], r#"{"n": 1}"#);
    other.sync().await;
    assert_eq!(watcher.next().await, Some(json!({"n": 1})));
}

#[tokio::test]
async fn connects_during_the_initial_load_are_served_after_it() {
    let store = Arc::new(MemoryLedger::new());
    let path = LinkPath::new(&["root"], "preloaded");

    // Preload history directly, as a previous run would have left it.
    let key = OrderedKey::from_string("0000000000000001-00000001");
    let record = ChangeRecord::set(key.clone(), vec![], json!({"loaded": true}));
    store
        .put_record(&path.record_key(&key), serde_json::to_vec(&record).unwrap())
        .await
        .unwrap();

    let link = Link::new(path, LinkConfig::default(), store.clone() as Arc<dyn Ledger>);
    // Connect immediately; the reload operation has not necessarily run yet.
    let conn = link.connect(false).await.unwrap();
    assert_eq!(conn.get(&["loaded"]).await, Some(json!(true)));
}
