//! Transaction tests: snapshot conflicts, atomicity, rollback, timeouts
//! and ordering guarantees.

use std::time::Duration;

use tempfile::TempDir;

use kasane_core::error::Error;
use kasane_core::types::ConfigValue;
use kasane_store::{ConfigStore, IsolationLevel, SetOptions, StoreOptions, TxnState};

fn options(dir: &TempDir) -> StoreOptions {
    StoreOptions::new(dir.path().join("store"))
}

#[tokio::test]
async fn commit_makes_all_writes_visible() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.set_value("batch.a", ConfigValue::U8(1)).unwrap();
    txn.set_value("batch.b", ConfigValue::U8(2)).unwrap();
    txn.set_value("batch.c", ConfigValue::U8(3)).unwrap();

    // Nothing visible before commit.
    assert!(store.get_value("batch.a", None).await.is_err());

    let version = store.commit_transaction(txn, None).await.unwrap();
    assert!(version > 0);

    assert_eq!(store.get_value("batch.a", None).await.unwrap(), ConfigValue::U8(1));
    assert_eq!(store.get_value("batch.b", None).await.unwrap(), ConfigValue::U8(2));
    assert_eq!(store.get_value("batch.c", None).await.unwrap(), ConfigValue::U8(3));
}

#[tokio::test]
async fn rollback_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let before = store.current_version();

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.set_value("ghost.key", ConfigValue::Bool(true)).unwrap();
    store.rollback_transaction(txn).await.unwrap();

    assert!(store.get_value("ghost.key", None).await.is_err());
    assert_eq!(store.current_version(), before);
}

#[tokio::test]
async fn second_committer_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    // T1 and T2 share a snapshot and write the same key.
    let mut t1 = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    let mut t2 = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    t1.set_value("theme.id", ConfigValue::Str("dark".into())).unwrap();
    t2.set_value("theme.id", ConfigValue::Str("light".into())).unwrap();

    store.commit_transaction(t1, None).await.unwrap();

    let err = store.commit_transaction(t2, None).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { ref key, .. } if key == "theme.id"));

    // The first committer's value stands; conflicts are never retried
    // automatically.
    assert_eq!(
        store.get_value("theme.id", None).await.unwrap(),
        ConfigValue::Str("dark".into())
    );
}

#[tokio::test]
async fn disjoint_transactions_both_commit() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let mut t1 = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    let mut t2 = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    t1.set_value("left.key", ConfigValue::U8(1)).unwrap();
    t2.set_value("right.key", ConfigValue::U8(2)).unwrap();

    store.commit_transaction(t1, None).await.unwrap();
    store.commit_transaction(t2, None).await.unwrap();

    assert!(store.get_value("left.key", None).await.is_ok());
    assert!(store.get_value("right.key", None).await.is_ok());
}

#[tokio::test]
async fn versions_advance_per_commit() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let v0 = store.current_version();
    store
        .set_value("k.one", ConfigValue::U8(1), SetOptions::default())
        .await
        .unwrap();
    let v1 = store.current_version();
    assert_eq!(v1, v0 + 1);

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.set_value("k.two", ConfigValue::U8(2)).unwrap();
    txn.set_value("k.three", ConfigValue::U8(3)).unwrap();
    let committed_at = store.commit_transaction(txn, None).await.unwrap();

    // One version per committed batch, not per key.
    assert_eq!(committed_at, v1 + 1);
}

#[tokio::test]
async fn read_your_writes_within_transaction() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    store
        .set_value("pre.existing", ConfigValue::U8(1), SetOptions::default())
        .await
        .unwrap();

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.set_value("pre.existing", ConfigValue::U8(9)).unwrap();
    txn.delete("pre.other").unwrap();

    assert_eq!(txn.staged("pre.existing"), Some(Some(&ConfigValue::U8(9))));
    assert_eq!(txn.staged("pre.other"), Some(None));

    // The global store still sees the old value until commit.
    assert_eq!(
        store.get_value("pre.existing", None).await.unwrap(),
        ConfigValue::U8(1)
    );
    store.commit_transaction(txn, None).await.unwrap();
    assert_eq!(
        store.get_value("pre.existing", None).await.unwrap(),
        ConfigValue::U8(9)
    );
}

#[tokio::test]
async fn zero_timeout_aborts_cleanly() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.set_value("late.key", ConfigValue::Bool(true)).unwrap();

    let err = store
        .commit_transaction(txn, Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    // Aborted, never half-applied.
    assert!(store.get_value("late.key", None).await.is_err());
}

#[tokio::test]
async fn transactional_delete_removes_key() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    store
        .set_value("txn.victim", ConfigValue::Bool(true), SetOptions::default())
        .await
        .unwrap();

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.delete("txn.victim").unwrap();
    store.commit_transaction(txn, None).await.unwrap();

    assert!(matches!(
        store.get_value("txn.victim", None).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn validation_runs_at_commit() {
    let dir = TempDir::new().unwrap();
    let doc = kasane_core::schema::SchemaDoc {
        version: 1,
        keys: vec![kasane_core::schema::KeySchema {
            path: "display.brightness".to_string(),
            kind: kasane_core::schema::ValueKind::UInt,
            constraints: vec![kasane_core::schema::Constraint::Range {
                min: 0.0,
                max: 100.0,
            }],
            depends_on: vec![],
        }],
    };
    let schema_path = dir.path().join("schema.json");
    std::fs::write(&schema_path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let store = ConfigStore::open(options(&dir).with_schema(schema_path))
        .await
        .unwrap();

    let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    txn.set_value("display.brightness", ConfigValue::U32(150)).unwrap();
    txn.set_value("other.key", ConfigValue::Bool(true)).unwrap();

    let err = store.commit_transaction(txn, None).await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    // Atomicity: the valid sibling write was not applied either.
    assert!(store.get_value("other.key", None).await.is_err());
}

#[tokio::test]
async fn committed_transactions_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = ConfigStore::open(options(&dir)).await.unwrap();
        let mut txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
        txn.set_value("durable.a", ConfigValue::U8(1)).unwrap();
        txn.set_value("durable.b", ConfigValue::U8(2)).unwrap();
        store.commit_transaction(txn, None).await.unwrap();
    }

    let store = ConfigStore::open(options(&dir)).await.unwrap();
    assert_eq!(store.get_value("durable.a", None).await.unwrap(), ConfigValue::U8(1));
    assert_eq!(store.get_value("durable.b", None).await.unwrap(), ConfigValue::U8(2));
}

#[tokio::test]
async fn monotonic_reads_for_single_key() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    for i in 0..50u64 {
        store
            .set_value("counter.key", ConfigValue::U64(i), SetOptions::default())
            .await
            .unwrap();

        // Once a reader observes write N, no later read returns < N.
        let observed = store.get_value("counter.key", None).await.unwrap();
        assert_eq!(observed, ConfigValue::U64(i));

        store.invalidate("counter.key").unwrap();
        let after_invalidate = store.get_value("counter.key", None).await.unwrap();
        assert_eq!(after_invalidate, ConfigValue::U64(i));
    }
}

#[tokio::test]
async fn transaction_state_tracks_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let txn = store.begin_transaction(IsolationLevel::Snapshot).unwrap();
    assert_eq!(txn.state(), TxnState::Active);
    assert_eq!(txn.write_count(), 0);

    // Read-only transactions commit trivially.
    store.commit_transaction(txn, None).await.unwrap();
}
