//! End-to-end store tests: reads through the hierarchy, validated writes,
//! encryption, watches, snapshots and restart persistence.

use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;

use kasane_core::crypto::KeySource;
use kasane_core::error::Error;
use kasane_core::schema::{Constraint, KeySchema, SchemaDoc, ValidationLevel, ValueKind};
use kasane_core::types::ConfigValue;
use kasane_store::{ConfigStore, InitPhase, SetOptions, StoreOptions, WatchOptions};

fn options(dir: &TempDir) -> StoreOptions {
    StoreOptions::new(dir.path().join("store"))
}

fn write_schema(dir: &TempDir) -> std::path::PathBuf {
    let doc = SchemaDoc {
        version: 1,
        keys: vec![
            KeySchema {
                path: "display.brightness".to_string(),
                kind: ValueKind::UInt,
                constraints: vec![Constraint::Range {
                    min: 0.0,
                    max: 100.0,
                }],
                depends_on: vec![],
            },
            KeySchema {
                path: "theme.id".to_string(),
                kind: ValueKind::Str,
                constraints: vec![Constraint::OneOf(vec![
                    "dark".to_string(),
                    "light".to_string(),
                ])],
                depends_on: vec![],
            },
        ],
    };
    let path = dir.path().join("schema.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn open_reaches_ready() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();
    assert_eq!(store.phase(), InitPhase::Ready);
    assert!(!store.is_degraded());
}

#[tokio::test]
async fn set_then_get() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    store
        .set_value("theme.id", ConfigValue::Str("dark".into()), SetOptions::default())
        .await
        .unwrap();

    let value = store.get_value("theme.id", None).await.unwrap();
    assert_eq!(value, ConfigValue::Str("dark".into()));

    // Unknown key: default applies, otherwise NotFound.
    let fallback = store
        .get_value("theme.unknown", Some(ConfigValue::Bool(false)))
        .await
        .unwrap();
    assert_eq!(fallback, ConfigValue::Bool(false));
    assert!(matches!(
        store.get_value("theme.unknown", None).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn rejected_write_leaves_stored_value_untouched() {
    let dir = TempDir::new().unwrap();
    let schema = write_schema(&dir);
    let store = ConfigStore::open(options(&dir).with_schema(schema)).await.unwrap();

    store
        .set_value("display.brightness", ConfigValue::U32(70), SetOptions::default())
        .await
        .unwrap();

    let err = store
        .set_value("display.brightness", ConfigValue::U32(150), SetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    // The stored value is still 70 — also after dropping the cached copy.
    assert_eq!(
        store.get_value("display.brightness", None).await.unwrap(),
        ConfigValue::U32(70)
    );
    store.invalidate("display.brightness").unwrap();
    assert_eq!(
        store.get_value("display.brightness", None).await.unwrap(),
        ConfigValue::U32(70)
    );
}

#[tokio::test]
async fn type_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let schema = write_schema(&dir);
    let store = ConfigStore::open(options(&dir).with_schema(schema)).await.unwrap();

    let err = store
        .set_value(
            "display.brightness",
            ConfigValue::Str("bright".into()),
            SetOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

#[tokio::test]
async fn cache_only_writes_skip_storage() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let opts = SetOptions {
        persist: false,
        ..Default::default()
    };
    store
        .set_value("session.scratch", ConfigValue::U8(1), opts)
        .await
        .unwrap();

    // Served from cache...
    assert_eq!(
        store.get_value("session.scratch", None).await.unwrap(),
        ConfigValue::U8(1)
    );

    // ...but gone once the cached copy is dropped: storage never saw it.
    store.invalidate("session.scratch").unwrap();
    assert!(matches!(
        store.get_value("session.scratch", None).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn invalidate_rereads_from_storage() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    store
        .set_value("panel.height", ConfigValue::U32(32), SetOptions::default())
        .await
        .unwrap();
    store.invalidate("panel.height").unwrap();

    // The cache miss reads through to storage and finds the same value.
    assert_eq!(
        store.get_value("panel.height", None).await.unwrap(),
        ConfigValue::U32(32)
    );
}

#[tokio::test]
async fn encrypted_values_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let opts = SetOptions {
        encrypt: true,
        ..Default::default()
    };
    store
        .set_value("auth.token", ConfigValue::Str("hunter2".into()), opts)
        .await
        .unwrap();

    // Round-trips through cache and through storage.
    assert_eq!(
        store.get_value("auth.token", None).await.unwrap(),
        ConfigValue::Str("hunter2".into())
    );
    store.invalidate("auth.token").unwrap();
    assert_eq!(
        store.get_value("auth.token", None).await.unwrap(),
        ConfigValue::Str("hunter2".into())
    );
}

#[tokio::test]
async fn values_survive_restart() {
    let dir = TempDir::new().unwrap();
    let key_source = KeySource::Passphrase {
        secret: "correct horse".to_string(),
        salt: b"battery staple".to_vec(),
    };

    {
        let store = ConfigStore::open(
            options(&dir).with_key_source(key_source.clone()),
        )
        .await
        .unwrap();
        store
            .set_value("theme.id", ConfigValue::Str("dark".into()), SetOptions::default())
            .await
            .unwrap();
        store
            .set_value(
                "auth.token",
                ConfigValue::Str("s3cret".into()),
                SetOptions {
                    encrypt: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let store = ConfigStore::open(options(&dir).with_key_source(key_source))
        .await
        .unwrap();
    assert_eq!(
        store.get_value("theme.id", None).await.unwrap(),
        ConfigValue::Str("dark".into())
    );
    assert_eq!(
        store.get_value("auth.token", None).await.unwrap(),
        ConfigValue::Str("s3cret".into())
    );
}

#[tokio::test]
async fn watchers_receive_matching_changes() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let mut theme_watch = store
        .watch_changes("theme.*", WatchOptions::default())
        .unwrap();
    let mut panel_watch = store
        .watch_changes("panel.*", WatchOptions::default())
        .unwrap();

    store
        .set_value("theme.id", ConfigValue::Str("light".into()), SetOptions::default())
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), theme_watch.next_change())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&*event.path, "theme.id");
    assert_eq!(event.value, Some(ConfigValue::Str("light".into())));
    assert!(event.version > 0);

    // The panel watcher saw nothing.
    assert!(panel_watch.try_next_change().is_none());
}

#[tokio::test]
async fn notify_false_suppresses_events() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let mut watch = store.watch_changes("*", WatchOptions::default()).unwrap();

    store
        .set_value(
            "silent.key",
            ConfigValue::Bool(true),
            SetOptions {
                notify: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .set_value("loud.key", ConfigValue::Bool(true), SetOptions::default())
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), watch.next_change())
        .await
        .unwrap()
        .unwrap();
    // The first event to arrive is the loud one; the silent write never
    // produced any.
    assert_eq!(&*event.path, "loud.key");
}

#[tokio::test]
async fn callback_watchers_run_off_thread() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _handle = store
        .watch_changes_fn(
            "cb.*",
            move |event| {
                let _ = tx.send(event);
            },
            WatchOptions::default(),
        )
        .unwrap();

    store
        .set_value("cb.key", ConfigValue::U8(9), SetOptions::default())
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.value, Some(ConfigValue::U8(9)));
}

#[tokio::test]
async fn watch_limit_enforced() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(&dir);
    opts.watch.max_watches = 2;
    let store = ConfigStore::open(opts).await.unwrap();

    let _a = store.watch_changes("a.*", WatchOptions::default()).unwrap();
    let _b = store.watch_changes("b.*", WatchOptions::default()).unwrap();
    assert!(matches!(
        store.watch_changes("c.*", WatchOptions::default()),
        Err(Error::ResourceLimit { .. })
    ));

    // Dropping a handle frees a slot.
    drop(_a);
    assert!(store.watch_changes("c.*", WatchOptions::default()).is_ok());
}

#[tokio::test]
async fn delete_emits_removal_event() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    store
        .set_value("doomed.key", ConfigValue::Bool(true), SetOptions::default())
        .await
        .unwrap();

    let mut watch = store
        .watch_changes(
            "doomed.*",
            WatchOptions {
                include_removals: true,
            },
        )
        .unwrap();

    store
        .delete_value("doomed.key", SetOptions::default())
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), watch.next_change())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.value, None);

    assert!(matches!(
        store.get_value("doomed.key", None).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn validate_configuration_reports_failures() {
    let dir = TempDir::new().unwrap();
    let schema = write_schema(&dir);
    let store = ConfigStore::open(options(&dir).with_schema(schema)).await.unwrap();

    let mut tree = BTreeMap::new();
    tree.insert("display.brightness".to_string(), ConfigValue::U32(250));
    tree.insert("theme.id".to_string(), ConfigValue::Str("dark".into()));

    let report = store
        .validate_configuration(&tree, ValidationLevel::Full, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, "display.brightness");

    // Idempotent: same tree, same report.
    let again = store
        .validate_configuration(&tree, ValidationLevel::Full, None)
        .await
        .unwrap();
    assert_eq!(again.failures.len(), report.failures.len());
}

#[tokio::test]
async fn snapshot_export_import() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    for i in 0..20 {
        store
            .set_value(
                &format!("export.key.{}", i),
                ConfigValue::U64(i),
                SetOptions::default(),
            )
            .await
            .unwrap();
    }
    let snapshot = store.export_snapshot().await.unwrap();

    // Import into a fresh store.
    let dir2 = TempDir::new().unwrap();
    let other = ConfigStore::open(options(&dir2)).await.unwrap();
    let imported = other.import_snapshot(&snapshot).await.unwrap();
    assert_eq!(imported, 20);

    for i in 0..20 {
        assert_eq!(
            other
                .get_value(&format!("export.key.{}", i), None)
                .await
                .unwrap(),
            ConfigValue::U64(i)
        );
    }
}

#[tokio::test]
async fn flush_persists_through_sstables() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(options(&dir)).await.unwrap();

    store
        .set_value("flushed.key", ConfigValue::I64(-7), SetOptions::default())
        .await
        .unwrap();
    store.flush().await.unwrap();
    store.invalidate("flushed.key").unwrap();

    assert_eq!(
        store.get_value("flushed.key", None).await.unwrap(),
        ConfigValue::I64(-7)
    );
}
