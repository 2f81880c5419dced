//! WAL tests: append/read, batching, concurrency, recovery, torn tails
//! and transaction filtering.

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use kasane_core::metrics::Metrics;
use kasane_storage::wal::{WalAppend, WalConfig, WalOp, WriteAheadLog};

fn set(txn_id: u64, path: &str, payload: &[u8]) -> WalAppend {
    WalAppend::Set {
        txn_id,
        path: path.to_string(),
        record: Bytes::copy_from_slice(payload),
    }
}

#[tokio::test]
async fn basic_append_read() {
    let temp_dir = TempDir::new().unwrap();
    let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
        .await
        .unwrap();

    wal.append(set(0, "theme.id", b"dark")).await.unwrap();

    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op, WalOp::Set);
    assert_eq!(records[0].path, "theme.id");
    assert_eq!(records[0].record, Bytes::from_static(b"dark"));
    assert_eq!(
        records[0].key_hash,
        kasane_core::crypto::path_hash("theme.id")
    );
}

#[tokio::test]
async fn timestamps_are_monotonic_across_appends() {
    let temp_dir = TempDir::new().unwrap();
    let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
        .await
        .unwrap();

    for i in 0..50 {
        wal.append(set(0, &format!("key.{}", i), b"v")).await.unwrap();
    }

    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 50);
    for pair in records.windows(2) {
        assert!(pair[0].timestamp_ns < pair[1].timestamp_ns);
    }
}

#[tokio::test]
async fn concurrent_writers_all_land() {
    let temp_dir = TempDir::new().unwrap();
    let wal = Arc::new(
        WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for writer in 0..8 {
        let wal = Arc::clone(&wal);
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                wal.append(set(0, &format!("w{}.k{}", writer, i), b"v"))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 8 * 50);
}

#[tokio::test]
async fn batch_is_one_durable_unit() {
    let temp_dir = TempDir::new().unwrap();
    let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
        .await
        .unwrap();

    wal.append_batch(vec![
        set(7, "a.b", b"1"),
        set(7, "c.d", b"2"),
        WalAppend::Commit { txn_id: 7 },
    ])
    .await
    .unwrap();

    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].op, WalOp::TxnCommit);
    assert_eq!(records[2].txn_id, 7);
}

#[tokio::test]
async fn transaction_records_are_backward_chained() {
    let temp_dir = TempDir::new().unwrap();
    let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
        .await
        .unwrap();

    wal.append_batch(vec![
        set(3, "x.one", b"1"),
        set(3, "x.two", b"2"),
        WalAppend::Commit { txn_id: 3 },
    ])
    .await
    .unwrap();

    let records = wal.read_from(0).await.unwrap();
    // First record of the transaction has no predecessor.
    assert_eq!(records[0].prev_offset, 0);
    // The later ones point backward at their predecessors.
    assert!(records[1].prev_offset > 0);
    assert!(records[2].prev_offset > records[1].prev_offset);
}

#[tokio::test]
async fn recovery_after_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
            .await
            .unwrap();
        for i in 0..20 {
            wal.append(set(0, &format!("key.{}", i), b"payload")).await.unwrap();
        }
        wal.flush().await.unwrap();
    }

    let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
        .await
        .unwrap();
    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 20);

    // And appends keep working after recovery.
    wal.append(set(0, "post.recovery", b"v")).await.unwrap();
    assert_eq!(wal.read_from(0).await.unwrap().len(), 21);
}

#[tokio::test]
async fn torn_tail_is_truncated() {
    let temp_dir = TempDir::new().unwrap();
    {
        let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
            .await
            .unwrap();
        for i in 0..5 {
            wal.append(set(0, &format!("key.{}", i), b"payload")).await.unwrap();
        }
        wal.flush().await.unwrap();
    }

    // Simulate a crash mid-write: append garbage to the file.
    let wal_file = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension() == Some(std::ffi::OsStr::new("wal")))
        .unwrap();
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(&wal_file)
        .unwrap();
    f.write_all(&[0xAB; 37]).unwrap();
    f.sync_all().unwrap();

    let wal = WriteAheadLog::new(temp_dir.path(), WalConfig::default(), Metrics::new())
        .await
        .unwrap();
    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 5, "torn tail must not hide valid records");
}

#[tokio::test]
async fn rotation_keeps_all_records_readable() {
    let temp_dir = TempDir::new().unwrap();
    let config = WalConfig {
        max_file_size: 4 * 1024, // force frequent rotation
        ..Default::default()
    };
    let wal = WriteAheadLog::new(temp_dir.path(), config, Metrics::new())
        .await
        .unwrap();

    for i in 0..100 {
        wal.append(set(0, &format!("key.{}", i), &[b'x'; 128]))
            .await
            .unwrap();
    }

    let files = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension() == Some(std::ffi::OsStr::new("wal"))
        })
        .count();
    assert!(files > 1, "expected rotation to produce multiple files");

    let records = wal.read_from(0).await.unwrap();
    assert_eq!(records.len(), 100);
}

#[tokio::test]
async fn truncate_drops_checkpointed_files() {
    let temp_dir = TempDir::new().unwrap();
    let config = WalConfig {
        max_file_size: 4 * 1024,
        ..Default::default()
    };
    let wal = WriteAheadLog::new(temp_dir.path(), config, Metrics::new())
        .await
        .unwrap();

    let mut last_ts = 0;
    for i in 0..100 {
        last_ts = wal
            .append(set(0, &format!("key.{}", i), &[b'x'; 128]))
            .await
            .unwrap();
    }

    wal.truncate(last_ts).await.unwrap();

    // Only the active file survives; no record is readable twice.
    let files = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension() == Some(std::ffi::OsStr::new("wal"))
        })
        .count();
    assert_eq!(files, 1);
}
