mod helpers;
use self::helpers::{BUCKET, TRACER, big_record, builder, clock, jan15, jan16, settle, store};

use s3_journal::position::{Action, Position};
use s3_journal::testing::MemoryStore;
use s3_journal::{Compressor, ErrorKind, FsQueue, JournalBuilder, JsonEncoder, TaskQueue as _};

use bytes::Bytes;
use std::io::Read as _;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn single_small_record_becomes_one_object() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path()).build().await.unwrap();

    assert!(journal.put(Bytes::from_static(b"hello")).await.unwrap());
    journal.close().await.unwrap();

    let key = "2024/01/15/node-000000.journal";
    assert_eq!(store.object_keys(), vec![key.to_string()]);
    assert_eq!(&store.object(key).unwrap()[..], b"hello\n");
    assert_eq!(store.object_parts(key).unwrap(), vec![6]);
    assert_eq!(store.open_upload_count(), 0);

    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.uploaded, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn parts_roll_over_past_the_minimum_size() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .max_batch_size(1)
        .max_batch_latency(Duration::from_secs(600))
        .build()
        .await
        .unwrap();

    // Each record alone crosses the 16-byte minimum, so every batch closes
    // the part it lands in and the next batch opens a new one.
    assert!(journal.put(big_record()).await.unwrap());
    assert!(journal.put(big_record()).await.unwrap());
    assert!(journal.put(Bytes::from_static(b"x")).await.unwrap());
    journal.close().await.unwrap();

    let key = "2024/01/15/node-000000.journal";
    assert_eq!(store.object_parts(key).unwrap(), vec![18, 18, 2]);
    let body = store.object(key).unwrap();
    assert_eq!(&body[..], b"0123456789abcdefg\n0123456789abcdefg\nx\n");

    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 3);
    assert_eq!(stats.uploaded, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_roll_over_past_the_part_cap() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .max_batch_size(1)
        .max_batch_latency(Duration::from_secs(600))
        .build()
        .await
        .unwrap();

    // Six full parts against max_parts = 4: the first object takes parts
    // 1-4, the second parts 1-2 plus the short tail.
    for _ in 0..6 {
        assert!(journal.put(big_record()).await.unwrap());
    }
    assert!(journal.put(Bytes::from_static(b"x")).await.unwrap());
    journal.close().await.unwrap();

    let first = "2024/01/15/node-000000.journal";
    let second = "2024/01/15/node-000001.journal";
    assert_eq!(
        store.object_keys(),
        vec![first.to_string(), second.to_string()]
    );
    assert_eq!(store.object_parts(first).unwrap(), vec![18, 18, 18, 18]);
    assert_eq!(store.object_parts(second).unwrap(), vec![18, 18, 2]);
    assert_eq!(store.open_upload_count(), 0);
    assert!(store.aborted_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn day_rollover_splits_objects_by_directory() {
    let _ = &*TRACER;

    let store = store();
    let clock = Arc::new(s3_journal::testing::ManualClock::at(jan15(23, 59, 59)));
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path()).build().await.unwrap();

    assert!(journal.put(Bytes::from_static(b"A")).await.unwrap());
    settle().await;

    clock.set(jan16(0, 0, 0));
    assert!(journal.put(Bytes::from_static(b"B")).await.unwrap());
    settle().await;
    journal.close().await.unwrap();

    let day1 = "2024/01/15/node-000000.journal";
    let day2 = "2024/01/16/node-000000.journal";
    assert_eq!(&store.object(day1).unwrap()[..], b"A\n");
    assert_eq!(&store.object(day2).unwrap()[..], b"B\n");
    assert_eq!(store.open_upload_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn day_rollover_with_a_large_batch_flushes_its_part() {
    let _ = &*TRACER;

    let store = store();
    let clock = Arc::new(s3_journal::testing::ManualClock::at(jan15(23, 59, 59)));
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .max_batch_size(1)
        .max_batch_latency(Duration::from_secs(600))
        .build()
        .await
        .unwrap();

    // The second put flushes "a" while it is still the 15th; the oversized
    // batch is then the first flush of the new day.
    assert!(journal.put(Bytes::from_static(b"a")).await.unwrap());
    assert!(journal.put(big_record()).await.unwrap());
    clock.set(jan16(0, 0, 0));
    assert!(journal.put(Bytes::from_static(b"c")).await.unwrap());
    journal.close().await.unwrap();

    let day1 = "2024/01/15/node-000000.journal";
    let day2 = "2024/01/16/node-000000.journal";
    assert_eq!(&store.object(day1).unwrap()[..], b"a\n");
    assert_eq!(store.object_parts(day2).unwrap(), vec![18, 2]);
    assert_eq!(&store.object(day2).unwrap()[..], b"0123456789abcdefg\nc\n");
    assert_eq!(store.open_upload_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_stale_records_release_admission_capacity() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();

    // A leftover staged task addressing an upload that no longer exists
    // anywhere; its records can never be uploaded and must be dropped.
    {
        let queue = FsQueue::open(dir.path(), true).await.unwrap();
        let stale = Action::Append {
            pos: Position::new(6, 0, "1999/01/01"),
            count: 2,
            payload: b"ab\ncd\n".to_vec(),
        };
        queue.put(stale.encode().unwrap()).await.unwrap();
    }

    // Recovery pre-acquires both permits, so the journal opens full.
    let journal = builder(&store, &clock, dir.path())
        .max_queue_size(2)
        .build()
        .await
        .unwrap();
    settle().await;

    // Dropping the stale records gave their permits back.
    assert!(journal.put(Bytes::from_static(b"live")).await.unwrap());
    journal.close().await.unwrap();

    assert_eq!(
        &store.object("2024/01/15/node-000001.journal").unwrap()[..],
        b"live\n"
    );
    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 3);
    assert_eq!(stats.uploaded, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_crashed_journal_uploads_on_restart() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();

    {
        // The record reaches the durable queue but the process dies before
        // anything is uploaded.
        let journal = builder(&store, &clock, dir.path()).build().await.unwrap();
        assert!(journal.put(Bytes::from_static(b"hello")).await.unwrap());
        settle().await;
        drop(journal);
    }
    assert!(store.object_keys().is_empty());

    let journal = builder(&store, &clock, dir.path()).build().await.unwrap();
    journal.close().await.unwrap();

    let key = "2024/01/15/node-000000.journal";
    assert_eq!(&store.object(key).unwrap()[..], b"hello\n");
    assert_eq!(store.object_keys().len(), 1);

    // The recovered record was re-admitted and uploaded exactly once.
    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.uploaded, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_writes_land_in_a_fresh_object() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();

    {
        let journal = builder(&store, &clock, dir.path()).build().await.unwrap();
        assert!(journal.put(Bytes::from_static(b"old")).await.unwrap());
        settle().await;
        drop(journal);
    }

    let journal = builder(&store, &clock, dir.path()).build().await.unwrap();
    assert!(journal.put(Bytes::from_static(b"new")).await.unwrap());
    settle().await;
    journal.close().await.unwrap();

    // The recovered object finishes as it was; fresh data never interleaves
    // with it.
    assert_eq!(
        &store.object("2024/01/15/node-000000.journal").unwrap()[..],
        b"old\n"
    );
    assert_eq!(
        &store.object("2024/01/15/node-000001.journal").unwrap()[..],
        b"new\n"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_failures_retry_without_loss() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .max_batch_size(1)
        .max_batch_latency(Duration::from_secs(600))
        .build()
        .await
        .unwrap();

    store.fail_part_uploads(true);
    assert!(journal.put(big_record()).await.unwrap());
    assert!(journal.put(Bytes::from_static(b"x")).await.unwrap());
    // Give the loop a few failed attempts before the store recovers.
    tokio::time::sleep(Duration::from_millis(500)).await;
    store.fail_part_uploads(false);
    journal.close().await.unwrap();

    let key = "2024/01/15/node-000000.journal";
    assert_eq!(&store.object(key).unwrap()[..], b"0123456789abcdefg\nx\n");
    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.uploaded, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn expiration_sweep_reclaims_stale_uploads() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();

    // A crashed peer left uploads behind: one with a committed part a month
    // ago, one empty, and one from today.
    let with_part = store.seed_upload(BUCKET, "2023/12/16/peer-000000.journal");
    store.seed_part(&with_part, 1, b"left behind content\n");
    store.seed_upload(BUCKET, "2023/12/16/peer-000001.journal");
    store.seed_upload(BUCKET, "2024/01/15/peer-000000.journal");

    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .expiration(Duration::from_secs(7 * 24 * 3600))
        .build()
        .await
        .unwrap();
    settle().await;
    journal.close().await.unwrap();

    // The stale upload with data was completed, the empty one aborted, and
    // today's upload left alone.
    assert!(store.object("2023/12/16/peer-000000.journal").is_some());
    assert!(
        store
            .aborted_keys()
            .contains(&"2023/12/16/peer-000001.journal".to_string())
    );
    assert_eq!(store.open_upload_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_falls_back_to_abort_when_complete_is_denied() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let stale = store.seed_upload(BUCKET, "2023/12/16/peer-000000.journal");
    store.seed_part(&stale, 1, b"cannot complete this\n");
    store.deny_completes(true);

    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .expiration(Duration::from_secs(7 * 24 * 3600))
        .build()
        .await
        .unwrap();
    settle().await;
    store.deny_completes(false);
    journal.close().await.unwrap();

    assert!(
        store
            .aborted_keys()
            .contains(&"2023/12/16/peer-000000.journal".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn a_quiescent_journal_uploads_nothing() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path()).build().await.unwrap();
    settle().await;
    journal.close().await.unwrap();

    assert!(store.object_keys().is_empty());
    assert_eq!(store.open_upload_count(), 0);
    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 0);
    assert_eq!(stats.uploaded, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_is_bounded_by_queue_size() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .max_queue_size(2)
        .max_batch_latency(Duration::from_secs(600))
        .build()
        .await
        .unwrap();

    assert!(journal.put(Bytes::from_static(b"a")).await.unwrap());
    assert!(journal.put(Bytes::from_static(b"b")).await.unwrap());
    // The journal is full until an upload releases permits.
    assert!(!journal.put(Bytes::from_static(b"c")).await.unwrap());

    journal.close().await.unwrap();
    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.uploaded, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn put_after_close_is_an_error() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path()).build().await.unwrap();
    journal.close().await.unwrap();

    let err = journal.put(Bytes::from_static(b"late")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    let err = journal.close().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn gzip_compresses_and_suffixes_objects() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .compressor(Compressor::Gzip)
        .build()
        .await
        .unwrap();

    assert!(journal.put(Bytes::from_static(b"hello")).await.unwrap());
    journal.close().await.unwrap();

    let key = "2024/01/15/node-000000.journal.gz";
    let body = store.object(key).unwrap();
    let mut decoder = flate2::read::MultiGzDecoder::new(&body[..]);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, b"hello\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn json_records_upload_as_jsonlines() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .encoder(JsonEncoder)
        .build()
        .await
        .unwrap();

    assert!(journal.put(serde_json::json!({"n": 1})).await.unwrap());
    assert!(journal.put(serde_json::json!({"n": 2})).await.unwrap());
    journal.close().await.unwrap();

    let body = store.object("2024/01/15/node-000000.journal").unwrap();
    assert_eq!(&body[..], b"{\"n\":1}\n{\"n\":2}\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn literal_prefix_scopes_keys_and_recovery() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .directory_format("'events/raw'/%Y/%m/%d")
        .build()
        .await
        .unwrap();

    assert!(journal.put(Bytes::from_static(b"hello")).await.unwrap());
    journal.close().await.unwrap();

    let key = "events/raw/2024/01/15/node-000000.journal";
    assert_eq!(&store.object(key).unwrap()[..], b"hello\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn shards_spread_records_and_merge_stats() {
    let _ = &*TRACER;

    let store = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let journal = builder(&store, &clock, dir.path())
        .shards(3)
        .max_queue_size(300)
        .build_sharded()
        .await
        .unwrap();
    assert_eq!(journal.shard_count(), 3);

    for n in 0..9u32 {
        assert!(journal.put(Bytes::from(format!("r{n}"))).await.unwrap());
    }
    settle().await;
    journal.close().await.unwrap();

    for (shard, body) in [
        ("0", "r0\nr3\nr6\n"),
        ("1", "r1\nr4\nr7\n"),
        ("2", "r2\nr5\nr8\n"),
    ] {
        let key = format!("{shard}/2024/01/15/node-000000.journal");
        assert_eq!(&store.object(&key).unwrap()[..], body.as_bytes());
    }

    let stats = journal.stats().await.unwrap();
    assert_eq!(stats.enqueued, 9);
    assert_eq!(stats.uploaded, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn sharding_rejects_out_of_range_counts() {
    let _ = &*TRACER;

    let store: Arc<MemoryStore> = store();
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let err = builder(&store, &clock, dir.path())
        .shards(37)
        .build_sharded()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let err = JournalBuilder::new("", dir.path()).build().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}
