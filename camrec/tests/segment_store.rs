//! Segment store properties: accounting, idempotent removal, reconcile.

mod common;

use std::path::Path;
use std::time::Duration;

use camrec::Error;
use camrec::domain::NewSegment;
use camrec::storage::{OrphanPolicy, ReconcileOptions, SegmentQuery};

use common::{TestVolumes, hours_ago, record_segment, setup_store, volume, write_segment_file};

fn bytes_on_disk(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[tokio::test]
async fn test_tracked_bytes_never_exceed_disk() {
    let volumes = TestVolumes::new();
    let store = setup_store(volumes.dir.path()).await;
    let volume = volume("primary", volumes.root("primary"));
    let camera_dir = volume.camera_dir("gate");

    let mut live = Vec::new();
    // Register and remove in an interleaved pattern, checking after each step.
    for round in 0..6i64 {
        let segment =
            record_segment(&store, &volume, "gate", hours_ago(100 - round), 10 + round as usize)
                .await;
        live.push(segment.id);
        assert!(store.tracked_bytes("primary").await.unwrap() <= bytes_on_disk(&camera_dir));

        if round % 2 == 1 {
            let victim = live.remove(0);
            store.remove(victim).await.unwrap();
            assert!(
                store.tracked_bytes("primary").await.unwrap() <= bytes_on_disk(&camera_dir)
            );
        }
    }

    assert_eq!(
        store.tracked_bytes("primary").await.unwrap(),
        bytes_on_disk(&camera_dir)
    );
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let volumes = TestVolumes::new();
    let store = setup_store(volumes.dir.path()).await;
    let volume = volume("primary", volumes.root("primary"));

    let segment = record_segment(&store, &volume, "gate", hours_ago(3), 10).await;
    let removed = store.remove(segment.id).await.unwrap();
    assert_eq!(removed.map(|s| s.id), Some(segment.id));
    assert!(!segment.path.exists());
    assert!(store.remove(segment.id).await.unwrap().is_none());

    // A file deleted behind the store's back still removes cleanly.
    let other = record_segment(&store, &volume, "gate", hours_ago(2), 10).await;
    std::fs::remove_file(&other.path).unwrap();
    assert!(store.remove(other.id).await.unwrap().is_some());
    assert_eq!(store.tracked_bytes("primary").await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_key_is_rejected() {
    let volumes = TestVolumes::new();
    let store = setup_store(volumes.dir.path()).await;
    let volume = volume("primary", volumes.root("primary"));
    let start = hours_ago(3);
    record_segment(&store, &volume, "gate", start, 10).await;

    let copy = volume.camera_dir("gate").join("copy.mkv");
    std::fs::write(&copy, b"0123456789").unwrap();
    let err = store
        .register(NewSegment::new(
            "gate",
            "primary",
            start,
            Duration::from_secs(60),
            copy.clone(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateSegment { .. }));

    // The replacing variant keeps the newer write.
    let replaced = store
        .register_or_replace(NewSegment::new(
            "gate",
            "primary",
            start,
            Duration::from_secs(60),
            copy.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(replaced.path, copy);
    let all = store.list("primary", Default::default()).collect().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_reconcile_converges_and_is_idempotent() {
    let volumes = TestVolumes::new();
    let store = setup_store(volumes.dir.path()).await;
    let volume = volume("primary", volumes.root("primary"));

    let kept = record_segment(&store, &volume, "gate", hours_ago(5), 10).await;
    let lost = record_segment(&store, &volume, "gate", hours_ago(4), 10).await;
    std::fs::remove_file(&lost.path).unwrap();
    let orphan = write_segment_file(&volume, "yard", hours_ago(3), 20).await;

    let options = ReconcileOptions {
        orphan_policy: OrphanPolicy::Import,
        ..ReconcileOptions::default()
    };
    let report = store
        .reconcile(std::slice::from_ref(&volume), &options)
        .await
        .unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(report.imported, 1);

    let paths: Vec<_> = store
        .list("primary", Default::default())
        .collect()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.path)
        .collect();
    assert_eq!(paths, vec![kept.path.clone(), orphan.clone()]);

    let again = store
        .reconcile(std::slice::from_ref(&volume), &options)
        .await
        .unwrap();
    assert!(again.is_noop());
}

#[tokio::test]
async fn test_query_time_range() {
    let volumes = TestVolumes::new();
    let store = setup_store(volumes.dir.path()).await;
    let volume = volume("primary", volumes.root("primary"));

    record_segment(&store, &volume, "gate", hours_ago(10), 10).await;
    let inside = record_segment(&store, &volume, "gate", hours_ago(5), 10).await;
    record_segment(&store, &volume, "yard", hours_ago(5), 10).await;

    let found = store
        .query(&SegmentQuery {
            camera_id: Some("gate".into()),
            volume_id: None,
            from: Some(hours_ago(6)),
            to: Some(hours_ago(4)),
        })
        .await
        .unwrap();
    assert_eq!(found, vec![inside]);
}
