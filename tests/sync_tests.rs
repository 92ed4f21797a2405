// Tests for cache-to-original replication

use cachemax::copy::{CopyOptions, VerifiedCopyEngine};
use cachemax::sync::{
    ChangeKind, QueueStatus, SyncConfiguration, SyncEngine, SyncEvent, SyncMode, SyncOperation,
    SyncSettings, WatchEvent,
};
use cachemax::Progress;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

fn engine() -> SyncEngine {
    let options = CopyOptions {
        force_disk_sync: false,
        ..CopyOptions::default()
    };
    let settings = SyncSettings {
        write_settle: Duration::from_millis(100),
        write_checks: 5,
        ..SyncSettings::default()
    };
    SyncEngine::new(VerifiedCopyEngine::new(options.clone()), options, settings)
}

fn dirs(root: &Path) -> SyncConfiguration {
    let cache = root.join("cache");
    let original = root.join("original");
    fs::create_dir_all(&cache).unwrap();
    fs::create_dir_all(&original).unwrap();
    SyncConfiguration::new(cache, original)
}

async fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    path.exists()
}

#[tokio::test]
async fn test_new_file_in_cache_reaches_original() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    let engine = engine();
    engine.start_monitoring(config.clone()).await.unwrap();
    assert!(engine.is_monitoring(&config.cache_path).await);

    fs::create_dir_all(config.cache_path.join("docs")).unwrap();
    fs::write(config.cache_path.join("docs/report.txt"), b"quarterly numbers").unwrap();

    let target = config.original_path.join("docs/report.txt");
    assert!(wait_for(&target, Duration::from_secs(15)).await);
    assert!(engine.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(fs::read(&target).unwrap(), b"quarterly numbers");

    assert!(engine.stop_monitoring(&config.cache_path).await);
    assert!(!engine.is_monitoring(&config.cache_path).await);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_rapid_events_for_one_file_sync_once() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    let file = config.cache_path.join("hot.bin");
    fs::write(&file, vec![7u8; 4096]).unwrap();

    let engine = engine();
    engine.start_monitoring(config.clone()).await.unwrap();
    for _ in 0..100 {
        assert!(
            engine
                .inject_event(&config.cache_path, WatchEvent::new(ChangeKind::Changed, &file))
                .await
        );
    }

    let target = config.original_path.join("hot.bin");
    assert!(wait_for(&target, Duration::from_secs(10)).await);
    assert!(engine.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(fs::read(&target).unwrap().len(), 4096);
    assert_eq!(engine.stats().completed, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_temporary_files_are_not_replicated() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    let engine = engine();
    engine.start_monitoring(config.clone()).await.unwrap();

    let lock = config.cache_path.join("~$budget.xlsx");
    fs::write(&lock, b"owner").unwrap();
    engine
        .inject_event(&config.cache_path, WatchEvent::new(ChangeKind::Created, &lock))
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(engine.wait_idle(Duration::from_secs(5)).await);

    assert!(!config.original_path.join("~$budget.xlsx").exists());
    assert_eq!(engine.stats().completed, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_periodic_mode_holds_until_sweep() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path()).with_mode(SyncMode::Periodic, 3600);
    let engine = engine();
    let file = config.cache_path.join("later.txt");
    fs::write(&file, b"batch").unwrap();

    engine.submit(SyncOperation::new(&config, ChangeKind::Created, &file));
    engine.submit(SyncOperation::new(&config, ChangeKind::Changed, &file));
    assert_eq!(engine.pending_count(), 2);
    assert!(!config.original_path.join("later.txt").exists());
    assert_eq!(engine.sweep_due(chrono::Utc::now()), 0);

    assert_eq!(engine.sweep_periodic(), 2);
    assert!(engine.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(fs::read(config.original_path.join("later.txt")).unwrap(), b"batch");
}

#[tokio::test]
async fn test_periodic_delete_then_recreate_keeps_file() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path()).with_mode(SyncMode::Periodic, 3600);
    let engine = engine();
    let file = config.cache_path.join("draft.txt");
    fs::write(config.original_path.join("draft.txt"), b"v1").unwrap();

    fs::write(&file, b"v1").unwrap();
    engine.submit(SyncOperation::new(&config, ChangeKind::Created, &file));
    fs::remove_file(&file).unwrap();
    engine.submit(SyncOperation::new(&config, ChangeKind::Deleted, &file));
    fs::write(&file, b"v2").unwrap();
    engine.submit(SyncOperation::new(&config, ChangeKind::Created, &file));

    // only the last word on the path is kept
    assert_eq!(engine.pending_count(), 1);
    assert_eq!(engine.sweep_periodic(), 1);
    assert!(engine.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(fs::read(config.original_path.join("draft.txt")).unwrap(), b"v2");
}

#[tokio::test]
async fn test_periodic_recreate_then_delete_removes_file() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path()).with_mode(SyncMode::Periodic, 3600);
    let engine = engine();
    let file = config.cache_path.join("scratch.txt");
    fs::write(config.original_path.join("scratch.txt"), b"old").unwrap();

    fs::write(&file, b"new").unwrap();
    engine.submit(SyncOperation::new(&config, ChangeKind::Changed, &file));
    fs::remove_file(&file).unwrap();
    engine.submit(SyncOperation::new(&config, ChangeKind::Deleted, &file));

    assert_eq!(engine.pending_count(), 1);
    assert_eq!(engine.sweep_periodic(), 1);
    assert!(engine.wait_idle(Duration::from_secs(10)).await);
    assert!(!config.original_path.join("scratch.txt").exists());
}

#[cfg(windows)]
#[tokio::test]
async fn test_locked_source_waits_for_release() {
    use cachemax::fs::Backoff;
    use std::os::windows::fs::OpenOptionsExt;

    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    let options = CopyOptions {
        force_disk_sync: false,
        ..CopyOptions::default()
    };
    let settings = SyncSettings {
        lock_backoff: Backoff {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(200),
            max_attempts: 30,
        },
        ..SyncSettings::default()
    };
    let engine = SyncEngine::new(VerifiedCopyEngine::new(options.clone()), options, settings);
    let file = config.cache_path.join("held.xlsx");
    fs::write(&file, b"sheet").unwrap();
    let handle = fs::OpenOptions::new()
        .read(true)
        .share_mode(0)
        .open(&file)
        .unwrap();

    engine.dispatch(SyncOperation::new(&config, ChangeKind::Changed, &file));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!config.original_path.join("held.xlsx").exists());
    assert_eq!(engine.stats().in_flight, 1);

    drop(handle);
    assert!(engine.wait_idle(Duration::from_secs(15)).await);
    assert_eq!(fs::read(config.original_path.join("held.xlsx")).unwrap(), b"sheet");
    assert_eq!(engine.stats().completed, 1);
}

#[tokio::test]
async fn test_subscribers_see_queue_and_completion() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    let engine = engine();
    let mut events = engine.subscribe();
    let file = config.cache_path.join("watched.txt");
    fs::write(&file, b"hello").unwrap();

    engine.dispatch(SyncOperation::new(&config, ChangeKind::Created, &file));
    assert!(engine.wait_idle(Duration::from_secs(10)).await);

    let mut added = false;
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::ItemAdded(item) => {
                added = true;
                assert_eq!(item.file_name(), "watched.txt");
            }
            SyncEvent::Completed { bytes, .. } => completed = Some(bytes),
            _ => {}
        }
    }
    assert!(added);
    assert_eq!(completed, Some(5));

    assert_eq!(engine.clear_completed(), 1);
    assert!(engine.queue_items().is_empty());
}

#[tokio::test]
async fn test_vanished_source_is_skipped() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    let engine = engine();
    let mut events = engine.subscribe();

    let ghost = config.cache_path.join("ghost.txt");
    engine.dispatch(SyncOperation::new(&config, ChangeKind::Changed, &ghost));
    assert!(engine.wait_idle(Duration::from_secs(10)).await);

    let items = engine.queue_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Done);
    let stats = engine.stats();
    assert_eq!((stats.completed, stats.skipped, stats.failed), (0, 1, 0));
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SyncEvent::Failed { .. }));
    }
    assert!(!config.original_path.join("ghost.txt").exists());
}

#[tokio::test]
async fn test_force_sync_mirrors_whole_tree() {
    let dir = tempdir().unwrap();
    let config = dirs(dir.path());
    fs::create_dir_all(config.cache_path.join("a/b")).unwrap();
    fs::write(config.cache_path.join("a/one.txt"), b"1").unwrap();
    fs::write(config.cache_path.join("a/b/two.txt"), b"22").unwrap();
    fs::write(config.cache_path.join("a/b/~$two.docx"), b"lock").unwrap();

    let engine = engine();
    let report = engine
        .force_sync(&config.cache_path, &config.original_path, &Progress::silent())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.files_copied, 2);
    assert_eq!(report.bytes_copied, 3);
    assert_eq!(fs::read(config.original_path.join("a/b/two.txt")).unwrap(), b"22");
    assert!(!config.original_path.join("a/b/~$two.docx").exists());

    let again = engine
        .force_sync(&config.cache_path, &config.original_path, &Progress::silent())
        .await
        .unwrap();
    assert_eq!(again.files_copied, 0);
    assert_eq!(again.files_skipped, 2);
}
