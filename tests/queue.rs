//! Operation queue behavior: deduplication, capacity, retry, the
//! synchronous upload path, and atomic remote replacement

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cloudmount::queue::{OperationQueue, QueueConfig};
use common::InMemoryRemote;

fn temp_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn make_queue(remote: Arc<InMemoryRemote>, config: QueueConfig) -> Arc<OperationQueue> {
    Arc::new(OperationQueue::new(remote, config))
}

#[tokio::test]
async fn queue_upload_deduplicates_by_remote_path() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote, QueueConfig::default());

    let a = temp_file(&dir, "a", b"1");
    let b = temp_file(&dir, "b", b"2");

    assert!(queue.queue_upload(&a, "/y", 0).await);
    assert!(queue.queue_upload(&b, "/y", 5).await);

    let status = queue.status().await;
    assert_eq!(status.upload_queue_size, 1);
    assert_eq!(status.pending_uploads, 1);
}

#[tokio::test]
async fn queue_rejects_submissions_at_capacity() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(
        remote,
        QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        },
    );

    let f = temp_file(&dir, "f", b"x");
    assert!(queue.queue_upload(&f, "/one", 0).await);
    assert!(queue.queue_upload(&f, "/two", 0).await);
    assert!(!queue.queue_upload(&f, "/three", 0).await);

    let status = queue.status().await;
    assert_eq!(status.upload_queue_size, 2);
    assert_eq!(status.stats.queue_full_rejections, 1);
}

#[tokio::test]
async fn process_pending_executes_uploads() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote.clone(), QueueConfig::default());

    let f = temp_file(&dir, "f", b"payload");
    assert!(queue.queue_upload(&f, "/a.txt", 0).await);
    queue.process_pending().await;

    assert!(queue.wait_for_file_upload("/a.txt", Duration::from_secs(5)).await);
    assert_eq!(remote.contents("/a.txt").unwrap(), b"payload");
    assert_eq!(queue.stats_snapshot().successful_uploads, 1);

    queue.wait_for_completion(Some(Duration::from_secs(5))).await;
    queue.process_pending().await;
    assert_eq!(queue.status().await.in_flight, 0);
}

#[tokio::test]
async fn transient_upload_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote.clone(), QueueConfig::default());

    remote.fail_next_uploads(1);
    let f = temp_file(&dir, "f", b"retry me");
    assert!(queue.queue_upload(&f, "/r.txt", 0).await);
    queue.process_pending().await;

    assert!(queue.wait_for_file_upload("/r.txt", Duration::from_secs(10)).await);
    assert_eq!(remote.contents("/r.txt").unwrap(), b"retry me");
    assert_eq!(remote.uploads(), 2);
    assert_eq!(queue.stats_snapshot().successful_uploads, 1);
    assert_eq!(queue.stats_snapshot().failed_uploads, 0);
}

#[tokio::test]
async fn exhausted_retries_invoke_failure_hook() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(
        remote.clone(),
        QueueConfig {
            max_retries: 1,
            ..QueueConfig::default()
        },
    );

    let failed = Arc::new(AtomicBool::new(false));
    {
        let failed = failed.clone();
        queue.set_upload_failure_hook(move |path| {
            assert_eq!(path, "/bad.txt");
            failed.store(true, Ordering::SeqCst);
        });
    }

    remote.fail_next_uploads(10);
    let f = temp_file(&dir, "f", b"doomed");
    assert!(queue.queue_upload(&f, "/bad.txt", 0).await);

    for _ in 0..100 {
        queue.process_pending().await;
        if failed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(failed.load(Ordering::SeqCst));
    assert_eq!(queue.stats_snapshot().failed_uploads, 2);
    assert!(remote.contents("/bad.txt").is_none());
}

#[tokio::test]
async fn sync_upload_replaces_existing_target_atomically() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote.clone(), QueueConfig::default());

    remote.insert_file("/x", b"old");
    let f = temp_file(&dir, "x", b"abc");

    assert!(queue.upload_file_sync(&f, "/x", Duration::from_secs(10)).await);

    assert_eq!(remote.contents("/x").unwrap(), b"abc");
    assert_eq!(queue.stats_snapshot().atomic_replacements, 1);
    assert_eq!(queue.stats_snapshot().atomic_replacement_failures, 0);
    assert_eq!(remote.deletes(), 1);
    assert_eq!(remote.renames(), 1);
    // No temporary left behind
    assert!(remote.file_names().iter().all(|n| !n.contains(".tmp.")));
}

#[tokio::test]
async fn sync_upload_of_missing_file_fails() {
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote, QueueConfig::default());

    let missing = PathBuf::from("/nonexistent/nowhere.txt");
    assert!(!queue.upload_file_sync(&missing, "/a", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn sync_upload_respects_timeout() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote.clone(), QueueConfig::default());

    remote.set_upload_delay(Duration::from_millis(500));
    let f = temp_file(&dir, "slow", b"slow");

    assert!(!queue.upload_file_sync(&f, "/slow.txt", Duration::from_millis(50)).await);
    assert!(remote.contents("/slow.txt").is_none());
}

#[tokio::test]
async fn downloads_create_parent_directories() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote.clone(), QueueConfig::default());

    remote.insert_file("/dl.txt", b"remote bytes");
    let target = dir.path().join("sub").join("dl.txt");

    assert!(queue.queue_download("/dl.txt", &target, 0).await);
    queue.process_pending().await;
    queue.wait_for_completion(Some(Duration::from_secs(5))).await;

    assert_eq!(std::fs::read(&target).unwrap(), b"remote bytes");
    assert_eq!(queue.stats_snapshot().successful_downloads, 1);
}

#[tokio::test]
async fn cancel_all_clears_queues() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let queue = make_queue(remote, QueueConfig::default());

    let f = temp_file(&dir, "f", b"x");
    assert!(queue.queue_upload(&f, "/a", 0).await);
    assert!(queue.queue_upload(&f, "/b", 0).await);
    assert!(queue.queue_download("/c", &f, 0).await);

    queue.cancel_all().await;

    let status = queue.status().await;
    assert_eq!(status.upload_queue_size, 0);
    assert_eq!(status.download_queue_size, 0);
    assert_eq!(status.pending_uploads, 0);
    assert_eq!(status.pending_downloads, 0);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn higher_priority_operations_run_first() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    // One upload at a time so ordering is observable
    let queue = make_queue(
        remote.clone(),
        QueueConfig {
            max_concurrent_uploads: 1,
            ..QueueConfig::default()
        },
    );

    let low = temp_file(&dir, "low", b"low");
    let high = temp_file(&dir, "high", b"high");
    assert!(queue.queue_upload(&low, "/low.txt", 0).await);
    assert!(queue.queue_upload(&high, "/high.txt", 10).await);

    queue.process_pending().await;
    // Only the high-priority operation was promoted into the single slot
    assert!(queue.wait_for_file_upload("/high.txt", Duration::from_secs(5)).await);
    assert!(remote.contents("/high.txt").is_some());

    queue.process_pending().await;
    assert!(queue.wait_for_file_upload("/low.txt", Duration::from_secs(5)).await);
    assert!(remote.contents("/low.txt").is_some());
}
