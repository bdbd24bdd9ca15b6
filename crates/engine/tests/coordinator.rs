mod common;

use std::sync::Arc;
use std::time::Duration;

use chunkup_engine::{ErrorKind, UploadManager, UploadStatus};
use chunkup_protocol::{PersistedState, PersistenceEntry, Progress, UploadDescriptor};
use chunkup_store::UploadStore;
use chunkup_transfer::{Chunk, ChunkUploader, UploadFuture};
use tokio_util::sync::CancellationToken;

use common::{PacedUploader, open_store, wait_for, wait_for_offset, write_file};

#[tokio::test]
async fn upsert_without_force_reuses_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.bin", 100);
    let uploader = PacedUploader::new(Duration::from_millis(50));
    let manager = UploadManager::new(Arc::new(UploadStore::in_memory()), uploader.clone());
    let descriptor = UploadDescriptor::new(&path, "http://unused").with_chunk_size(10);

    let first = manager.upsert(descriptor.clone(), false).await.unwrap();
    let second = manager.upsert(descriptor.clone(), false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.active().await.unwrap().len(), 1);

    let third = manager.upsert(descriptor, true).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert!(matches!(first.status(), UploadStatus::Ready));
    assert_eq!(manager.active().await.unwrap().len(), 1);
    assert_eq!(uploader.max_active(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_never_run_two_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.bin", 64);
    let uploader = PacedUploader::new(Duration::from_millis(2));
    let manager = UploadManager::new(open_store(dir.path()), uploader.clone());
    let descriptor = UploadDescriptor::new(&path, "http://unused").with_chunk_size(4);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let manager = manager.clone();
            let descriptor = descriptor.clone();
            tokio::spawn(async move {
                match i % 4 {
                    0 => drop(manager.upsert(descriptor, false).await.unwrap()),
                    1 => drop(manager.upsert(descriptor, true).await.unwrap()),
                    2 => {
                        manager.pause(&descriptor.key()).await.unwrap();
                    }
                    _ => {
                        manager.cancel(&descriptor.key()).await.unwrap();
                    }
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(manager.active().await.unwrap().len() <= 1);
    assert!(uploader.max_active() <= 1);
}

#[tokio::test]
async fn cancel_drops_offset_and_returns_to_ready() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.bin", 40);
    let store = open_store(dir.path());
    let manager = UploadManager::new(Arc::clone(&store), PacedUploader::new(Duration::from_millis(20)));
    let descriptor = UploadDescriptor::new(&path, "http://unused").with_chunk_size(4);
    let key = descriptor.key();
    let handle = manager.handle(descriptor);

    handle.start(false).await.unwrap();
    wait_for_offset(&store, &key, 3).await;
    handle.cancel().await.unwrap();

    assert!(matches!(handle.status(), UploadStatus::Ready));
    assert!(!handle.is_running());
    assert!(store.get(&key).is_none());
    assert!(manager.active().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_after_pause_forgets_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.bin", 40);
    let store = open_store(dir.path());
    let manager = UploadManager::new(Arc::clone(&store), PacedUploader::new(Duration::from_millis(20)));
    let descriptor = UploadDescriptor::new(&path, "http://unused").with_chunk_size(4);
    let key = descriptor.key();
    let handle = manager.handle(descriptor);

    handle.start(false).await.unwrap();
    wait_for_offset(&store, &key, 3).await;
    handle.pause().await.unwrap();
    assert!(store.get(&key).is_some());

    assert!(!manager.cancel(&key).await.unwrap());
    assert!(store.get(&key).is_none());
}

#[tokio::test]
async fn pause_unknown_key_is_noop() {
    let manager = UploadManager::new(
        Arc::new(UploadStore::in_memory()),
        PacedUploader::new(Duration::ZERO),
    );
    assert!(!manager.pause("/nowhere").await.unwrap());
    assert!(manager.get("/nowhere").await.unwrap().is_none());
}

#[tokio::test]
async fn recoverable_excludes_running_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let running = write_file(dir.path(), "running.bin", 400);
    let store = open_store(dir.path());
    store
        .write(&PersistenceEntry::new("/elsewhere/paused.bin", PersistedState::WasPaused, 99))
        .unwrap();

    let manager = UploadManager::new(Arc::clone(&store), PacedUploader::new(Duration::from_millis(20)));
    let descriptor = UploadDescriptor::new(&running, "http://unused").with_chunk_size(4);
    let key = descriptor.key();
    manager.upsert(descriptor, false).await.unwrap();
    wait_for_offset(&store, &key, 3).await;

    let keys: Vec<String> = manager
        .recoverable()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(keys, vec!["/elsewhere/paused.bin".to_string()]);

    manager.pause(&key).await.unwrap();
    assert_eq!(manager.recoverable().await.unwrap().len(), 2);
}

#[tokio::test]
async fn shutdown_pauses_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let manager = UploadManager::new(Arc::clone(&store), PacedUploader::new(Duration::from_millis(20)));

    let mut handles = Vec::new();
    for name in ["a.bin", "b.bin"] {
        let path = write_file(dir.path(), name, 80);
        let handle = manager.handle(UploadDescriptor::new(&path, "http://unused").with_chunk_size(4));
        handle.start(false).await.unwrap();
        handles.push(handle);
    }
    for handle in &handles {
        wait_for(handle, "upload", |s| matches!(s, UploadStatus::Uploading(_))).await;
    }

    manager.shutdown().await.unwrap();

    for handle in &handles {
        assert!(matches!(handle.status(), UploadStatus::Paused(_)));
        let entry = store.get(&handle.descriptor().key()).unwrap();
        assert_eq!(entry.state, PersistedState::WasPaused);
    }

    let err = handles[0].start(false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[tokio::test]
async fn missing_file_is_local_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let manager = UploadManager::new(Arc::clone(&store), PacedUploader::new(Duration::ZERO));
    let descriptor = UploadDescriptor::new(dir.path().join("gone.bin"), "http://unused");
    let key = descriptor.key();
    let handle = manager.handle(descriptor);

    handle.start(false).await.unwrap();
    wait_for(&handle, "failure", |s| matches!(s, UploadStatus::Failed { .. })).await;

    assert_eq!(handle.last_error().unwrap().kind(), ErrorKind::LocalIo);
    assert!(store.get(&key).is_none());
}

/// Acknowledges the first chunk, then hangs on the next one without
/// looking at its cancellation token.
struct HangingUploader;

impl ChunkUploader for HangingUploader {
    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        _descriptor: &'a UploadDescriptor,
        on_progress: &'a (dyn Fn(u64) + Send + Sync),
        _cancel: &'a CancellationToken,
    ) -> UploadFuture<'a> {
        Box::pin(async move {
            if chunk.range.start > 0 {
                std::future::pending::<()>().await;
            }
            on_progress(chunk.len());
            Ok(Progress::starting_at(chunk.len(), chunk.len()))
        })
    }
}

#[tokio::test]
async fn pause_of_unresponsive_job_completes_and_keeps_offset() {
    let dir = tempfile::tempdir().unwrap();
    let hung = write_file(dir.path(), "hung.bin", 40);
    let other = write_file(dir.path(), "other.bin", 40);
    let store = open_store(dir.path());
    let manager = UploadManager::new(Arc::clone(&store), Arc::new(HangingUploader));
    let descriptor = UploadDescriptor::new(&hung, "http://unused").with_chunk_size(4);
    let key = descriptor.key();
    let handle = manager.handle(descriptor);
    manager
        .upsert(UploadDescriptor::new(&other, "http://unused").with_chunk_size(4), false)
        .await
        .unwrap();

    handle.start(false).await.unwrap();
    wait_for_offset(&store, &key, 3).await;

    let paused = tokio::time::timeout(Duration::from_secs(15), manager.pause(&key))
        .await
        .expect("pause returned");
    assert!(paused.unwrap());

    let status = handle.status();
    assert!(matches!(status, UploadStatus::Paused(_)), "{status:?}");
    assert_eq!(status.progress().unwrap().bytes_in_flight, 0);
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.state, PersistedState::WasPaused);
    assert_eq!(entry.last_successful_byte, 3);

    let still_served = tokio::time::timeout(
        Duration::from_secs(1),
        manager.get(&other.display().to_string()),
    )
    .await
    .expect("coordinator still answering");
    assert!(still_served.is_ok());
    assert!(manager.get(&key).await.unwrap().is_none());
}
