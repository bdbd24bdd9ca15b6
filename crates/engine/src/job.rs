//! One file's upload, from resume offset to final byte.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkup_protocol::{PersistedState, PersistenceEntry, Progress, UploadDescriptor};
use chunkup_store::{StoreError, UploadStore};
use chunkup_transfer::{ChunkReader, ChunkUploader, TransferError};

use crate::error::UploadError;
use crate::events::{CallbackContext, UploadEvents};
use crate::types::UploadStatus;

/// Why a job was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// Keep the acknowledged offset for a later resume.
    Pause,
    /// Hard stop; the coordinator drops the persisted offset.
    Cancel,
}

/// A registered upload: the job's identity, status and event channels.
///
/// Shared between the coordinator, the running job and any handles bound
/// to it. Only the job and the coordinator change its status.
pub struct ActiveUpload {
    id: u64,
    descriptor: UploadDescriptor,
    status: watch::Sender<UploadStatus>,
    events: UploadEvents,
    cancel: CancellationToken,
    stop_reason: Mutex<Option<StopReason>>,
}

impl ActiveUpload {
    pub(crate) fn new(
        id: u64,
        descriptor: UploadDescriptor,
        context: Arc<dyn CallbackContext>,
    ) -> Self {
        let (status, _) = watch::channel(UploadStatus::Started);
        Self {
            id,
            descriptor,
            status,
            events: UploadEvents::new(context),
            cancel: CancellationToken::new(),
            stop_reason: Mutex::new(None),
        }
    }

    /// Job id, unique within one manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> String {
        self.descriptor.key()
    }

    pub fn descriptor(&self) -> &UploadDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> UploadStatus {
        self.status.borrow().clone()
    }

    /// Watches status changes. The receiver starts at the current status.
    pub fn subscribe_status(&self) -> watch::Receiver<UploadStatus> {
        self.status.subscribe()
    }

    pub fn events(&self) -> &UploadEvents {
        &self.events
    }

    pub(crate) fn set_status(&self, status: UploadStatus) {
        self.status.send_replace(status);
    }

    /// Asks the job to stop. The first reason wins.
    pub(crate) fn stop(&self, reason: StopReason) {
        self.stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(reason);
        self.cancel.cancel();
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ActiveUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveUpload")
            .field("id", &self.id)
            .field("key", &self.descriptor.key())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Drives one [`ActiveUpload`] to success, failure or a requested stop.
pub(crate) struct UploadJob {
    upload: Arc<ActiveUpload>,
    store: Arc<UploadStore>,
    uploader: Arc<dyn ChunkUploader>,
}

impl UploadJob {
    pub(crate) fn new(
        upload: Arc<ActiveUpload>,
        store: Arc<UploadStore>,
        uploader: Arc<dyn ChunkUploader>,
    ) -> Self {
        Self {
            upload,
            store,
            uploader,
        }
    }

    pub(crate) async fn run(self) {
        let key = self.upload.key();
        let mut progress = None;
        let result = self.transfer(&mut progress).await;
        let progress = progress.unwrap_or_default();

        match result {
            Ok(()) => self.succeed(&key, progress).await,
            Err(_) if self.upload.cancel.is_cancelled() => self.stopped(&key, progress).await,
            Err(e) => self.fail(&key, e, progress).await,
        }
    }

    /// Sends every remaining chunk. `progress` is set once the file size is
    /// known and only ever holds acknowledged bytes.
    async fn transfer(&self, progress: &mut Option<Progress>) -> Result<(), UploadError> {
        let upload = &self.upload;
        let descriptor = upload.descriptor();
        let cancel = &upload.cancel;
        let key = descriptor.key();

        upload.set_status(UploadStatus::Preparing);
        let resume_offset = self.store.read_last_byte(&key).saturating_add(1).max(0) as u64;

        let mut reader = ChunkReader::open(descriptor.file_path(), descriptor.chunk_size()).await?;
        reader.seek_to(resume_offset).await?;

        let mut acked = Progress::starting_at(resume_offset, reader.file_size());
        *progress = Some(acked.clone());
        info!(
            file = %key,
            offset = resume_offset,
            total = reader.file_size(),
            "upload running"
        );
        upload.set_status(UploadStatus::Uploading(acked.clone()));
        upload.events.progress.emit(acked.clone());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
                next = reader.next_chunk() => next?,
            };
            let Some(chunk) = next else {
                break;
            };

            let base = acked.clone();
            let on_progress = move |sent: u64| {
                let mut current = base.clone();
                current.set_in_flight(sent);
                upload.set_status(UploadStatus::Uploading(current.clone()));
                upload.events.progress.emit(current);
            };
            self.uploader
                .upload(&chunk, descriptor, &on_progress, cancel)
                .await?;

            acked.acknowledge(chunk.len());
            *progress = Some(acked.clone());
            let entry =
                PersistenceEntry::new(&key, PersistedState::WasRunning, chunk.range.end as i64);
            on_blocking_pool(&self.store, move |store| store.write(&entry)).await?;
            debug!(file = %key, range = %chunk.range, "chunk acknowledged");

            upload.set_status(UploadStatus::Uploading(acked.clone()));
            upload.events.progress.emit(acked.clone());
        }

        Ok(())
    }

    async fn succeed(&self, key: &str, progress: Progress) {
        let owned = key.to_string();
        if let Err(e) = on_blocking_pool(&self.store, move |store| store.remove(&owned)).await {
            warn!(file = %key, error = %e, "failed to drop finished upload offset");
        }
        info!(file = %key, bytes = progress.total_bytes, "upload finished");
        self.upload
            .set_status(UploadStatus::Succeeded(progress.clone()));
        self.upload.events.success.emit(progress);
    }

    async fn fail(&self, key: &str, error: UploadError, progress: Progress) {
        let error = Arc::new(error);
        if error.kind().is_transfer() {
            self.persist_paused(key).await;
        }
        warn!(file = %key, kind = ?error.kind(), error = %error, "upload failed");
        self.upload.set_status(UploadStatus::Failed {
            error: Arc::clone(&error),
            progress,
        });
        self.upload.events.error.emit(error);
    }

    async fn stopped(&self, key: &str, progress: Progress) {
        match self.upload.stop_reason() {
            Some(StopReason::Cancel) => {
                info!(file = %key, "upload cancelled");
                self.upload.set_status(UploadStatus::Ready);
            }
            Some(StopReason::Pause) | None => {
                self.persist_paused(key).await;
                info!(file = %key, offset = progress.bytes_uploaded, "upload paused");
                self.upload.set_status(UploadStatus::Paused(progress));
            }
        }
    }

    /// Marks the stored offset resumable. The store already holds the last
    /// acknowledged byte, since it is written after every chunk.
    async fn persist_paused(&self, key: &str) {
        if let Err(e) = mark_paused(&self.store, key).await {
            warn!(file = %key, error = %e, "failed to persist paused upload");
        }
    }
}

/// Rewrites the entry for `key` as `WasPaused`, keeping its offset.
pub(crate) async fn mark_paused(store: &Arc<UploadStore>, key: &str) -> Result<(), StoreError> {
    let last_byte = store.read_last_byte(key);
    let entry = PersistenceEntry::new(key, PersistedState::WasPaused, last_byte);
    on_blocking_pool(store, move |store| store.write(&entry)).await
}

/// Runs a store mutation, which rewrites the backing file, off the async
/// worker threads.
pub(crate) async fn on_blocking_pool<F>(store: &Arc<UploadStore>, op: F) -> Result<(), StoreError>
where
    F: FnOnce(&UploadStore) -> Result<(), StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || op(&store)).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Io(std::io::Error::other(e))),
    }
}
