//! Process-wide registry of running uploads.
//!
//! All registry changes go through one actor task fed by a command queue,
//! which serializes caller commands against job completions and keeps at
//! most one running job per file key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chunkup_protocol::{PersistenceEntry, UploadDescriptor};
use chunkup_store::UploadStore;
use chunkup_transfer::{ChunkTransferWorker, ChunkUploader};

use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::events::{CallbackContext, TaskDispatcher};
use crate::handle::UploadHandle;
use crate::job::{ActiveUpload, StopReason, UploadJob, mark_paused, on_blocking_pool};
use crate::types::UploadStatus;

/// How long a stopped job may take to wind down before its task is
/// aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

enum Command {
    Upsert {
        descriptor: UploadDescriptor,
        force_restart: bool,
        reply: oneshot::Sender<Arc<ActiveUpload>>,
    },
    Pause {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    JobFinished {
        key: String,
        job_id: u64,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Arc<ActiveUpload>>>,
    },
    List {
        reply: oneshot::Sender<Vec<Arc<ActiveUpload>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Starts, pauses and cancels uploads, one job per file at a time.
///
/// Cheap to clone; all clones talk to the same registry. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct UploadManager {
    tx: mpsc::UnboundedSender<Command>,
    store: Arc<UploadStore>,
}

impl UploadManager {
    /// Creates a manager whose listeners run on a dedicated dispatch task.
    pub fn new(store: Arc<UploadStore>, uploader: Arc<dyn ChunkUploader>) -> Self {
        Self::with_context(store, uploader, TaskDispatcher::spawn())
    }

    /// Creates a manager delivering listener callbacks through `context`.
    pub fn with_context(
        store: Arc<UploadStore>,
        uploader: Arc<dyn ChunkUploader>,
        context: Arc<dyn CallbackContext>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Registry {
            uploads: HashMap::new(),
            next_id: 1,
            store: Arc::clone(&store),
            uploader,
            context,
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx, store }
    }

    /// Builds the HTTP worker and opens the store described by `config`,
    /// dropping offsets older than its resume TTL.
    pub fn from_config(config: &EngineConfig) -> Result<Self, UploadError> {
        let store = match config.store_path() {
            Some(path) => UploadStore::open(path)?,
            None => {
                warn!("no config directory, upload offsets will not survive a restart");
                UploadStore::in_memory()
            }
        };
        if let Some(ttl) = config.resume_ttl() {
            store.prune_older_than(ttl)?;
        }
        let worker = ChunkTransferWorker::new(config.worker_config())?;
        Ok(Self::new(Arc::new(store), Arc::new(worker)))
    }

    /// Returns a handle for `descriptor` without starting anything.
    pub fn handle(&self, descriptor: UploadDescriptor) -> UploadHandle {
        UploadHandle::new(self.clone(), descriptor)
    }

    pub fn store(&self) -> &Arc<UploadStore> {
        &self.store
    }

    /// Returns the running job for the descriptor's file, creating one if
    /// none is registered.
    ///
    /// With `force_restart` any existing job is stopped first and the
    /// persisted offset is dropped, so the new job starts at byte 0.
    pub async fn upsert(
        &self,
        descriptor: UploadDescriptor,
        force_restart: bool,
    ) -> Result<Arc<ActiveUpload>, UploadError> {
        self.request(|reply| Command::Upsert {
            descriptor,
            force_restart,
            reply,
        })
        .await
    }

    /// Stops the job for `key`, keeping its offset for a later resume.
    /// Returns `false` if nothing was registered.
    pub async fn pause(&self, key: &str) -> Result<bool, UploadError> {
        let key = key.to_string();
        self.request(|reply| Command::Pause { key, reply }).await
    }

    /// Stops the job for `key` if any and drops its persisted offset.
    /// Returns `false` if nothing was registered.
    pub async fn cancel(&self, key: &str) -> Result<bool, UploadError> {
        let key = key.to_string();
        self.request(|reply| Command::Cancel { key, reply }).await
    }

    /// Returns the registered job for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<ActiveUpload>>, UploadError> {
        let key = key.to_string();
        self.request(|reply| Command::Get { key, reply }).await
    }

    /// Returns every registered job.
    pub async fn active(&self) -> Result<Vec<Arc<ActiveUpload>>, UploadError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Persisted offsets with no job running, i.e. uploads that can be
    /// resumed after a crash or restart.
    pub async fn recoverable(&self) -> Result<Vec<PersistenceEntry>, UploadError> {
        let active = self.active().await?;
        Ok(self
            .store
            .read_all()
            .into_iter()
            .filter(|entry| !active.iter().any(|u| u.key() == entry.key))
            .collect())
    }

    /// Pauses every job and stops the registry. Later calls fail with a
    /// state error.
    pub async fn shutdown(&self) -> Result<(), UploadError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| UploadError::manager_closed())?;
        rx.await.map_err(|_| UploadError::manager_closed())
    }
}

struct Entry {
    upload: Arc<ActiveUpload>,
    task: JoinHandle<()>,
}

/// Actor state. Owned by the task spawned in [`UploadManager::with_context`].
struct Registry {
    uploads: HashMap<String, Entry>,
    next_id: u64,
    store: Arc<UploadStore>,
    uploader: Arc<dyn ChunkUploader>,
    context: Arc<dyn CallbackContext>,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Upsert {
                    descriptor,
                    force_restart,
                    reply,
                } => {
                    let upload = self.upsert(descriptor, force_restart).await;
                    let _ = reply.send(upload);
                }
                Command::Pause { key, reply } => {
                    let found = self.stop(&key, StopReason::Pause).await;
                    let _ = reply.send(found);
                }
                Command::Cancel { key, reply } => {
                    let found = self.stop(&key, StopReason::Cancel).await;
                    self.drop_offset(&key).await;
                    let _ = reply.send(found);
                }
                Command::JobFinished { key, job_id } => self.job_finished(&key, job_id),
                Command::Get { key, reply } => {
                    let upload = self.uploads.get(&key).map(|e| Arc::clone(&e.upload));
                    let _ = reply.send(upload);
                }
                Command::List { reply } => {
                    let uploads = self
                        .uploads
                        .values()
                        .map(|e| Arc::clone(&e.upload))
                        .collect();
                    let _ = reply.send(uploads);
                }
                Command::Shutdown { reply } => {
                    self.pause_all().await;
                    let _ = reply.send(());
                    info!("upload manager stopped");
                    return;
                }
            }
        }
        // Every manager handle is gone.
        self.pause_all().await;
        debug!("upload manager dropped");
    }

    async fn upsert(
        &mut self,
        descriptor: UploadDescriptor,
        force_restart: bool,
    ) -> Arc<ActiveUpload> {
        let key = descriptor.key();

        if let Some(entry) = self.uploads.get(&key) {
            let finished = entry.upload.status().is_terminal() || entry.task.is_finished();
            if !force_restart && !finished {
                debug!(file = %key, job = entry.upload.id(), "reusing running upload");
                return Arc::clone(&entry.upload);
            }
            self.stop(&key, StopReason::Cancel).await;
        }
        if force_restart {
            self.drop_offset(&key).await;
        }

        let id = self.next_id;
        self.next_id += 1;
        let upload = Arc::new(ActiveUpload::new(id, descriptor, Arc::clone(&self.context)));
        let job = UploadJob::new(
            Arc::clone(&upload),
            Arc::clone(&self.store),
            Arc::clone(&self.uploader),
        );

        let finished = self.tx.clone();
        let job_key = key.clone();
        let task = tokio::spawn(async move {
            job.run().await;
            if let Some(tx) = finished.upgrade() {
                let _ = tx.send(Command::JobFinished {
                    key: job_key,
                    job_id: id,
                });
            }
        });

        info!(file = %key, job = id, force_restart, "upload registered");
        self.uploads.insert(
            key,
            Entry {
                upload: Arc::clone(&upload),
                task,
            },
        );
        upload
    }

    /// Stops and deregisters the job for `key`, waiting for its task to
    /// exit. A job that already succeeded or failed keeps its status.
    ///
    /// A job still running after [`STOP_GRACE`] is aborted and its status
    /// settled here.
    async fn stop(&mut self, key: &str, reason: StopReason) -> bool {
        let Some(Entry { upload, mut task }) = self.uploads.remove(key) else {
            return false;
        };
        upload.stop(reason);

        let joined = match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(file = %key, job = upload.id(), "upload did not stop in time, aborting");
                task.abort();
                task.await
            }
        };
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!(file = %key, error = %e, "upload task ended abnormally");
            }
        }

        if !upload.status().is_terminal() {
            match reason {
                StopReason::Cancel => upload.set_status(UploadStatus::Ready),
                StopReason::Pause if !matches!(upload.status(), UploadStatus::Paused(_)) => {
                    if let Err(e) = mark_paused(&self.store, key).await {
                        warn!(file = %key, error = %e, "failed to persist paused upload");
                    }
                    let mut progress = upload.status().progress().cloned().unwrap_or_default();
                    progress.set_in_flight(0);
                    upload.set_status(UploadStatus::Paused(progress));
                }
                StopReason::Pause => {}
            }
        }
        debug!(file = %key, job = upload.id(), ?reason, "upload stopped");
        true
    }

    fn job_finished(&mut self, key: &str, job_id: u64) {
        match self.uploads.get(key) {
            Some(entry) if entry.upload.id() == job_id => {
                self.uploads.remove(key);
                debug!(file = %key, job = job_id, "upload deregistered");
            }
            _ => debug!(file = %key, job = job_id, "ignoring stale job completion"),
        }
    }

    async fn drop_offset(&self, key: &str) {
        let owned = key.to_string();
        if let Err(e) = on_blocking_pool(&self.store, move |store| store.remove(&owned)).await {
            warn!(file = %key, error = %e, "failed to drop upload offset");
        }
    }

    async fn pause_all(&mut self) {
        let keys: Vec<String> = self.uploads.keys().cloned().collect();
        for key in keys {
            self.stop(&key, StopReason::Pause).await;
        }
    }
}
