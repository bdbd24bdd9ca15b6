//! Caller-facing handle for one file's upload.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use chunkup_protocol::{Progress, UploadDescriptor};

use crate::coordinator::UploadManager;
use crate::error::UploadError;
use crate::events::ListenerId;
use crate::job::ActiveUpload;
use crate::types::{UploadResult, UploadStatus};

type ProgressListener = Arc<dyn Fn(&Progress) + Send + Sync>;
type ResultListener = Arc<dyn Fn(&UploadResult) + Send + Sync>;

#[derive(Default)]
struct HandleState {
    progress_listeners: Vec<(ListenerId, ProgressListener)>,
    result_listeners: Vec<(ListenerId, ResultListener)>,
    bound: Option<Arc<ActiveUpload>>,
    /// Terminal error of a job this handle was bound to before.
    last_error: Option<Arc<UploadError>>,
}

impl HandleState {
    fn listener_ids(&self) -> impl Iterator<Item = ListenerId> + '_ {
        self.progress_listeners
            .iter()
            .map(|(id, _)| *id)
            .chain(self.result_listeners.iter().map(|(id, _)| *id))
    }

    /// Unhooks listeners from the bound job, remembering how it ended.
    fn unbind(&mut self) {
        let Some(old) = self.bound.take() else {
            return;
        };
        match old.status() {
            UploadStatus::Failed { error, .. } => self.last_error = Some(error),
            UploadStatus::Succeeded(_) => self.last_error = None,
            _ => {}
        }
        for id in self.listener_ids() {
            old.events().remove(id);
        }
    }
}

/// Controls the upload of one file and observes its progress.
///
/// Listeners registered on the handle survive restarts: whenever the
/// handle moves to a new job they are attached to that job's channels and
/// receive its latest progress right away. Dropping the handle detaches
/// them; the upload itself keeps running.
pub struct UploadHandle {
    manager: UploadManager,
    descriptor: UploadDescriptor,
    state: Mutex<HandleState>,
}

impl UploadHandle {
    pub(crate) fn new(manager: UploadManager, descriptor: UploadDescriptor) -> Self {
        Self {
            manager,
            descriptor,
            state: Mutex::new(HandleState::default()),
        }
    }

    pub fn descriptor(&self) -> &UploadDescriptor {
        &self.descriptor
    }

    /// Starts the upload, or attaches to the job already running for this
    /// file. After a pause or failure the new job resumes at the last
    /// acknowledged byte unless `force_restart` is set.
    pub async fn start(&self, force_restart: bool) -> Result<(), UploadError> {
        let upload = self
            .manager
            .upsert(self.descriptor.clone(), force_restart)
            .await?;
        self.attach(upload);
        Ok(())
    }

    /// Pauses the upload; a later [`start`](Self::start) resumes it.
    pub async fn pause(&self) -> Result<(), UploadError> {
        self.manager.pause(&self.descriptor.key()).await?;
        Ok(())
    }

    /// Stops the upload and forgets its progress.
    pub async fn cancel(&self) -> Result<(), UploadError> {
        self.manager.cancel(&self.descriptor.key()).await?;
        self.lock().unbind();
        Ok(())
    }

    /// Attaches to a job started elsewhere (another handle, or before this
    /// one was created). Returns `false` if none is running.
    pub async fn bind(&self) -> Result<bool, UploadError> {
        match self.manager.get(&self.descriptor.key()).await? {
            Some(upload) => {
                self.attach(upload);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.lock()
            .bound
            .as_ref()
            .map_or(UploadStatus::Ready, |u| u.status())
    }

    /// Watches the status of the bound job, if any.
    pub fn subscribe_status(&self) -> Option<watch::Receiver<UploadStatus>> {
        self.lock().bound.as_ref().map(|u| u.subscribe_status())
    }

    /// Latest progress of the bound job, if it has reported any.
    pub fn current_progress(&self) -> Option<Progress> {
        let state = self.lock();
        let upload = state.bound.as_ref()?;
        upload
            .status()
            .progress()
            .cloned()
            .or_else(|| upload.events().progress.latest())
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Most recent terminal error, cleared by a later success.
    pub fn last_error(&self) -> Option<Arc<UploadError>> {
        let state = self.lock();
        match state.bound.as_ref().map(|u| u.status()) {
            Some(UploadStatus::Failed { error, .. }) => Some(error),
            Some(UploadStatus::Succeeded(_)) => None,
            _ => state.last_error.clone(),
        }
    }

    pub fn add_progress_listener(
        &self,
        listener: impl Fn(&Progress) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next();
        let listener: ProgressListener = Arc::new(listener);
        let mut state = self.lock();
        if let Some(upload) = &state.bound {
            upload
                .events()
                .progress
                .subscribe_as(id, Arc::clone(&listener));
        }
        state.progress_listeners.push((id, listener));
        id
    }

    /// Registers a listener for the terminal outcome of each job.
    pub fn add_result_listener(
        &self,
        listener: impl Fn(&UploadResult) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next();
        let listener: ResultListener = Arc::new(listener);
        let mut state = self.lock();
        if let Some(upload) = &state.bound {
            subscribe_result(upload, id, Arc::clone(&listener));
        }
        state.result_listeners.push((id, listener));
        id
    }

    /// Removes one listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.progress_listeners.len() + state.result_listeners.len();
        state.progress_listeners.retain(|(l, _)| *l != id);
        state.result_listeners.retain(|(l, _)| *l != id);
        if let Some(upload) = &state.bound {
            upload.events().remove(id);
        }
        before != state.progress_listeners.len() + state.result_listeners.len()
    }

    pub fn clear_listeners(&self) {
        let mut state = self.lock();
        if let Some(upload) = &state.bound {
            for id in state.listener_ids() {
                upload.events().remove(id);
            }
        }
        state.progress_listeners.clear();
        state.result_listeners.clear();
    }

    fn attach(&self, upload: Arc<ActiveUpload>) {
        let mut state = self.lock();
        if state
            .bound
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &upload))
        {
            return;
        }
        state.unbind();
        for (id, listener) in &state.progress_listeners {
            upload
                .events()
                .progress
                .subscribe_as(*id, Arc::clone(listener));
        }
        for (id, listener) in &state.result_listeners {
            subscribe_result(&upload, *id, Arc::clone(listener));
        }
        state.bound = Some(upload);
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        let state = self.lock();
        if let Some(upload) = &state.bound {
            for id in state.listener_ids() {
                upload.events().remove(id);
            }
        }
    }
}

fn subscribe_result(upload: &ActiveUpload, id: ListenerId, listener: ResultListener) {
    let on_success = Arc::clone(&listener);
    upload.events().success.subscribe_as(
        id,
        Arc::new(move |p: &Progress| on_success(&UploadResult::Succeeded(p.clone()))),
    );
    upload.events().error.subscribe_as(
        id,
        Arc::new(move |e: &Arc<UploadError>| listener(&UploadResult::Failed(Arc::clone(e)))),
    );
}
