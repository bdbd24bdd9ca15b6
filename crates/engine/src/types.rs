use std::sync::Arc;

use chunkup_protocol::Progress;

use crate::error::UploadError;

/// Lifecycle state of one upload.
#[derive(Debug, Clone)]
pub enum UploadStatus {
    /// Nothing running.
    Ready,
    /// A job has been created and not yet touched the file.
    Started,
    /// Reading the resume offset and opening the file.
    Preparing,
    Uploading(Progress),
    Paused(Progress),
    Failed {
        error: Arc<UploadError>,
        progress: Progress,
    },
    Succeeded(Progress),
}

impl UploadStatus {
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            UploadStatus::Uploading(p)
            | UploadStatus::Paused(p)
            | UploadStatus::Succeeded(p)
            | UploadStatus::Failed { progress: p, .. } => Some(p),
            UploadStatus::Ready | UploadStatus::Started | UploadStatus::Preparing => None,
        }
    }

    /// Returns `true` while a job is working on the upload.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            UploadStatus::Started | UploadStatus::Preparing | UploadStatus::Uploading(_)
        )
    }

    /// Returns `true` once the job has succeeded or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Failed { .. } | UploadStatus::Succeeded(_)
        )
    }

    pub fn error(&self) -> Option<&Arc<UploadError>> {
        match self {
            UploadStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Terminal outcome delivered to result listeners.
#[derive(Debug, Clone)]
pub enum UploadResult {
    Succeeded(Progress),
    Failed(Arc<UploadError>),
}

impl UploadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadResult::Succeeded(_))
    }
}
