//! Resumable chunked uploads.
//!
//! An [`UploadManager`] keeps at most one job per local file. Each job
//! reads the file in chunks, PUTs them in order through a
//! [`ChunkUploader`](chunkup_transfer::ChunkUploader), records the last
//! acknowledged byte after every chunk and reports progress through
//! replaying event channels. Callers usually work through an
//! [`UploadHandle`]:
//!
//! ```no_run
//! # async fn demo() -> Result<(), chunkup_engine::UploadError> {
//! use chunkup_engine::{EngineConfig, UploadManager};
//!
//! let config = EngineConfig::default();
//! let manager = UploadManager::from_config(&config)?;
//! let handle = manager.handle(config.descriptor("/data/video.mp4", "https://storage.example/put"));
//! handle.add_progress_listener(|p| println!("{:.0}%", p.fraction() * 100.0));
//! handle.start(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handle;
pub mod job;
pub mod types;

pub use config::EngineConfig;
pub use coordinator::UploadManager;
pub use error::{ErrorKind, UploadError};
pub use events::{CallbackContext, ListenerId, ReplayChannel, TaskDispatcher, UploadEvents};
pub use handle::UploadHandle;
pub use job::ActiveUpload;
pub use types::{UploadResult, UploadStatus};

pub use chunkup_protocol::{PersistenceEntry, Progress, UploadDescriptor};
