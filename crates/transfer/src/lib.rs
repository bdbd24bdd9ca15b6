//! Chunked file transfer over HTTP PUT with per-chunk retry.
//!
//! [`ChunkReader`] slices a local file into exact byte ranges and
//! [`ChunkTransferWorker`] sends one range at a time, retrying transient
//! failures and reporting debounced intra-chunk progress.

mod chunked;
mod progress;
mod types;
mod worker;

pub use chunked::ChunkReader;
pub use progress::ProgressDebouncer;
pub use types::Chunk;
pub use worker::{ChunkTransferWorker, ChunkUploader, RetryConfig, UploadFuture, WorkerConfig};

use chunkup_protocol::ChunkRange;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read at byte {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("cannot resume at byte {offset}: file is {file_size} bytes")]
    OffsetOutOfRange { offset: u64, file_size: u64 },

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("{range} failed after {attempts} attempt(s): {reason}")]
    RetriesExhausted {
        range: ChunkRange,
        attempts: u32,
        reason: String,
    },

    #[error("{range} rejected with HTTP {status}")]
    Rejected {
        range: ChunkRange,
        status: u16,
        body: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Returns `true` for failures of the local file rather than the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TransferError::Io(_)
                | TransferError::ShortRead { .. }
                | TransferError::OffsetOutOfRange { .. }
        )
    }
}
