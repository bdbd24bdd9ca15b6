use chunkup_store::StoreError;
use chunkup_transfer::TransferError;

/// Coarse classification of an [`UploadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A chunk kept failing with retryable errors until its attempts ran out.
    TransientTransfer,
    /// The endpoint rejected a chunk outright.
    FatalTransfer,
    /// The local file could not be opened, positioned or read.
    LocalIo,
    /// The engine itself is unavailable or its store failed.
    State,
}

impl ErrorKind {
    /// Returns `true` for failures on the network side of an upload.
    pub fn is_transfer(self) -> bool {
        matches!(self, ErrorKind::TransientTransfer | ErrorKind::FatalTransfer)
    }
}

/// Errors from upload operations.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    State(String),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Transfer(TransferError::RetriesExhausted { .. }) => {
                ErrorKind::TransientTransfer
            }
            UploadError::Transfer(TransferError::Rejected { .. } | TransferError::Client(_)) => {
                ErrorKind::FatalTransfer
            }
            UploadError::Transfer(e) if e.is_local() => ErrorKind::LocalIo,
            UploadError::Transfer(_) | UploadError::Store(_) | UploadError::State(_) => {
                ErrorKind::State
            }
        }
    }

    pub(crate) fn manager_closed() -> Self {
        UploadError::State("upload manager has shut down".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkup_protocol::ChunkRange;

    fn range() -> ChunkRange {
        ChunkRange {
            start: 0,
            end: 9,
            total: 10,
        }
    }

    #[test]
    fn kinds() {
        let exhausted = UploadError::from(TransferError::RetriesExhausted {
            range: range(),
            attempts: 3,
            reason: "HTTP 503".into(),
        });
        assert_eq!(exhausted.kind(), ErrorKind::TransientTransfer);
        assert!(exhausted.kind().is_transfer());

        let rejected = UploadError::from(TransferError::Rejected {
            range: range(),
            status: 403,
            body: String::new(),
        });
        assert_eq!(rejected.kind(), ErrorKind::FatalTransfer);

        let short = UploadError::from(TransferError::ShortRead {
            offset: 0,
            expected: 10,
            actual: 4,
        });
        assert_eq!(short.kind(), ErrorKind::LocalIo);
        assert!(!short.kind().is_transfer());

        assert_eq!(UploadError::manager_closed().kind(), ErrorKind::State);
    }

    #[test]
    fn transfer_message_is_transparent() {
        let err = UploadError::from(TransferError::Rejected {
            range: range(),
            status: 404,
            body: String::new(),
        });
        assert_eq!(err.to_string(), "bytes 0-9/10 rejected with HTTP 404");
    }
}
