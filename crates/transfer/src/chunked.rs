use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use chunkup_protocol::{ChunkRange, chunk_ranges};

use crate::TransferError;
use crate::types::Chunk;

/// Reads a file as a sequence of contiguous chunk ranges.
///
/// Every chunk holds exactly the bytes of its range; a file that shrinks
/// under the reader surfaces as [`TransferError::ShortRead`].
pub struct ChunkReader {
    file: File,
    chunk_size: u64,
    file_size: u64,
    offset: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading, starting at byte 0.
    pub async fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size,
            file_size,
            offset: 0,
        })
    }

    /// Positions the reader at `offset` for a resumed upload.
    ///
    /// Seeking to the file size is allowed and leaves nothing to read.
    pub async fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        if offset > self.file_size {
            return Err(TransferError::OffsetOutOfRange {
                offset,
                file_size: self.file_size,
            });
        }
        let landed = self.file.seek(SeekFrom::Start(offset)).await?;
        if landed != offset {
            return Err(TransferError::OffsetOutOfRange {
                offset,
                file_size: self.file_size,
            });
        }
        self.offset = offset;
        Ok(())
    }

    /// The range the next call to [`next_chunk`](Self::next_chunk) reads.
    pub fn next_range(&self) -> Option<ChunkRange> {
        chunk_ranges(self.file_size, self.chunk_size, self.offset).next()
    }

    /// Reads the next chunk, or `None` at end of file.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let Some(range) = self.next_range() else {
            return Ok(None);
        };

        let expected = range.len();
        let mut buf = vec![0u8; expected as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    offset: range.start,
                    expected,
                    actual: filled as u64,
                });
            }
            filled += n;
        }

        self.offset = range.end + 1;
        Ok(Some(Chunk::new(range, buf)))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}
