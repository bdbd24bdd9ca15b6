use bytes::Bytes;

use chunkup_protocol::ChunkRange;

/// A byte range of a file together with its payload.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Inclusive range within the file.
    pub range: ChunkRange,
    /// Raw chunk data, exactly `range.len()` bytes.
    pub data: Bytes,
}

impl Chunk {
    /// Creates a chunk; `data` must hold exactly the bytes of `range`.
    pub fn new(range: ChunkRange, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        debug_assert_eq!(data.len() as u64, range.len());
        Self { range, data }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
