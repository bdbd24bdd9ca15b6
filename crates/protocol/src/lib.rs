//! Shared types for the chunkup upload engine.
//!
//! Everything here is plain data: the upload descriptor handed in by
//! callers, the progress snapshot handed back out, the record persisted
//! between process runs, and the HTTP status rules of the chunked PUT
//! protocol. No I/O happens in this crate.

pub mod constants;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{ResponseClass, classify_status};
pub use types::{
    ChunkRange, ChunkRanges, PersistedState, PersistenceEntry, Progress,
    UploadDescriptor, chunk_ranges,
};
