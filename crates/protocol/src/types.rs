use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_CONTENT_TYPE, DEFAULT_MAX_RETRIES};

/// Describes one file upload: where the bytes come from and where they go.
///
/// Immutable once built; the `with_*` methods return an updated copy.
/// The identity of an upload is the absolute path of its local file, see
/// [`key`](Self::key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    url: String,
    file_path: PathBuf,
    chunk_size: u64,
    max_retries: u32,
    telemetry_opt_out: bool,
    content_type: String,
}

impl UploadDescriptor {
    /// Creates a descriptor with default chunk size and retry budget.
    ///
    /// Relative paths are resolved against the current directory so that
    /// two descriptors for the same file always share a key.
    pub fn new(file_path: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        let file_path = file_path.into();
        let file_path = std::path::absolute(&file_path).unwrap_or(file_path);
        Self {
            url: url.into(),
            file_path,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            telemetry_opt_out: false,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    /// Returns a copy with a different chunk size. `0` selects the default.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    /// Returns a copy with a different per-chunk attempt budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns a copy with the telemetry opt-out flag set.
    pub fn with_telemetry_opt_out(mut self, opt_out: bool) -> Self {
        self.telemetry_opt_out = opt_out;
        self
    }

    /// Returns a copy with a different `Content-Type`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Registry and persistence key: the absolute local path.
    pub fn key(&self) -> String {
        self.file_path.to_string_lossy().into_owned()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Number of PUT attempts a chunk gets before it fails (at least one).
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn telemetry_opt_out(&self) -> bool {
        self.telemetry_opt_out
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

// ---------------------------------------------------------------------------
// Chunk ranges
// ---------------------------------------------------------------------------

/// An inclusive byte range of a file, as carried by `Content-Range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (inclusive).
    pub end: u64,
    /// Size of the whole file.
    pub total: u64,
}

impl ChunkRange {
    /// Number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`: a range holds at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Formats as a `Content-Range` header value: `bytes 0-99/1000`.
impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Iterator over the chunk ranges of a file, see [`chunk_ranges`].
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    next: u64,
    file_size: u64,
    chunk_size: u64,
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.next >= self.file_size {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.chunk_size).min(self.file_size) - 1;
        self.next = end + 1;
        Some(ChunkRange {
            start,
            end,
            total: self.file_size,
        })
    }
}

/// Partitions `[from, file_size)` into contiguous ranges of `chunk_size`
/// bytes; the last range holds the remainder.
///
/// A `chunk_size` of 0 selects [`DEFAULT_CHUNK_SIZE`].
pub fn chunk_ranges(file_size: u64, chunk_size: u64, from: u64) -> ChunkRanges {
    ChunkRanges {
        next: from,
        file_size,
        chunk_size: if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        },
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress snapshot of one upload.
///
/// `bytes_uploaded` only counts acknowledged bytes. Bytes of the chunk
/// currently on the wire are reported separately in `bytes_in_flight` and
/// are dropped again if that chunk has to be re-sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub bytes_in_flight: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Progress {
    /// Creates an empty progress record for a file of `total_bytes`.
    pub fn new(total_bytes: u64) -> Self {
        Self::starting_at(0, total_bytes)
    }

    /// Creates a progress record for an upload resumed at `bytes_uploaded`.
    pub fn starting_at(bytes_uploaded: u64, total_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            bytes_uploaded: bytes_uploaded.min(total_bytes),
            total_bytes,
            bytes_in_flight: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` once every byte has been acknowledged.
    pub fn is_done(&self) -> bool {
        self.bytes_uploaded >= self.total_bytes
    }

    /// Acknowledged plus in-flight bytes, capped at the total.
    pub fn sent_bytes(&self) -> u64 {
        self.bytes_uploaded
            .saturating_add(self.bytes_in_flight)
            .min(self.total_bytes)
    }

    /// Fraction of the file sent so far, in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.is_done() { 1.0 } else { 0.0 };
        }
        self.sent_bytes() as f64 / self.total_bytes as f64
    }

    /// Records `bytes` newly acknowledged by the endpoint.
    pub fn acknowledge(&mut self, bytes: u64) {
        self.bytes_uploaded = self.bytes_uploaded.saturating_add(bytes).min(self.total_bytes);
        self.bytes_in_flight = 0;
        self.updated_at = Utc::now();
    }

    /// Records how many bytes of the current chunk are on the wire.
    pub fn set_in_flight(&mut self, bytes: u64) {
        self.bytes_in_flight = bytes.min(self.total_bytes.saturating_sub(self.bytes_uploaded));
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Coarse state recorded alongside a persisted offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistedState {
    /// The upload was running when the entry was written.
    WasRunning,
    /// The upload was paused or failed and can be resumed.
    WasPaused,
}

/// Durable record of how far an upload got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceEntry {
    /// Absolute path of the local file.
    pub key: String,
    pub saved_at_epoch_ms: i64,
    pub state: PersistedState,
    /// End byte of the last acknowledged chunk, or -1.
    pub last_successful_byte: i64,
}

impl PersistenceEntry {
    /// Creates an entry stamped with the current wall-clock time.
    pub fn new(key: impl Into<String>, state: PersistedState, last_successful_byte: i64) -> Self {
        Self {
            key: key.into(),
            saved_at_epoch_ms: Utc::now().timestamp_millis(),
            state,
            last_successful_byte,
        }
    }

    /// Byte at which a resumed upload starts.
    pub fn resume_offset(&self) -> u64 {
        self.last_successful_byte.saturating_add(1).max(0) as u64
    }
}
