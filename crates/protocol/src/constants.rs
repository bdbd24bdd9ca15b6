use std::time::Duration;

/// Default chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default number of attempts per chunk before the upload fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Window in which intra-chunk progress updates are coalesced.
pub const DEFAULT_PROGRESS_DEBOUNCE: Duration = Duration::from_millis(200);

/// Content type sent when the descriptor does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Header carrying the client origin unless telemetry is opted out.
pub const ORIGIN_HEADER: &str = "x-upload-origin";

/// Value of [`ORIGIN_HEADER`].
pub const ORIGIN_VALUE: &str = concat!("chunkup/", env!("CARGO_PKG_VERSION"));

/// Classification of an HTTP status returned for a chunk PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// The endpoint accepted the byte range.
    Acceptable,
    /// The same byte range may be sent again.
    Retryable,
    /// The upload cannot continue.
    Fatal,
}

/// Classifies a chunk PUT response status.
///
/// `308 Resume Incomplete` is how resumable endpoints acknowledge a
/// non-final range, so it counts as acceptable alongside every 2xx.
pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 | 308 => ResponseClass::Acceptable,
        408 | 429 | 502 | 503 | 504 => ResponseClass::Retryable,
        _ => ResponseClass::Fatal,
    }
}
