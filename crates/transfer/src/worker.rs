//! Single-range HTTP PUT with bounded retry.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chunkup_protocol::constants::{DEFAULT_PROGRESS_DEBOUNCE, ORIGIN_HEADER, ORIGIN_VALUE};
use chunkup_protocol::{Progress, ResponseClass, UploadDescriptor, classify_status};

use crate::TransferError;
use crate::progress::ProgressDebouncer;
use crate::types::Chunk;

/// Size of the slices the request body is streamed in.
const BODY_SLICE: usize = 64 * 1024;

/// Longest response body kept on a rejected chunk.
const MAX_ERROR_BODY: usize = 512;

/// How long to wait for the body of a rejected chunk's response.
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by [`ChunkUploader::upload`].
pub type UploadFuture<'a> = Pin<Box<dyn Future<Output = Result<Progress, TransferError>> + Send + 'a>>;

/// Uploads one chunk to the descriptor's endpoint.
///
/// [`ChunkTransferWorker`] is the HTTP implementation; the trait keeps the
/// job orchestration testable without a network.
pub trait ChunkUploader: Send + Sync {
    /// Sends `chunk`, calling `on_progress` with the number of its bytes
    /// handed to the connection so far. Resolves once the endpoint has
    /// acknowledged the range.
    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        descriptor: &'a UploadDescriptor,
        on_progress: &'a (dyn Fn(u64) + Send + Sync),
        cancel: &'a CancellationToken,
    ) -> UploadFuture<'a>;
}

/// Exponential backoff between attempts of the same chunk.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the second attempt. Zero retries immediately.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retries without waiting.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), with ±25%
    /// jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0;
        self.jittered_delay(attempt, unit)
    }

    /// Backoff for `attempt` scaled by `unit` in `[0, 1)`: 0 gives the
    /// shortest delay, 0.5 the unjittered one.
    fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let offset = unit.clamp(0.0, 1.0) * 2.0 - 1.0;
        Duration::from_secs_f64((capped + capped * 0.25 * offset).max(0.0))
    }
}

/// Settings of a [`ChunkTransferWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Window in which intra-chunk progress updates are coalesced.
    pub progress_debounce: Duration,
    pub retry: RetryConfig,
    pub connect_timeout: Duration,
    /// Whole-request timeout per attempt; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            progress_debounce: DEFAULT_PROGRESS_DEBOUNCE,
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Outcome of one failed attempt.
enum AttemptError {
    /// The same range may be sent again.
    Retryable(String),
    /// The chunk cannot be delivered.
    Fatal(TransferError),
}

/// Uploads chunks with `PUT` requests carrying a `Content-Range` header.
pub struct ChunkTransferWorker {
    http: reqwest::Client,
    config: WorkerConfig,
}

impl ChunkTransferWorker {
    /// Builds the HTTP client. Redirects are never followed.
    pub fn new(config: WorkerConfig) -> Result<Self, TransferError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Sends `chunk`, retrying transient failures up to the descriptor's
    /// attempt budget.
    pub async fn upload_chunk(
        &self,
        chunk: &Chunk,
        descriptor: &UploadDescriptor,
        on_progress: &(dyn Fn(u64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Progress, TransferError> {
        let attempts = descriptor.attempts();
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            debug!(range = %chunk.range, attempt, "sending chunk");

            match self.attempt(chunk, descriptor, on_progress, cancel).await {
                Ok(()) => {
                    on_progress(chunk.len());
                    return Ok(Progress::starting_at(chunk.len(), chunk.len()));
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable(reason)) => {
                    warn!(range = %chunk.range, attempt, attempts, %reason, "chunk attempt failed");
                    last_reason = reason;
                }
            }

            if attempt < attempts {
                let delay = self.config.retry.delay_for_attempt(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(TransferError::RetriesExhausted {
            range: chunk.range,
            attempts,
            reason: last_reason,
        })
    }

    async fn attempt(
        &self,
        chunk: &Chunk,
        descriptor: &UploadDescriptor,
        on_progress: &(dyn Fn(u64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let (written_tx, mut written_rx) = mpsc::unbounded_channel();

        let mut request = self
            .http
            .put(descriptor.url())
            .header(CONTENT_TYPE, descriptor.content_type())
            .header(CONTENT_RANGE, chunk.range.to_string())
            .header(CONTENT_LENGTH, chunk.len())
            .body(streaming_body(chunk.data.clone(), written_tx));
        if !descriptor.telemetry_opt_out() {
            request = request.header(ORIGIN_HEADER, ORIGIN_VALUE);
        }

        let relayed = relay_progress(
            request.send(),
            &mut written_rx,
            self.config.progress_debounce,
            on_progress,
            cancel,
        )
        .await;

        let response = match relayed {
            None => return Err(AttemptError::Fatal(TransferError::Cancelled)),
            Some(Ok(response)) => response,
            Some(Err(e)) if e.is_builder() => {
                return Err(AttemptError::Fatal(TransferError::Client(e)));
            }
            Some(Err(e)) => return Err(AttemptError::Retryable(e.to_string())),
        };

        let status = response.status().as_u16();
        match classify_status(status) {
            ResponseClass::Acceptable => {
                debug!(range = %chunk.range, status, "chunk acknowledged");
                Ok(())
            }
            ResponseClass::Retryable => Err(AttemptError::Retryable(format!("HTTP {status}"))),
            ResponseClass::Fatal => {
                let text = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AttemptError::Fatal(TransferError::Cancelled)),
                    text = tokio::time::timeout(ERROR_BODY_TIMEOUT, response.text()) => text,
                };
                let body: String = match text {
                    Ok(Ok(text)) => text.chars().take(MAX_ERROR_BODY).collect(),
                    _ => String::new(),
                };
                Err(AttemptError::Fatal(TransferError::Rejected {
                    range: chunk.range,
                    status,
                    body,
                }))
            }
        }
    }
}

impl ChunkUploader for ChunkTransferWorker {
    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        descriptor: &'a UploadDescriptor,
        on_progress: &'a (dyn Fn(u64) + Send + Sync),
        cancel: &'a CancellationToken,
    ) -> UploadFuture<'a> {
        Box::pin(self.upload_chunk(chunk, descriptor, on_progress, cancel))
    }
}

/// Drives `send` to completion while passing debounced byte counts from
/// `written` to `on_progress`. Returns `None` if cancelled first; a value
/// still held back when `send` finishes is dropped.
async fn relay_progress<F: Future>(
    send: F,
    written: &mut mpsc::UnboundedReceiver<u64>,
    window: Duration,
    on_progress: &(dyn Fn(u64) + Send + Sync),
    cancel: &CancellationToken,
) -> Option<F::Output> {
    tokio::pin!(send);
    let mut debouncer = ProgressDebouncer::new(window);

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            output = &mut send => return Some(output),
            Some(bytes) = written.recv() => {
                if let Some(bytes) = debouncer.offer(bytes, Instant::now()) {
                    on_progress(bytes);
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(bytes) = debouncer.flush(Instant::now()) {
                    on_progress(bytes);
                }
            }
        }
    }
}

/// Streams `data` in slices, reporting the running total of bytes handed
/// to the connection on `written`.
fn streaming_body(data: Bytes, written: mpsc::UnboundedSender<u64>) -> reqwest::Body {
    let len = data.len();
    let mut sent = 0u64;
    let slices = (0..len).step_by(BODY_SLICE).map(move |at| {
        let slice = data.slice(at..(at + BODY_SLICE).min(len));
        sent += slice.len() as u64;
        let _ = written.send(sent);
        Ok::<_, std::io::Error>(slice)
    });
    reqwest::Body::wrap_stream(futures_util::stream::iter(slices))
}
