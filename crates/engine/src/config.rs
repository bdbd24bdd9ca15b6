//! Engine settings.
//!
//! Every field has a default, so a partial TOML table is a valid config.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chunkup_protocol::UploadDescriptor;
use chunkup_protocol::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES};
use chunkup_transfer::{RetryConfig, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per PUT request.
    pub chunk_size: u64,
    /// Attempts per chunk before the upload fails.
    pub max_retries: u32,
    pub progress_debounce_ms: u64,
    pub connect_timeout_secs: u64,
    /// Per-request timeout; `0` disables it.
    pub request_timeout_secs: u64,
    /// First retry delay; `0` retries immediately.
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Offset store location. Defaults to `uploads.json` in the chunkup
    /// config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// Offsets older than this are dropped at startup; `0` keeps them.
    pub resume_ttl_hours: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            progress_debounce_ms: 200,
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            initial_delay_ms: retry.initial_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            backoff_factor: retry.backoff_factor,
            store_path: None,
            resume_ttl_hours: 7 * 24,
        }
    }
}

impl EngineConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            progress_debounce: Duration::from_millis(self.progress_debounce_ms),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                backoff_factor: self.backoff_factor,
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
        }
    }

    /// A descriptor for `file` using the configured chunk size and retries.
    pub fn descriptor(&self, file: impl Into<PathBuf>, url: impl Into<String>) -> UploadDescriptor {
        UploadDescriptor::new(file, url)
            .with_chunk_size(self.chunk_size)
            .with_max_retries(self.max_retries)
    }

    pub fn store_path(&self) -> Option<PathBuf> {
        self.store_path
            .clone()
            .or_else(chunkup_store::default_store_path)
    }

    pub fn resume_ttl(&self) -> Option<Duration> {
        (self.resume_ttl_hours > 0).then(|| Duration::from_secs(self.resume_ttl_hours * 3600))
    }
}
