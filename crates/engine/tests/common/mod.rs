#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use chunkup_engine::{UploadHandle, UploadStatus};
use chunkup_protocol::{ChunkRange, Progress, UploadDescriptor};
use chunkup_store::UploadStore;
use chunkup_transfer::{
    Chunk, ChunkTransferWorker, ChunkUploader, RetryConfig, TransferError, UploadFuture,
    WorkerConfig,
};

// ---------------------------------------------------------------------------
// Mock HTTP endpoint
// ---------------------------------------------------------------------------

/// A request as seen by [`MockEndpoint`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub headers: HashMap<String, String>,
    pub body_len: usize,
}

impl Recorded {
    pub fn content_range(&self) -> &str {
        self.headers
            .get("content-range")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

type Responder = Arc<dyn Fn(&Recorded) -> u16 + Send + Sync>;

/// Minimal HTTP/1.1 server answering each PUT with a status picked by a
/// responder closure. One request per connection.
pub struct MockEndpoint {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockEndpoint {
    pub async fn start(responder: impl Fn(&Recorded) -> u16 + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let Some(req) = read_request(&mut stream).await else {
                        return;
                    };
                    let status = responder(&req);
                    recorded.lock().unwrap().push(req);
                    let resp = format!(
                        "HTTP/1.1 {status} Mock\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { url, requests }
    }

    /// `Content-Range` of every request so far, in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.content_range().to_string())
            .collect()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut tmp = vec![0u8; 64 * 1024];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let headers: HashMap<String, String> = head
        .split("\r\n")
        .skip(1)
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let mut body_len = buf.len() - head_end;
    if let Some(len) = headers.get("content-length") {
        let len: usize = len.parse().ok()?;
        while body_len < len {
            let n = stream.read(&mut tmp).await.ok()?;
            if n == 0 {
                return None;
            }
            body_len += n;
        }
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.contains("chunked"))
    {
        let mut tail = buf[head_end..].to_vec();
        while !tail.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut tmp).await.ok()?;
            if n == 0 {
                return None;
            }
            tail.extend_from_slice(&tmp[..n]);
            if tail.len() > 16 {
                tail.drain(..tail.len() - 16);
            }
        }
        body_len = 0;
    }

    Some(Recorded { headers, body_len })
}

pub fn test_worker() -> Arc<ChunkTransferWorker> {
    Arc::new(
        ChunkTransferWorker::new(WorkerConfig {
            progress_debounce: Duration::from_millis(20),
            retry: RetryConfig::immediate(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
        })
        .unwrap(),
    )
}

// ---------------------------------------------------------------------------
// In-process uploader
// ---------------------------------------------------------------------------

/// Acknowledges each chunk after `delay`, honouring cancellation, and
/// tracks how many uploads run at once.
pub struct PacedUploader {
    delay: Duration,
    sent: Mutex<Vec<ChunkRange>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl PacedUploader {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            sent: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<ChunkRange> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ChunkUploader for PacedUploader {
    fn upload<'a>(
        &'a self,
        chunk: &'a Chunk,
        _descriptor: &'a UploadDescriptor,
        on_progress: &'a (dyn Fn(u64) + Send + Sync),
        cancel: &'a CancellationToken,
    ) -> UploadFuture<'a> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(chunk.range);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {
                    on_progress(chunk.len());
                    Ok(Progress::starting_at(chunk.len(), chunk.len()))
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Writes `size` bytes of patterned data to `dir/name`.
pub fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

pub fn open_store(dir: &Path) -> Arc<UploadStore> {
    Arc::new(UploadStore::open(dir.join("uploads.json")).unwrap())
}

/// Polls the handle until its status satisfies `pred`.
pub async fn wait_for(
    handle: &UploadHandle,
    what: &str,
    pred: impl Fn(&UploadStatus) -> bool,
) -> UploadStatus {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = handle.status();
        if pred(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}, status {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls the store until `key` has at least `last_byte` acknowledged.
pub async fn wait_for_offset(store: &UploadStore, key: &str, last_byte: i64) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while store.read_last_byte(key) < last_byte {
        assert!(Instant::now() < deadline, "timed out waiting for offset {last_byte}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
