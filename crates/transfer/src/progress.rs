use std::time::Duration;

use tokio::time::Instant;

/// Coalesces a stream of progress values so that at most one is emitted
/// per window.
///
/// The first value of a window goes out immediately; later values within
/// the window replace each other and the latest is released by
/// [`flush`](Self::flush) once [`deadline`](Self::deadline) passes.
#[derive(Debug)]
pub struct ProgressDebouncer {
    window: Duration,
    last_emit: Option<Instant>,
    pending: Option<u64>,
}

impl ProgressDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            pending: None,
        }
    }

    /// Offers a value observed at `now`. Returns it if it may be emitted
    /// right away.
    pub fn offer(&mut self, value: u64, now: Instant) -> Option<u64> {
        match self.last_emit {
            Some(at) if now.saturating_duration_since(at) < self.window => {
                self.pending = Some(value);
                None
            }
            _ => {
                self.last_emit = Some(now);
                self.pending = None;
                Some(value)
            }
        }
    }

    /// When the held-back value becomes due, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending?;
        self.last_emit.map(|at| at + self.window)
    }

    /// Releases the held-back value.
    pub fn flush(&mut self, now: Instant) -> Option<u64> {
        let value = self.pending.take()?;
        self.last_emit = Some(now);
        Some(value)
    }

    /// Drops the held-back value without emitting it.
    pub fn discard(&mut self) {
        self.pending = None;
    }
}
