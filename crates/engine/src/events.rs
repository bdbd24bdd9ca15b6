//! Per-upload event channels with replay of the latest value.
//!
//! Every callback runs on one [`CallbackContext`]. With the default
//! [`TaskDispatcher`] that is a single tokio task draining a FIFO queue, so
//! listeners are never called concurrently and see emissions in the order
//! they were made, across all channels sharing the context.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chunkup_protocol::Progress;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::UploadError;

/// A unit of listener work.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Where listener callbacks run.
pub trait CallbackContext: Send + Sync {
    /// Schedules `callback`. Callbacks must run one at a time, in the order
    /// they were dispatched. Running it inline on the calling thread is
    /// allowed.
    fn dispatch(&self, callback: Callback);
}

/// Runs callbacks on a dedicated tokio task.
pub struct TaskDispatcher {
    tx: mpsc::UnboundedSender<Callback>,
}

impl TaskDispatcher {
    /// Spawns the dispatch task. Must be called within a tokio runtime.
    ///
    /// The task ends once every handle to the dispatcher is dropped.
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();
        tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    error!("upload listener panicked");
                }
            }
        });
        Arc::new(Self { tx })
    }
}

impl CallbackContext for TaskDispatcher {
    fn dispatch(&self, callback: Callback) {
        if self.tx.send(callback).is_err() {
            warn!("callback dispatcher stopped, dropping event");
        }
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocates a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One subscription. `delivered` holds the sequence number of the last
/// value handed to the listener, so a value overtaken by a newer one is
/// skipped rather than delivered out of order.
struct Registration<T> {
    id: ListenerId,
    listener: Listener<T>,
    delivered: Arc<AtomicU64>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
            delivered: Arc::clone(&self.delivered),
        }
    }
}

struct ChannelState<T> {
    /// Latest value with its sequence number.
    latest: Option<(u64, T)>,
    seq: u64,
    listeners: Vec<Registration<T>>,
}

impl<T> ChannelState<T> {
    fn is_registered(&self, target: &Registration<T>) -> bool {
        self.listeners
            .iter()
            .any(|r| Arc::ptr_eq(&r.delivered, &target.delivered))
    }
}

/// Multi-listener channel that remembers its most recent value.
///
/// A listener subscribing after emissions immediately receives the latest
/// value, then every later one. A listener removed before a queued
/// delivery runs does not receive it. The channel lock is never held while
/// dispatching, so a context may run callbacks inline.
pub struct ReplayChannel<T> {
    state: Arc<Mutex<ChannelState<T>>>,
    context: Arc<dyn CallbackContext>,
}

impl<T: Clone + Send + 'static> ReplayChannel<T> {
    pub fn new(context: Arc<dyn CallbackContext>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                latest: None,
                seq: 0,
                listeners: Vec::new(),
            })),
            context,
        }
    }

    /// Records `value` as the latest and delivers it to every listener.
    pub fn emit(&self, value: T) {
        let (seq, targets) = {
            let mut state = lock(&self.state);
            state.seq += 1;
            let seq = state.seq;
            state.latest = Some((seq, value.clone()));
            if state.listeners.is_empty() {
                return;
            }
            (seq, state.listeners.clone())
        };
        let shared = Arc::clone(&self.state);
        self.context.dispatch(Box::new(move || {
            for target in &targets {
                deliver(&shared, target, seq, &value);
            }
        }));
    }

    /// Registers `listener` and replays the latest value to it.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next();
        self.subscribe_as(id, Arc::new(listener));
        id
    }

    /// Registers `listener` under an existing id.
    pub(crate) fn subscribe_as(&self, id: ListenerId, listener: Listener<T>) {
        let registration = Registration {
            id,
            listener,
            delivered: Arc::new(AtomicU64::new(0)),
        };
        let replay = {
            let mut state = lock(&self.state);
            state.listeners.push(registration.clone());
            state.latest.clone()
        };
        if let Some((seq, latest)) = replay {
            let shared = Arc::clone(&self.state);
            self.context.dispatch(Box::new(move || {
                deliver(&shared, &registration, seq, &latest);
            }));
        }
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut state = lock(&self.state);
        let before = state.listeners.len();
        state.listeners.retain(|r| r.id != id);
        state.listeners.len() != before
    }

    pub fn clear(&self) {
        lock(&self.state).listeners.clear();
    }

    pub fn latest(&self) -> Option<T> {
        lock(&self.state).latest.as_ref().map(|(_, v)| v.clone())
    }
}

/// Hands `value` to `target` unless it was removed meanwhile or already
/// saw a newer value.
fn deliver<T>(state: &Mutex<ChannelState<T>>, target: &Registration<T>, seq: u64, value: &T) {
    if !lock(state).is_registered(target) {
        return;
    }
    if target.delivered.fetch_max(seq, Ordering::AcqRel) >= seq {
        return;
    }
    (target.listener)(value);
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The three channels of one upload job.
pub struct UploadEvents {
    pub progress: ReplayChannel<Progress>,
    pub success: ReplayChannel<Progress>,
    pub error: ReplayChannel<Arc<UploadError>>,
}

impl UploadEvents {
    pub fn new(context: Arc<dyn CallbackContext>) -> Self {
        Self {
            progress: ReplayChannel::new(Arc::clone(&context)),
            success: ReplayChannel::new(Arc::clone(&context)),
            error: ReplayChannel::new(context),
        }
    }

    /// Removes `id` from all three channels.
    pub fn remove(&self, id: ListenerId) {
        self.progress.remove(id);
        self.success.remove(id);
        self.error.remove(id);
    }
}
