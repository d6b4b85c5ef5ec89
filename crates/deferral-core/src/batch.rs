//! Debounced request coalescing.
//!
//! Many single-key requests made close together collapse into a few bulk
//! calls. Each caller gets a [`BatchTicket`] that resolves from the shared
//! response:
//!
//! ```text
//!  enqueue(k1) ─┐
//!  enqueue(k2) ─┼─► debounce (300ms) ─► flush ─► partition ≤ 50 ─┬─► fetch(chunk 1) ─► demux ─► tickets
//!  enqueue(k3) ─┘                                                └─► fetch(chunk 2) ─► demux ─► tickets
//! ```
//!
//! Chunks are fetched concurrently. A chunk's response is only ever matched
//! against that chunk's own keys.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{BatchConfig, BatchMode};
use crate::error::{BatchError, Error, Result, panic_message};
use crate::timer::{self, TimerHandle, TimerId};

/// One per-key result in a bulk response. `value: None` is a legitimate
/// "no data" answer, distinct from the key being absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkEntry<K, V> {
    pub key: K,
    pub value: Option<V>,
}

impl<K, V> BulkEntry<K, V> {
    pub fn new(key: K, value: Option<V>) -> Self {
        Self { key, value }
    }
}

/// Body of a bulk request: `{"keys": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRequest<K> {
    pub keys: Vec<K>,
}

/// Body of a bulk response: `{"results": [{"key": k, "value": v | null}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse<K, V> {
    pub results: Vec<BulkEntry<K, V>>,
}

/// Boxed future returned by [`BulkFetcher::fetch`].
pub type BulkFuture<K, V> = Pin<Box<dyn Future<Output = Result<Vec<BulkEntry<K, V>>>> + Send>>;

/// Performs one bulk call for a chunk of keys.
pub trait BulkFetcher<K, V>: Send + Sync + 'static {
    fn fetch(&self, keys: Vec<K>) -> BulkFuture<K, V>;
}

/// [`BulkFetcher`] backed by an async closure. See [`fetcher_fn`].
pub struct FnFetcher<F> {
    f: F,
}

impl<K, V, F, Fut> BulkFetcher<K, V> for FnFetcher<F>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<BulkEntry<K, V>>>> + Send + 'static,
{
    fn fetch(&self, keys: Vec<K>) -> BulkFuture<K, V> {
        Box::pin((self.f)(keys))
    }
}

/// Turn an async closure into a [`BulkFetcher`].
pub fn fetcher_fn<F>(f: F) -> FnFetcher<F> {
    FnFetcher { f }
}

/// Split `keys` into consecutive chunks of at most `max` keys, preserving
/// order. A `max` of zero is treated as one.
pub fn partition_chunks<K>(keys: Vec<K>, max: usize) -> Vec<Vec<K>> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(keys.len().div_ceil(max));
    let mut iter = keys.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(max).collect());
    }
    chunks
}

type TicketResult<V> = std::result::Result<Option<V>, BatchError>;

/// Future for one caller's result.
///
/// Dropping a ticket never cancels the fetch for other subscribers.
pub struct BatchTicket<V> {
    key: String,
    inner: TicketInner<V>,
}

enum TicketInner<V> {
    Ready(Option<TicketResult<V>>),
    Waiting(oneshot::Receiver<TicketResult<V>>),
}

impl<V> Unpin for BatchTicket<V> {}

impl<V> BatchTicket<V> {
    fn ready(key: String, result: TicketResult<V>) -> Self {
        Self {
            key,
            inner: TicketInner::Ready(Some(result)),
        }
    }

    fn waiting(key: String, rx: oneshot::Receiver<TicketResult<V>>) -> Self {
        Self {
            key,
            inner: TicketInner::Waiting(rx),
        }
    }

    /// Debug rendering of the key this ticket waits on.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<V> Future for BatchTicket<V> {
    type Output = TicketResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            TicketInner::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(BatchError::Dropped {
                    key: this.key.clone(),
                })
            })),
            TicketInner::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(BatchError::Dropped {
                        key: this.key.clone(),
                    })
                })
            }),
        }
    }
}

impl<V> std::fmt::Debug for BatchTicket<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTicket").field("key", &self.key).finish()
    }
}

/// What a single [`BatchCoalescer::flush`] sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub keys: usize,
    pub chunk_sizes: Vec<usize>,
}

impl FlushReport {
    pub fn chunks(&self) -> usize {
        self.chunk_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    InFlight,
}

struct PendingItem<V> {
    subscribers: Vec<oneshot::Sender<TicketResult<V>>>,
    phase: Phase,
    created_at: Instant,
}

struct BatchState<K, V> {
    pending: HashMap<K, PendingItem<V>>,
    /// Queued keys in arrival order.
    queued: Vec<K>,
    debounce: Option<TimerHandle>,
}

struct BatchShared<K, V> {
    runtime: Handle,
    config: BatchConfig,
    fetcher: Arc<dyn BulkFetcher<K, V>>,
    state: Mutex<BatchState<K, V>>,
}

impl<K, V> Drop for BatchShared<K, V> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(debounce) = state.debounce.take() {
            debounce.cancel();
        }
        if !state.pending.is_empty() {
            debug!(
                pending = state.pending.len(),
                "Batch coalescer dropped with unresolved keys"
            );
        }
    }
}

impl<K, V> BatchShared<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, BatchState<K, V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn flush(self: &Arc<Self>, trigger: Option<TimerId>) -> FlushReport {
        let (keys, debounce) = {
            let mut state = self.lock();
            if let Some(timer_id) = trigger {
                if state.debounce.as_ref().map(TimerHandle::id) != Some(timer_id) {
                    return FlushReport::default();
                }
            }
            let debounce = state.debounce.take();
            let keys = std::mem::take(&mut state.queued);
            for key in &keys {
                if let Some(item) = state.pending.get_mut(key) {
                    item.phase = Phase::InFlight;
                }
            }
            (keys, debounce)
        };

        // A timer-triggered flush is the debounce task itself finishing.
        if let Some(debounce) = debounce {
            if trigger.is_none() {
                debounce.cancel();
            }
        }

        if keys.is_empty() {
            return FlushReport::default();
        }

        let total = keys.len();
        let chunks = partition_chunks(keys, self.config.max_batch_size);
        let report = FlushReport {
            keys: total,
            chunk_sizes: chunks.iter().map(Vec::len).collect(),
        };
        debug!(
            keys = total,
            chunks = report.chunks(),
            "Flushing batch"
        );

        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            join_all(chunks.into_iter().map(|chunk| shared.fetch_chunk(chunk))).await;
        });
        report
    }

    async fn fetch_chunk(&self, chunk: Vec<K>) {
        let chunk_size = chunk.len();
        trace!(chunk_size, "Sending bulk request");
        let fetcher = Arc::clone(&self.fetcher);
        let keys = chunk.clone();
        let outcome = AssertUnwindSafe(async move { fetcher.fetch(keys).await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(err)) => Err(BatchError::Fetch {
                message: err.to_string(),
            }),
            Err(payload) => Err(BatchError::Fetch {
                message: format!("bulk fetcher panicked: {}", panic_message(payload.as_ref())),
            }),
        };
        if let Err(err) = &result {
            warn!(chunk_size, error = %err, "Bulk request failed");
        }
        self.deliver(chunk, result);
    }

    fn deliver(&self, chunk: Vec<K>, result: std::result::Result<Vec<BulkEntry<K, V>>, BatchError>) {
        let items: Vec<(K, PendingItem<V>)> = {
            let mut state = self.lock();
            chunk
                .into_iter()
                .filter_map(|key| state.pending.remove_entry(&key))
                .collect()
        };

        match result {
            Ok(entries) => {
                let mut values: HashMap<K, Option<V>> = entries
                    .into_iter()
                    .map(|entry| (entry.key, entry.value))
                    .collect();
                for (key, item) in items {
                    let outcome = match values.remove(&key) {
                        Some(value) => Ok(value),
                        None => {
                            warn!(key = ?key, "Bulk response omitted key");
                            Err(BatchError::MissingResult {
                                key: format!("{key:?}"),
                            })
                        }
                    };
                    trace!(
                        key = ?key,
                        waited_ms = item.created_at.elapsed().as_millis() as u64,
                        subscribers = item.subscribers.len(),
                        "Resolving batched key"
                    );
                    send_all(item.subscribers, &outcome);
                }
            }
            Err(err) => {
                for (_, item) in items {
                    send_all(item.subscribers, &Err(err.clone()));
                }
            }
        }
    }
}

fn send_all<V: Clone>(subscribers: Vec<oneshot::Sender<TicketResult<V>>>, outcome: &TicketResult<V>) {
    for subscriber in subscribers {
        // A dropped ticket is not an error for the other subscribers.
        let _ = subscriber.send(outcome.clone());
    }
}

/// Debounced bulk request merger keyed by `K`.
///
/// Cheap to clone; clones share pending keys.
pub struct BatchCoalescer<K, V> {
    shared: Arc<BatchShared<K, V>>,
}

impl<K, V> Clone for BatchCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> std::fmt::Debug for BatchCoalescer<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoalescer")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<K, V> BatchCoalescer<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Create a coalescer bound to the current Tokio runtime.
    pub fn new<F: BulkFetcher<K, V>>(config: BatchConfig, fetcher: F) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| Error::Runtime(format!("batch coalescer needs a Tokio runtime: {err}")))?;
        Ok(Self::with_handle(config, Arc::new(fetcher), runtime))
    }

    pub fn with_handle(config: BatchConfig, fetcher: Arc<dyn BulkFetcher<K, V>>, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(BatchShared {
                runtime,
                config,
                fetcher,
                state: Mutex::new(BatchState {
                    pending: HashMap::new(),
                    queued: Vec::new(),
                    debounce: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    pub fn mode(&self) -> BatchMode {
        self.shared.config.mode
    }

    /// Register interest in `key`. Registration happens before this returns;
    /// the ticket only waits for the result.
    pub fn enqueue(&self, key: K) -> BatchTicket<V> {
        let label = format!("{key:?}");
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.lock();

        if let Some(item) = state.pending.get_mut(&key) {
            return match self.shared.config.mode {
                BatchMode::Strict => {
                    drop(state);
                    debug!(key = %label, "Rejected duplicate batch request");
                    BatchTicket::ready(label.clone(), Err(BatchError::Duplicate { key: label }))
                }
                BatchMode::FanOut => {
                    item.subscribers.push(tx);
                    trace!(
                        key = %label,
                        subscribers = item.subscribers.len(),
                        in_flight = item.phase == Phase::InFlight,
                        "Attached to pending batch key"
                    );
                    BatchTicket::waiting(label, rx)
                }
            };
        }

        state.pending.insert(
            key.clone(),
            PendingItem {
                subscribers: vec![tx],
                phase: Phase::Queued,
                created_at: Instant::now(),
            },
        );
        state.queued.push(key);

        if state.debounce.is_none() {
            let weak = Arc::downgrade(&self.shared);
            state.debounce = Some(timer::spawn_after(
                &self.shared.runtime,
                self.shared.config.delay(),
                move |timer_id| {
                    if let Some(shared) = weak.upgrade() {
                        shared.flush(Some(timer_id));
                    }
                },
            ));
        }
        BatchTicket::waiting(label, rx)
    }

    /// Send every queued key now, cancelling the debounce timer.
    pub fn flush(&self) -> FlushReport {
        self.shared.flush(None)
    }

    /// Keys waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().queued.len()
    }

    /// Keys whose bulk call has been sent but not answered.
    pub fn in_flight_len(&self) -> usize {
        self.shared
            .lock()
            .pending
            .values()
            .filter(|item| item.phase == Phase::InFlight)
            .count()
    }

    /// No key queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.shared.lock().pending.is_empty()
    }
}
