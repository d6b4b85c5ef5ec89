//! Countdown queue with pause/resume and exactly-once completion.
//!
//! Each entry counts down independently. A single tick loop per queue drives
//! expiry; time is accounted by *measured* elapsed time, not by tick count, so
//! a stalled runtime or a slow tick self-corrects on the next settle.
//!
//! # Elapsed-time accounting
//!
//! The queue keeps one `last_settled` instant. Every operation and every tick
//! first settles: the time since `last_settled` is subtracted from every entry
//! that is started, not paused, and only when the queue is not frozen. Reads
//! are therefore exact at any instant, independent of tick resolution.
//!
//! # Exactly-once completion
//!
//! An entry's completion is an `FnOnce` owned by the entry. Expiry and
//! removal both take the entry out of the map under the queue lock, so only
//! one of them can ever see it. Completions run outside the lock, each in its
//! own task; an error or panic is logged and affects nothing else.
//!
//! # Freezing
//!
//! [`DeferredActionQueue::freeze_all`] stops every countdown at once.
//! [`DeferredActionQueue::unfreeze_all`] resumes after a grace delay
//! (absorbing rapid hover-in/hover-out); repeated calls restart the delay and
//! a freeze during the delay cancels it. [`unfreeze_all_immediately`] skips
//! the delay.
//!
//! [`unfreeze_all_immediately`]: DeferredActionQueue::unfreeze_all_immediately

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::QueueConfig;
use crate::error::{ActionError, Error, Result, panic_message};
use crate::timer::{self, TimerHandle, TimerId};

/// Future produced by an entry's completion callback.
pub type CompletionFuture = Pin<Box<dyn Future<Output = std::result::Result<(), ActionError>> + Send>>;

/// Completion callback, run once when an entry's countdown reaches zero.
pub type OnComplete = Box<dyn FnOnce() -> CompletionFuture + Send>;

/// Callback run once when an entry starts counting down.
pub type OnStart = Box<dyn FnOnce() + Send>;

/// Wrap an async closure as an [`OnComplete`].
pub fn on_complete<F, Fut>(f: F) -> OnComplete
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), ActionError>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Options for [`DeferredActionQueue::add`].
pub struct AddOptions {
    pub on_start: Option<OnStart>,
    /// `None` keeps the metadata of an entry being replaced.
    pub metadata: Option<Value>,
    /// When false the entry waits for [`DeferredActionQueue::start`].
    pub start_immediately: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            on_start: None,
            metadata: None,
            start_immediately: true,
        }
    }
}

impl AddOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_on_start(mut self, on_start: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(on_start));
        self
    }

    /// Add the entry without starting its countdown.
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.start_immediately = false;
        self
    }
}

impl std::fmt::Debug for AddOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddOptions")
            .field("on_start", &self.on_start.is_some())
            .field("metadata", &self.metadata)
            .field("start_immediately", &self.start_immediately)
            .finish()
    }
}

/// In-place mutation for [`DeferredActionQueue::update`].
#[derive(Default)]
pub struct EntryUpdate {
    pub on_complete: Option<OnComplete>,
    pub metadata: Option<Value>,
}

impl EntryUpdate {
    #[must_use]
    pub fn metadata(metadata: Value) -> Self {
        Self {
            on_complete: None,
            metadata: Some(metadata),
        }
    }

    #[must_use]
    pub fn on_complete(on_complete: OnComplete) -> Self {
        Self {
            on_complete: Some(on_complete),
            metadata: None,
        }
    }
}

/// Read-only view of one entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryView {
    pub id: String,
    pub duration_ms: u64,
    pub remaining_ms: u64,
    /// Elapsed fraction of the countdown, 0.0 to 1.0.
    pub progress: f64,
    pub started: bool,
    pub paused: bool,
    pub metadata: Value,
}

/// Point-in-time view of the whole queue, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub frozen: bool,
    /// Sorted by id.
    pub entries: Vec<EntryView>,
}

impl QueueSnapshot {
    pub fn get(&self, id: &str) -> Option<&EntryView> {
        self.entries
            .binary_search_by(|entry| entry.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

struct Entry {
    duration: Duration,
    remaining: Duration,
    started: bool,
    paused: bool,
    metadata: Value,
    on_complete: Option<OnComplete>,
    on_start: Option<OnStart>,
}

impl Entry {
    fn is_running(&self) -> bool {
        self.started && !self.paused
    }

    fn progress(&self) -> f64 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = self.duration.saturating_sub(self.remaining);
        (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
    }

    fn view(&self, id: &str) -> EntryView {
        EntryView {
            id: id.to_string(),
            duration_ms: self.duration.as_millis() as u64,
            remaining_ms: self.remaining.as_millis() as u64,
            progress: self.progress(),
            started: self.started,
            paused: self.paused,
            metadata: self.metadata.clone(),
        }
    }
}

struct QueueState {
    entries: HashMap<String, Entry>,
    frozen: bool,
    last_settled: Instant,
    tick_loop: Option<TimerHandle>,
    pending_unfreeze: Option<TimerHandle>,
}

impl QueueState {
    fn settle(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_settled);
        self.last_settled = now;
        if self.frozen || elapsed.is_zero() {
            return;
        }
        for entry in self.entries.values_mut() {
            if entry.is_running() {
                entry.remaining = entry.remaining.saturating_sub(elapsed);
            }
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut entries: Vec<EntryView> = self
            .entries
            .iter()
            .map(|(id, entry)| entry.view(id))
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        QueueSnapshot {
            frozen: self.frozen,
            entries,
        }
    }

    fn stop_loop_if_idle(&mut self) {
        if self.entries.is_empty() && !self.frozen {
            if let Some(tick_loop) = self.tick_loop.take() {
                tick_loop.cancel();
            }
        }
    }
}

struct QueueShared {
    runtime: Handle,
    config: QueueConfig,
    state: Mutex<QueueState>,
    snapshots: watch::Sender<QueueSnapshot>,
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tick_loop) = state.tick_loop.take() {
            tick_loop.cancel();
        }
        if let Some(pending) = state.pending_unfreeze.take() {
            pending.cancel();
        }
    }
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, state: &QueueState) {
        self.snapshots.send_replace(state.snapshot());
    }

    fn ensure_loop(self: &Arc<Self>, state: &mut QueueState) {
        if state.tick_loop.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = timer::spawn_every(
            &self.runtime,
            self.config.tick_interval(),
            move |timer_id| match weak.upgrade() {
                Some(shared) => shared.tick(timer_id),
                None => ControlFlow::Break(()),
            },
        );
        trace!(timer = %handle.id(), "Started queue tick loop");
        state.tick_loop = Some(handle);
    }

    fn tick(&self, timer_id: TimerId) -> ControlFlow<()> {
        let (due, flow) = {
            let mut state = self.lock();
            if state.tick_loop.as_ref().map(TimerHandle::id) != Some(timer_id) {
                return ControlFlow::Break(());
            }
            state.settle(Instant::now());

            let mut due = Vec::new();
            if !state.frozen {
                let mut expired: Vec<String> = state
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.is_running() && entry.remaining.is_zero())
                    .map(|(id, _)| id.clone())
                    .collect();
                expired.sort();
                for id in expired {
                    if let Some(mut entry) = state.entries.remove(&id) {
                        if let Some(callback) = entry.on_complete.take() {
                            due.push((id, callback));
                        }
                    }
                }
            }

            let flow = if state.entries.is_empty() && !state.frozen {
                // The loop exits by returning Break; nothing to cancel.
                drop(state.tick_loop.take());
                trace!("Queue idle; tick loop stopping");
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            };
            self.publish(&state);
            (due, flow)
        };

        for (entry_id, callback) in due {
            self.run_completion(entry_id, callback);
        }
        flow
    }

    fn run_completion(&self, entry_id: String, callback: OnComplete) {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(future) => future,
            Err(payload) => {
                warn!(
                    entry_id = %entry_id,
                    panic = %panic_message(payload.as_ref()),
                    "Entry completion panicked"
                );
                return;
            }
        };

        self.runtime.spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => debug!(entry_id = %entry_id, "Entry completed"),
                Ok(Err(err)) => warn!(entry_id = %entry_id, error = %err, "Entry completion failed"),
                Err(payload) => warn!(
                    entry_id = %entry_id,
                    panic = %panic_message(payload.as_ref()),
                    "Entry completion panicked"
                ),
            }
        });
    }

    fn finish_unfreeze(self: &Arc<Self>, timer_id: TimerId) {
        let mut state = self.lock();
        if state.pending_unfreeze.as_ref().map(TimerHandle::id) != Some(timer_id) {
            return;
        }
        drop(state.pending_unfreeze.take());
        state.settle(Instant::now());
        state.frozen = false;
        if !state.entries.is_empty() {
            self.ensure_loop(&mut state);
        }
        self.publish(&state);
        debug!(entries = state.entries.len(), "Queue unfrozen after grace delay");
    }
}

fn run_on_start(entry_id: &str, on_start: OnStart) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(on_start)) {
        warn!(
            entry_id,
            panic = %panic_message(payload.as_ref()),
            "Entry start callback panicked"
        );
    }
}

/// Countdown queue keyed by string id.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct DeferredActionQueue {
    shared: Arc<QueueShared>,
}

impl std::fmt::Debug for DeferredActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("DeferredActionQueue")
            .field("entries", &state.entries.len())
            .field("frozen", &state.frozen)
            .field("ticking", &state.tick_loop.is_some())
            .finish()
    }
}

impl DeferredActionQueue {
    /// Create a queue bound to the current Tokio runtime.
    pub fn new(config: QueueConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| Error::Runtime(format!("deferred action queue needs a Tokio runtime: {err}")))?;
        Ok(Self::with_handle(config, runtime))
    }

    /// Create a queue that spawns its timers on `runtime`.
    #[must_use]
    pub fn with_handle(config: QueueConfig, runtime: Handle) -> Self {
        let state = QueueState {
            entries: HashMap::new(),
            frozen: false,
            last_settled: Instant::now(),
            tick_loop: None,
            pending_unfreeze: None,
        };
        let (snapshots, _) = watch::channel(QueueSnapshot::default());
        Self {
            shared: Arc::new(QueueShared {
                runtime,
                config,
                state: Mutex::new(state),
                snapshots,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Insert an entry, or atomically replace the live entry with the same id.
    ///
    /// A replaced entry's completion is dropped before the new entry is
    /// stored; it can never fire.
    pub fn add(
        &self,
        id: impl Into<String>,
        duration: Duration,
        on_complete: OnComplete,
        options: AddOptions,
    ) -> String {
        let id = id.into();
        let AddOptions {
            on_start,
            metadata,
            start_immediately,
        } = options;

        let (previous, start_now) = {
            let mut state = self.shared.lock();
            state.settle(Instant::now());

            let mut previous = state.entries.remove(&id);
            let metadata = match (metadata, previous.as_mut()) {
                (Some(metadata), _) => metadata,
                (None, Some(prev)) => std::mem::take(&mut prev.metadata),
                (None, None) => Value::Null,
            };
            let (start_now, start_later) = if start_immediately {
                (on_start, None)
            } else {
                (None, on_start)
            };

            state.entries.insert(
                id.clone(),
                Entry {
                    duration,
                    remaining: duration,
                    started: start_immediately,
                    paused: false,
                    metadata,
                    on_complete: Some(on_complete),
                    on_start: start_later,
                },
            );
            self.shared.ensure_loop(&mut state);
            self.shared.publish(&state);
            (previous, start_now)
        };

        if previous.is_some() {
            debug!(entry_id = %id, duration_ms = duration.as_millis() as u64, "Replaced queue entry");
        } else {
            debug!(entry_id = %id, duration_ms = duration.as_millis() as u64, "Queued entry");
        }
        drop(previous);

        if let Some(on_start) = start_now {
            run_on_start(&id, on_start);
        }
        id
    }

    /// Start an entry added with [`AddOptions::deferred`].
    ///
    /// Returns false for unknown or already started entries.
    pub fn start(&self, id: &str) -> bool {
        let on_start = {
            let mut state = self.shared.lock();
            state.settle(Instant::now());
            let Some(entry) = state.entries.get_mut(id) else {
                return false;
            };
            if entry.started {
                return false;
            }
            entry.started = true;
            let on_start = entry.on_start.take();
            self.shared.ensure_loop(&mut state);
            self.shared.publish(&state);
            on_start
        };

        debug!(entry_id = id, "Started queue entry");
        if let Some(on_start) = on_start {
            run_on_start(id, on_start);
        }
        true
    }

    /// Swap an entry's completion and/or metadata without touching its
    /// countdown. Returns false for unknown ids.
    pub fn update(&self, id: &str, update: EntryUpdate) -> bool {
        let replaced = {
            let mut state = self.shared.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return false;
            };
            let replaced = match update.on_complete {
                Some(callback) => entry.on_complete.replace(callback),
                None => None,
            };
            if let Some(metadata) = update.metadata {
                entry.metadata = metadata;
            }
            state.settle(Instant::now());
            self.shared.publish(&state);
            replaced
        };
        drop(replaced);
        true
    }

    /// Pause one started entry. Returns false for unknown or unstarted ids.
    pub fn stop(&self, id: &str) -> bool {
        let mut state = self.shared.lock();
        state.settle(Instant::now());
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        if !entry.started {
            return false;
        }
        entry.paused = true;
        let remaining = entry.remaining;
        self.shared.publish(&state);
        debug!(
            entry_id = id,
            remaining_ms = remaining.as_millis() as u64,
            "Paused queue entry"
        );
        true
    }

    /// Resume one paused entry with exactly the time it had left.
    pub fn resume(&self, id: &str) -> bool {
        let mut state = self.shared.lock();
        state.settle(Instant::now());
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        if !entry.started {
            return false;
        }
        entry.paused = false;
        self.shared.ensure_loop(&mut state);
        self.shared.publish(&state);
        debug!(entry_id = id, "Resumed queue entry");
        true
    }

    /// Cancel and delete an entry. Its completion will never run.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.shared.lock();
            state.settle(Instant::now());
            let removed = state.entries.remove(id);
            if removed.is_some() {
                state.stop_loop_if_idle();
                self.shared.publish(&state);
            }
            removed
        };
        match removed {
            Some(_) => {
                debug!(entry_id = id, "Removed queue entry");
                true
            }
            None => false,
        }
    }

    /// Remove several entries under one lock acquisition.
    ///
    /// No listed entry can expire between the first and last removal.
    /// Returns the ids that were actually present.
    pub fn remove_many<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        let removed: Vec<(String, Entry)> = {
            let mut state = self.shared.lock();
            state.settle(Instant::now());
            let removed: Vec<(String, Entry)> = ids
                .iter()
                .filter_map(|id| state.entries.remove_entry(id.as_ref()))
                .collect();
            if !removed.is_empty() {
                state.stop_loop_if_idle();
                self.shared.publish(&state);
            }
            removed
        };
        let ids: Vec<String> = removed.into_iter().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "Removed queue entries");
        }
        ids
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<Entry> = {
            let mut state = self.shared.lock();
            let removed: Vec<Entry> = state.entries.drain().map(|(_, entry)| entry).collect();
            state.stop_loop_if_idle();
            self.shared.publish(&state);
            removed
        };
        removed.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shared.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }

    /// Time left on an entry's countdown.
    pub fn remaining(&self, id: &str) -> Option<Duration> {
        let mut state = self.shared.lock();
        state.settle(Instant::now());
        state.entries.get(id).map(|entry| entry.remaining)
    }

    /// Elapsed fraction of an entry's countdown, 0.0 to 1.0.
    pub fn progress(&self, id: &str) -> Option<f64> {
        let mut state = self.shared.lock();
        state.settle(Instant::now());
        state.entries.get(id).map(Entry::progress)
    }

    pub fn entry(&self, id: &str) -> Option<EntryView> {
        let mut state = self.shared.lock();
        state.settle(Instant::now());
        state.entries.get(id).map(|entry| entry.view(id))
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut state = self.shared.lock();
        state.settle(Instant::now());
        state.snapshot()
    }

    /// Receive a fresh [`QueueSnapshot`] after every tick and mutation.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Whether the tick loop is currently running.
    pub fn is_ticking(&self) -> bool {
        self.shared.lock().tick_loop.is_some()
    }

    /// Pause every countdown. Cancels a pending grace unfreeze.
    pub fn freeze_all(&self) {
        let pending = {
            let mut state = self.shared.lock();
            state.settle(Instant::now());
            let pending = state.pending_unfreeze.take();
            if !state.frozen {
                state.frozen = true;
                self.shared.publish(&state);
            }
            pending
        };
        if let Some(pending) = pending {
            pending.cancel();
            debug!("Freeze cancelled pending unfreeze");
        } else {
            debug!("Queue frozen");
        }
    }

    /// Resume every countdown after the configured grace delay.
    ///
    /// Calling again restarts the delay; [`freeze_all`](Self::freeze_all)
    /// during the delay cancels it.
    pub fn unfreeze_all(&self) {
        let grace = self.shared.config.unfreeze_grace();
        if grace.is_zero() {
            self.unfreeze_all_immediately();
            return;
        }

        let mut state = self.shared.lock();
        if !state.frozen {
            return;
        }
        if let Some(previous) = state.pending_unfreeze.take() {
            previous.cancel();
        }
        let weak = Arc::downgrade(&self.shared);
        let handle = timer::spawn_after(&self.shared.runtime, grace, move |timer_id| {
            if let Some(shared) = weak.upgrade() {
                shared.finish_unfreeze(timer_id);
            }
        });
        state.pending_unfreeze = Some(handle);
        debug!(grace_ms = grace.as_millis() as u64, "Queue unfreeze scheduled");
    }

    /// Resume every countdown now, cancelling any pending grace unfreeze.
    pub fn unfreeze_all_immediately(&self) {
        let mut state = self.shared.lock();
        if let Some(pending) = state.pending_unfreeze.take() {
            pending.cancel();
        }
        if !state.frozen {
            return;
        }
        state.settle(Instant::now());
        state.frozen = false;
        if !state.entries.is_empty() {
            self.shared.ensure_loop(&mut state);
        }
        self.shared.publish(&state);
        debug!(entries = state.entries.len(), "Queue unfrozen");
    }

    /// Whether countdowns are globally paused (including during the grace
    /// delay of a pending unfreeze).
    pub fn is_frozen(&self) -> bool {
        self.shared.lock().frozen
    }

    /// Whether a grace unfreeze is scheduled.
    pub fn unfreeze_pending(&self) -> bool {
        self.shared.lock().pending_unfreeze.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn queue() -> DeferredActionQueue {
        DeferredActionQueue::new(QueueConfig::default()).unwrap()
    }

    fn counting(counter: &Arc<AtomicU32>) -> OnComplete {
        let counter = Arc::clone(counter);
        on_complete(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn fail_hard() -> bool {
        true
    }

    async fn sleep_ms(value: u64) {
        tokio::time::sleep(ms(value)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn freezing_preserves_remaining_time() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(5000), counting(&fired), AddOptions::new());

        sleep_ms(1000).await;
        queue.freeze_all();
        sleep_ms(2000).await;
        assert_eq!(queue.remaining("entry"), Some(ms(4000)));

        queue.unfreeze_all_immediately();
        sleep_ms(1000).await;
        assert_eq!(queue.remaining("entry"), Some(ms(3000)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completes_exactly_once() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(5000), counting(&fired), AddOptions::new());

        sleep_ms(4990).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep_ms(30).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!queue.contains("entry"));

        sleep_ms(10_000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn readding_replaces_and_cancels_previous_timer() {
        let queue = queue();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(1000), counting(&first), AddOptions::new());

        sleep_ms(500).await;
        queue.add("entry", ms(1000), counting(&second), AddOptions::new());
        assert_eq!(queue.len(), 1);

        sleep_ms(600).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        sleep_ms(500).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_keeps_or_overwrites_metadata() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add(
            "entry",
            ms(1000),
            counting(&fired),
            AddOptions::new().with_metadata(json!({"kind": "like"})),
        );
        queue.add("entry", ms(1000), counting(&fired), AddOptions::new());
        assert_eq!(queue.entry("entry").unwrap().metadata, json!({"kind": "like"}));

        queue.add(
            "entry",
            ms(1000),
            counting(&fired),
            AddOptions::new().with_metadata(json!({"kind": "love"})),
        );
        assert_eq!(queue.entry("entry").unwrap().metadata, json!({"kind": "love"}));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_resume_do_not_fast_forward() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(1000), counting(&fired), AddOptions::new());

        sleep_ms(300).await;
        assert!(queue.stop("entry"));
        sleep_ms(5000).await;
        assert_eq!(queue.remaining("entry"), Some(ms(700)));
        assert!(queue.entry("entry").unwrap().paused);

        assert!(queue.resume("entry"));
        sleep_ms(650).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep_ms(100).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_entry_waits_for_start() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        let started = Arc::new(AtomicU32::new(0));
        let on_start_counter = Arc::clone(&started);
        queue.add(
            "entry",
            ms(200),
            counting(&fired),
            AddOptions::new().deferred().with_on_start(move || {
                on_start_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!queue.stop("entry"));
        assert!(!queue.resume("entry"));
        sleep_ms(1000).await;
        assert_eq!(queue.remaining("entry"), Some(ms(200)));
        assert_eq!(started.load(Ordering::SeqCst), 0);

        assert!(queue.start("entry"));
        assert!(!queue.start("entry"));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        sleep_ms(250).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_start_runs_on_start_once() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        let started = Arc::new(AtomicU32::new(0));
        let on_start_counter = Arc::clone(&started);
        queue.add(
            "entry",
            ms(200),
            counting(&fired),
            AddOptions::new().with_on_start(move || {
                on_start_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(!queue.start("entry"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_swaps_completion_without_resetting() {
        let queue = queue();
        let original = Arc::new(AtomicU32::new(0));
        let swapped = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(1000), counting(&original), AddOptions::new());

        sleep_ms(600).await;
        assert!(queue.update("entry", EntryUpdate::on_complete(counting(&swapped))));
        assert!(queue.update("entry", EntryUpdate::metadata(json!(7))));
        assert_eq!(queue.remaining("entry"), Some(ms(400)));

        sleep_ms(450).await;
        assert_eq!(original.load(Ordering::SeqCst), 0);
        assert_eq!(swapped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ids_return_false() {
        let queue = queue();
        assert!(!queue.update("ghost", EntryUpdate::metadata(json!(1))));
        assert!(!queue.stop("ghost"));
        assert!(!queue.resume("ghost"));
        assert!(!queue.remove("ghost"));
        assert!(!queue.start("ghost"));
        assert_eq!(queue.remaining("ghost"), None);
        assert_eq!(queue.progress("ghost"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_prevents_completion_and_stops_loop() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(1000), counting(&fired), AddOptions::new());
        assert!(queue.is_ticking());

        sleep_ms(999).await;
        assert!(queue.remove("entry"));
        assert!(!queue.is_ticking());

        sleep_ms(5000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_restarts_lazily() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("a", ms(100), counting(&fired), AddOptions::new());
        sleep_ms(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!queue.is_ticking());

        queue.add("b", ms(100), counting(&fired), AddOptions::new());
        assert!(queue.is_ticking());
        sleep_ms(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_completions_are_isolated() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add(
            "a-fails",
            ms(100),
            on_complete(|| async { Err(ActionError::executor("boom")) }),
            AddOptions::new(),
        );
        queue.add(
            "b-panics",
            ms(100),
            Box::new(|| -> CompletionFuture { panic!("completion exploded") }),
            AddOptions::new(),
        );
        queue.add(
            "c-panics-async",
            ms(100),
            on_complete(|| async {
                if fail_hard() {
                    panic!("async completion exploded");
                }
                Ok(())
            }),
            AddOptions::new(),
        );
        queue.add("d-ok", ms(100), counting(&fired), AddOptions::new());

        sleep_ms(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());

        queue.add("e-after", ms(100), counting(&fired), AddOptions::new());
        sleep_ms(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_unfreeze_delays_resume() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(5000), counting(&fired), AddOptions::new());

        sleep_ms(1000).await;
        queue.freeze_all();
        sleep_ms(1000).await;
        queue.unfreeze_all();
        assert!(queue.unfreeze_pending());
        assert!(queue.is_frozen());

        sleep_ms(1000).await;
        assert_eq!(queue.remaining("entry"), Some(ms(4000)));

        sleep_ms(1500).await;
        assert!(!queue.is_frozen());
        assert_eq!(queue.remaining("entry"), Some(ms(3500)));
    }

    #[tokio::test(start_paused = true)]
    async fn refreeze_during_grace_cancels_unfreeze() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(5000), counting(&fired), AddOptions::new());

        queue.freeze_all();
        queue.unfreeze_all();
        sleep_ms(1000).await;
        queue.freeze_all();
        assert!(!queue.unfreeze_pending());

        sleep_ms(10_000).await;
        assert!(queue.is_frozen());
        assert_eq!(queue.remaining("entry"), Some(ms(5000)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_unfreeze_restarts_grace() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(5000), counting(&fired), AddOptions::new());

        queue.freeze_all();
        queue.unfreeze_all();
        sleep_ms(1500).await;
        queue.unfreeze_all();

        sleep_ms(1000).await;
        assert!(queue.is_frozen());

        sleep_ms(1100).await;
        assert!(!queue.is_frozen());
        assert_eq!(queue.remaining("entry"), Some(ms(4900)));
    }

    #[tokio::test(start_paused = true)]
    async fn unfreeze_when_not_frozen_is_noop() {
        let queue = queue();
        queue.unfreeze_all();
        assert!(!queue.unfreeze_pending());
        queue.unfreeze_all_immediately();
        assert!(!queue.is_frozen());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_many_is_atomic() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        for id in ["a", "b", "c"] {
            queue.add(id, ms(100), counting(&fired), AddOptions::new());
        }

        let removed = queue.remove_many(&["a", "c", "missing"]);
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&"a".to_string()));
        assert!(removed.contains(&"c".to_string()));

        sleep_ms(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_drops_everything() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("a", ms(100), counting(&fired), AddOptions::new());
        queue.add("b", ms(100), counting(&fired), AddOptions::new());
        assert_eq!(queue.clear(), 2);
        assert!(!queue.is_ticking());
        sleep_ms(200).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_tracks_elapsed_fraction() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", ms(1000), counting(&fired), AddOptions::new());
        assert_eq!(queue.progress("entry"), Some(0.0));
        sleep_ms(250).await;
        let progress = queue.progress("entry").unwrap();
        assert!((progress - 0.25).abs() < 1e-9, "progress was {progress}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_completes_on_next_tick() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        queue.add("entry", Duration::ZERO, counting(&fired), AddOptions::new());
        assert_eq!(queue.progress("entry"), Some(1.0));
        sleep_ms(20).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_countdown() {
        let queue = queue();
        let fired = Arc::new(AtomicU32::new(0));
        let mut rx = queue.subscribe();
        queue.add("entry", ms(1000), counting(&fired), AddOptions::new());

        sleep_ms(500).await;
        let snapshot = rx.borrow_and_update().clone();
        let view = snapshot.get("entry").unwrap();
        assert!(view.remaining_ms <= 510 && view.remaining_ms >= 490);
        assert!(!snapshot.frozen);

        queue.freeze_all();
        assert!(rx.borrow_and_update().frozen);
    }

    #[tokio::test]
    async fn snapshot_serializes() {
        let queue = queue();
        queue.add(
            "entry",
            ms(1000),
            on_complete(|| async { Ok(()) }),
            AddOptions::new().with_metadata(json!({"preview": "👍"})),
        );
        let json = serde_json::to_value(queue.snapshot()).unwrap();
        assert_eq!(json["entries"][0]["id"], "entry");
        assert_eq!(json["entries"][0]["metadata"]["preview"], "👍");
    }

    #[test]
    fn new_outside_runtime_is_an_error() {
        let err = DeferredActionQueue::new(QueueConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Tokio runtime"));
    }
}
