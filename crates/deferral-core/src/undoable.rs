//! Undoable actions: "do X in N seconds unless canceled".
//!
//! Each request becomes a countdown entry in a [`DeferredActionQueue`] plus a
//! toast. Canceling inside the window removes the entry and runs the restore
//! callback; letting the window elapse runs the executor, either directly or
//! through a [`BatchCoalescer`].
//!
//! ```text
//!               request_action
//!                     │
//!                     ▼
//!     cancel ◄──── Queued ────► window elapses
//!       │                            │
//!       ▼                            ▼
//!    Canceled                     Expired
//!       │                            │
//!       ▼                            ▼
//!    Restored                    Executing ──► Settled
//!                                    │
//!                                    └───────► Failed
//! ```
//!
//! A record is removed from the service as soon as it leaves the live states
//! (`Queued`, `Expired`, `Executing`). Every record carries a generation
//! number; an expiry scheduled for an older generation of the same key is
//! ignored, so a replaced request can never run.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::batch::BatchCoalescer;
use crate::config::UndoConfig;
use crate::error::{ActionError, ConfigError, FreezeError, Result, panic_message};
use crate::freeze::FreezeCoordinator;
use crate::queue::{AddOptions, CompletionFuture, DeferredActionQueue, QueueSnapshot, on_complete};
use crate::retry::{RetryPolicy, with_retry_if};
use crate::toast::{
    CancelTarget, ToastSink, ToastView, action_toast_id, batch_toast_id, countdown_seconds,
};

// =============================================================================
// State machine
// =============================================================================

/// Lifecycle of one undoable action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Counting down; cancelable.
    Queued,
    /// Canceled inside the window; restore pending.
    Canceled,
    /// Restore callback has run (or there was none).
    Restored,
    /// Window elapsed; about to execute.
    Expired,
    /// Executor running. Too late to cancel.
    Executing,
    /// Executor succeeded.
    Settled,
    /// Executor failed after all attempts.
    Failed,
}

impl ActionState {
    /// Whether this is a terminal state (no further transitions).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Restored | Self::Settled | Self::Failed)
    }

    #[must_use]
    pub fn is_cancelable(self) -> bool {
        self == Self::Queued
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Canceled)
                | (Self::Canceled, Self::Restored)
                | (Self::Queued, Self::Expired)
                | (Self::Expired, Self::Executing)
                | (Self::Executing, Self::Settled)
                | (Self::Executing, Self::Failed)
        )
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Canceled => "canceled",
            Self::Restored => "restored",
            Self::Expired => "expired",
            Self::Executing => "executing",
            Self::Settled => "settled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn advance(tx: &watch::Sender<ActionState>, key: &str, next: ActionState) {
    let current = *tx.borrow();
    if current.can_transition_to(next) {
        tx.send_replace(next);
        trace!(key, from = %current, to = %next, "Action state changed");
    } else {
        warn!(key, from = %current, to = %next, "Ignored invalid action state transition");
    }
}

// =============================================================================
// Requests
// =============================================================================

/// The work performed when an action's window elapses.
///
/// `Fn` rather than `FnOnce` so a retry policy can run it again.
#[derive(Clone)]
pub struct ActionExecutor {
    run: Arc<dyn Fn() -> CompletionFuture + Send + Sync>,
}

impl ActionExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), ActionError>> + Send + 'static,
    {
        Self {
            run: Arc::new(move || -> CompletionFuture { Box::pin(f()) }),
        }
    }

    /// Executor that hands `key` to a coalescer, so actions expiring close
    /// together share bulk calls.
    pub fn batched<K, V>(coalescer: BatchCoalescer<K, V>, key: K) -> Self
    where
        K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
        V: Clone + Send + 'static,
    {
        Self::new(move || {
            let ticket = coalescer.enqueue(key.clone());
            async move { ticket.await.map(|_| ()).map_err(ActionError::from) }
        })
    }

    fn call(&self) -> CompletionFuture {
        (self.run)()
    }
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActionExecutor")
    }
}

/// Best-effort undo callback. Errors and panics are logged, never propagated.
pub type RestoreFn = Arc<dyn Fn() -> std::result::Result<(), ActionError> + Send + Sync>;

pub fn restore_fn<F>(f: F) -> RestoreFn
where
    F: Fn() -> std::result::Result<(), ActionError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One "do this unless canceled" request.
pub struct ActionRequest {
    pub key: String,
    pub kind: String,
    pub executor: ActionExecutor,
    /// `None` uses `undo.default_window_ms`.
    pub window: Option<Duration>,
    pub preview: Value,
    /// `None` on a re-request keeps the previous request's restore.
    pub restore: Option<RestoreFn>,
    /// `None` on a re-request keeps the previous request's batch.
    pub batch_id: Option<String>,
}

impl ActionRequest {
    pub fn new(key: impl Into<String>, kind: impl Into<String>, executor: ActionExecutor) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            executor,
            window: None,
            preview: Value::Null,
            restore: None,
            batch_id: None,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    #[must_use]
    pub fn with_preview(mut self, preview: Value) -> Self {
        self.preview = preview;
        self
    }

    #[must_use]
    pub fn with_restore(mut self, restore: RestoreFn) -> Self {
        self.restore = Some(restore);
        self
    }

    #[must_use]
    pub fn in_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    fn validate(&self) -> std::result::Result<(), ActionError> {
        if self.key.trim().is_empty() {
            return Err(ActionError::InvalidRequest("action key must not be empty".to_string()));
        }
        if self.batch_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ActionError::InvalidRequest(format!(
                "batch id for action `{}` must not be empty",
                self.key
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ActionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRequest")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("window", &self.window)
            .field("preview", &self.preview)
            .field("restore", &self.restore.is_some())
            .field("batch_id", &self.batch_id)
            .finish()
    }
}

/// Handle returned by [`UndoableActionService::request_action`].
#[derive(Debug)]
pub struct ActionTicket {
    key: String,
    toast_id: String,
    replaced: bool,
    state: watch::Receiver<ActionState>,
}

impl ActionTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn toast_id(&self) -> &str {
        &self.toast_id
    }

    /// Whether this request replaced a live request for the same key.
    pub fn replaced(&self) -> bool {
        self.replaced
    }

    /// Latest known state. A ticket follows its key across replacements.
    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }

    /// Wait for a terminal state.
    pub async fn outcome(&mut self) -> ActionState {
        loop {
            let state = *self.state.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed before expiry; restore has run.
    Canceled,
    /// Already executing; nothing was undone.
    TooLate,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCancelOutcome {
    pub canceled: Vec<String>,
    pub too_late: Vec<String>,
}

impl BatchCancelOutcome {
    pub fn is_empty(&self) -> bool {
        self.canceled.is_empty() && self.too_late.is_empty()
    }
}

/// Read-only view of a live action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSummary {
    pub key: String,
    pub kind: String,
    pub state: ActionState,
    pub batch_id: Option<String>,
    pub window_ms: u64,
    pub remaining_ms: Option<u64>,
}

// =============================================================================
// Service internals
// =============================================================================

struct ActionRecord {
    kind: String,
    preview: Value,
    executor: ActionExecutor,
    restore: Option<RestoreFn>,
    batch_id: Option<String>,
    generation: u64,
    window: Duration,
    state: watch::Sender<ActionState>,
    shown_countdown: Option<u64>,
}

impl ActionRecord {
    fn current(&self) -> ActionState {
        *self.state.borrow()
    }
}

#[derive(Default)]
struct BatchRecord {
    /// Member keys in request order.
    members: Vec<String>,
    restore: Option<RestoreFn>,
    shown: bool,
    shown_countdown: Option<u64>,
}

#[derive(Default)]
struct ServiceState {
    actions: HashMap<String, ActionRecord>,
    batches: HashMap<String, BatchRecord>,
    next_generation: u64,
}

enum ToastEvent {
    Show(ToastView),
    Update(ToastView),
    Fail(String, ActionError),
    Dismiss(String),
}

fn entry_id(key: &str) -> String {
    format!("undo:{key}")
}

fn action_view(key: &str, record: &ActionRecord, countdown: u64) -> ToastView {
    ToastView {
        toast_id: action_toast_id(key),
        kind: record.kind.clone(),
        countdown_seconds: countdown,
        preview: record.preview.clone(),
        members: vec![key.to_string()],
        cancel: CancelTarget::Action(key.to_string()),
    }
}

fn batch_view(
    batch_id: &str,
    batch: &BatchRecord,
    actions: &HashMap<String, ActionRecord>,
    countdown: u64,
) -> ToastView {
    let records: Vec<&ActionRecord> = batch
        .members
        .iter()
        .filter_map(|key| actions.get(key))
        .collect();
    let kind = match records.first() {
        Some(first) if records.iter().all(|r| r.kind == first.kind) => first.kind.clone(),
        Some(_) => "mixed".to_string(),
        None => String::new(),
    };
    ToastView {
        toast_id: batch_toast_id(batch_id),
        kind,
        countdown_seconds: countdown,
        preview: Value::Array(records.iter().map(|r| r.preview.clone()).collect()),
        members: batch.members.clone(),
        cancel: CancelTarget::Batch(batch_id.to_string()),
    }
}

/// Largest countdown among a batch's still-cancelable members.
fn batch_countdown(
    batch: &BatchRecord,
    actions: &HashMap<String, ActionRecord>,
    remaining: impl Fn(&str) -> Option<Duration>,
) -> u64 {
    batch
        .members
        .iter()
        .filter(|key| actions.get(*key).is_some_and(|r| r.current() == ActionState::Queued))
        .filter_map(|key| remaining(key.as_str()))
        .map(countdown_seconds)
        .max()
        .unwrap_or(0)
}

fn run_restore(label: &str, restore: &RestoreFn) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| restore())) {
        Ok(Ok(())) => debug!(key = label, "Restore completed"),
        Ok(Err(err)) => warn!(key = label, error = %err, "Restore failed"),
        Err(payload) => warn!(
            key = label,
            panic = %panic_message(payload.as_ref()),
            "Restore panicked"
        ),
    }
}

async fn run_once(executor: ActionExecutor) -> std::result::Result<(), ActionError> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(|| executor.call()))
        .map_err(|payload| ActionError::Panicked(panic_message(payload.as_ref())))?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ActionError::Panicked(panic_message(payload.as_ref()))))
}

struct ServiceInner {
    config: UndoConfig,
    retry: RetryPolicy,
    queue: DeferredActionQueue,
    coordinator: Arc<FreezeCoordinator>,
    sink: Arc<dyn ToastSink>,
    state: Mutex<ServiceState>,
    presenter: OnceLock<AbortHandle>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(presenter) = self.presenter.get() {
            presenter.abort();
        }
        self.coordinator.unregister_system(&self.config.system_id);
    }
}

impl ServiceInner {
    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remaining(&self, key: &str) -> Option<Duration> {
        self.queue.remaining(&entry_id(key))
    }

    fn emit(&self, events: Vec<ToastEvent>) {
        for event in events {
            match event {
                ToastEvent::Show(view) => self.sink.show(&view),
                ToastEvent::Update(view) => self.sink.update(&view),
                ToastEvent::Fail(toast_id, err) => self.sink.fail(&toast_id, &err),
                ToastEvent::Dismiss(toast_id) => self.sink.dismiss(&toast_id),
            }
        }
    }

    /// Show or refresh a batch's aggregate toast.
    fn batch_event(&self, state: &mut ServiceState, batch_id: &str) -> Option<ToastEvent> {
        let ServiceState {
            actions, batches, ..
        } = state;
        let batch = batches.get_mut(batch_id)?;
        let countdown = batch_countdown(batch, actions, |key| self.remaining(key));
        let view = batch_view(batch_id, batch, actions, countdown);
        batch.shown_countdown = Some(countdown);
        Some(if std::mem::replace(&mut batch.shown, true) {
            ToastEvent::Update(view)
        } else {
            ToastEvent::Show(view)
        })
    }

    /// Drop `key` from a batch, dismissing the batch toast when it empties.
    fn detach_from_batch(&self, state: &mut ServiceState, batch_id: &str, key: &str) -> Vec<ToastEvent> {
        let Some(batch) = state.batches.get_mut(batch_id) else {
            return Vec::new();
        };
        batch.members.retain(|member| member != key);
        if batch.members.is_empty() {
            let shown = batch.shown;
            state.batches.remove(batch_id);
            debug!(batch_id, "Batch emptied");
            return if shown {
                vec![ToastEvent::Dismiss(batch_toast_id(batch_id))]
            } else {
                Vec::new()
            };
        }
        if batch.shown {
            self.batch_event(state, batch_id).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Insert or replace one action. Batch toasts are left to the caller.
    fn enqueue_locked(
        self: &Arc<Self>,
        state: &mut ServiceState,
        request: ActionRequest,
    ) -> std::result::Result<(ActionTicket, Vec<ToastEvent>), ActionError> {
        request.validate()?;
        let ActionRequest {
            key,
            kind,
            executor,
            window,
            preview,
            restore,
            batch_id,
        } = request;

        if let Some(existing) = state.actions.get(&key) {
            if !existing.current().is_cancelable() {
                return Err(ActionError::AlreadyExecuting(key));
            }
        }

        let window = window.unwrap_or_else(|| self.config.default_window());
        let generation = state.next_generation;
        state.next_generation += 1;
        let mut events = Vec::new();

        let previous = state.actions.remove(&key);
        let replaced = previous.is_some();
        let (restore, batch_id, state_tx) = match previous {
            Some(prev) => {
                let batch_id = batch_id.or_else(|| prev.batch_id.clone());
                match (&prev.batch_id, &batch_id) {
                    (Some(old), new) if new.as_ref() != Some(old) => {
                        events.extend(self.detach_from_batch(state, old, &key));
                    }
                    (None, Some(_)) => events.push(ToastEvent::Dismiss(action_toast_id(&key))),
                    _ => {}
                }
                (restore.or(prev.restore), batch_id, prev.state)
            }
            None => (restore, batch_id, watch::channel(ActionState::Queued).0),
        };

        let metadata = json!({
            "key": key,
            "kind": kind,
            "preview": preview,
            "batch_id": batch_id,
        });
        let weak = Arc::downgrade(self);
        let expire_key = key.clone();
        self.queue.add(
            entry_id(&key),
            window,
            on_complete(move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(expire_key, generation).await;
                }
                Ok(())
            }),
            AddOptions::new().with_metadata(metadata),
        );

        let countdown = countdown_seconds(window);
        let record = ActionRecord {
            kind,
            preview,
            executor,
            restore,
            batch_id: batch_id.clone(),
            generation,
            window,
            state: state_tx,
            shown_countdown: Some(countdown),
        };
        let ticket = ActionTicket {
            key: key.clone(),
            toast_id: match &batch_id {
                Some(batch_id) => batch_toast_id(batch_id),
                None => action_toast_id(&key),
            },
            replaced,
            state: record.state.subscribe(),
        };

        match &batch_id {
            Some(batch_id) => {
                let batch = state.batches.entry(batch_id.clone()).or_default();
                if !batch.members.contains(&key) {
                    batch.members.push(key.clone());
                }
            }
            None => {
                let view = action_view(&key, &record, countdown);
                events.push(if replaced {
                    ToastEvent::Update(view)
                } else {
                    ToastEvent::Show(view)
                });
            }
        }

        debug!(
            key = %key,
            kind = %record.kind,
            batch_id = ?record.batch_id,
            window_ms = window.as_millis() as u64,
            generation,
            replaced,
            "Undoable action queued"
        );
        state.actions.insert(key, record);
        Ok((ticket, events))
    }

    async fn expire(self: Arc<Self>, key: String, generation: u64) {
        let executor = {
            let state = self.lock();
            let Some(record) = state.actions.get(&key) else {
                debug!(key = %key, "Expiry for canceled action ignored");
                return;
            };
            if record.generation != generation || !record.current().is_cancelable() {
                debug!(key = %key, generation, "Stale expiry ignored");
                return;
            }
            advance(&record.state, &key, ActionState::Expired);
            advance(&record.state, &key, ActionState::Executing);
            record.executor.clone()
        };

        debug!(key = %key, "Executing undoable action");
        let outcome = AssertUnwindSafe(with_retry_if(
            &self.retry,
            || run_once(executor.clone()),
            ActionError::is_retryable,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(ActionError::Panicked(panic_message(payload.as_ref()))));

        let (events, kind) = {
            let mut state = self.lock();
            let Some(record) = state.actions.remove(&key) else {
                return;
            };
            let next = if outcome.is_ok() {
                ActionState::Settled
            } else {
                ActionState::Failed
            };
            advance(&record.state, &key, next);

            let mut events = Vec::new();
            match &record.batch_id {
                Some(batch_id) => {
                    if let Err(err) = &outcome {
                        events.push(ToastEvent::Fail(batch_toast_id(batch_id), err.clone()));
                    }
                    events.extend(self.detach_from_batch(&mut state, batch_id, &key));
                }
                None => {
                    let toast_id = action_toast_id(&key);
                    if let Err(err) = &outcome {
                        events.push(ToastEvent::Fail(toast_id.clone(), err.clone()));
                    }
                    events.push(ToastEvent::Dismiss(toast_id));
                }
            }
            (events, record.kind)
        };

        match &outcome {
            Ok(()) => info!(key = %key, kind = %kind, "Undoable action settled"),
            Err(err) => warn!(key = %key, kind = %kind, error = %err, "Undoable action failed"),
        }
        self.emit(events);
    }

    /// Push countdown changes from a queue snapshot to the sink.
    fn present(&self, snapshot: &QueueSnapshot) {
        let events = {
            let mut guard = self.lock();
            let ServiceState {
                actions, batches, ..
            } = &mut *guard;
            let remaining = |key: &str| {
                snapshot
                    .get(&entry_id(key))
                    .map(|entry| Duration::from_millis(entry.remaining_ms))
            };

            let mut events = Vec::new();
            for (key, record) in actions.iter_mut() {
                if record.batch_id.is_some() || !record.current().is_cancelable() {
                    continue;
                }
                let Some(left) = remaining(key.as_str()) else {
                    continue;
                };
                let countdown = countdown_seconds(left);
                if record.shown_countdown != Some(countdown) {
                    record.shown_countdown = Some(countdown);
                    events.push(ToastEvent::Update(action_view(key, record, countdown)));
                }
            }
            for (batch_id, batch) in batches.iter_mut() {
                if !batch.shown {
                    continue;
                }
                let countdown = batch_countdown(batch, actions, remaining);
                if batch.shown_countdown != Some(countdown) {
                    batch.shown_countdown = Some(countdown);
                    events.push(ToastEvent::Update(batch_view(batch_id, batch, actions, countdown)));
                }
            }
            events
        };
        self.emit(events);
    }
}

fn spawn_presenter(runtime: &Handle, inner: &Arc<ServiceInner>) -> AbortHandle {
    let mut snapshots = inner.queue.subscribe();
    let weak = Arc::downgrade(inner);
    runtime
        .spawn(async move {
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.present(&snapshot);
            }
        })
        .abort_handle()
}

// =============================================================================
// Public service
// =============================================================================

/// Composition of queue, freeze coordinator and toasts into undoable actions.
///
/// Cheap to clone. The service registers with the coordinator under
/// `undo.system_id` and unregisters when the last clone is dropped.
#[derive(Clone)]
pub struct UndoableActionService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for UndoableActionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("UndoableActionService")
            .field("system_id", &self.inner.config.system_id)
            .field("actions", &state.actions.len())
            .field("batches", &state.batches.len())
            .finish()
    }
}

impl UndoableActionService {
    pub fn new(
        config: UndoConfig,
        queue: DeferredActionQueue,
        coordinator: Arc<FreezeCoordinator>,
        sink: Arc<dyn ToastSink>,
    ) -> Result<Self> {
        if coordinator.systems().contains(&config.system_id) {
            return Err(ConfigError::Invalid(format!(
                "freeze system `{}` is already registered",
                config.system_id
            ))
            .into());
        }
        let freeze_queue = queue.clone();
        let unfreeze_queue = queue.clone();
        coordinator.register_system(
            config.system_id.clone(),
            Arc::new(move || freeze_queue.freeze_all()),
            Arc::new(move || unfreeze_queue.unfreeze_all()),
        )?;

        let runtime = queue.runtime().clone();
        let inner = Arc::new(ServiceInner {
            retry: config.retry.policy(),
            config,
            queue,
            coordinator,
            sink,
            state: Mutex::new(ServiceState::default()),
            presenter: OnceLock::new(),
        });
        let _ = inner.presenter.set(spawn_presenter(&runtime, &inner));
        info!(system_id = %inner.config.system_id, "Undoable action service started");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &UndoConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &DeferredActionQueue {
        &self.inner.queue
    }

    /// Queue an action, replacing a live request for the same key.
    pub fn request_action(&self, request: ActionRequest) -> std::result::Result<ActionTicket, ActionError> {
        let (ticket, events) = {
            let mut state = self.inner.lock();
            let batch_id = request.batch_id.clone();
            let (ticket, mut events) = self.inner.enqueue_locked(&mut state, request)?;
            let batch_id = batch_id.or_else(|| {
                state
                    .actions
                    .get(ticket.key())
                    .and_then(|record| record.batch_id.clone())
            });
            if let Some(batch_id) = batch_id {
                events.extend(self.inner.batch_event(&mut state, &batch_id));
            }
            (ticket, events)
        };
        self.inner.emit(events);
        Ok(ticket)
    }

    /// Queue several actions under one batch id with one aggregate toast.
    ///
    /// Either every request is queued or none is.
    pub fn request_batch(
        &self,
        batch_id: impl Into<String>,
        requests: Vec<ActionRequest>,
        batch_restore: Option<RestoreFn>,
    ) -> std::result::Result<Vec<ActionTicket>, ActionError> {
        let batch_id = batch_id.into();
        if batch_id.trim().is_empty() {
            return Err(ActionError::InvalidRequest("batch id must not be empty".to_string()));
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let (tickets, events) = {
            let mut state = self.inner.lock();
            for request in &requests {
                request.validate()?;
                if state
                    .actions
                    .get(&request.key)
                    .is_some_and(|record| !record.current().is_cancelable())
                {
                    return Err(ActionError::AlreadyExecuting(request.key.clone()));
                }
            }

            let batch = state.batches.entry(batch_id.clone()).or_default();
            if let Some(restore) = batch_restore {
                batch.restore = Some(restore);
            }

            let mut tickets = Vec::with_capacity(requests.len());
            let mut events = Vec::new();
            for mut request in requests {
                request.batch_id = Some(batch_id.clone());
                let (ticket, request_events) = self.inner.enqueue_locked(&mut state, request)?;
                tickets.push(ticket);
                events.extend(request_events);
            }
            events.extend(self.inner.batch_event(&mut state, &batch_id));
            (tickets, events)
        };

        info!(batch_id = %batch_id, members = tickets.len(), "Undoable batch queued");
        self.inner.emit(events);
        Ok(tickets)
    }

    /// Set the callback that undoes a whole batch at once. Returns false for
    /// unknown batches.
    pub fn set_batch_restore(&self, batch_id: &str, restore: RestoreFn) -> bool {
        let mut state = self.inner.lock();
        match state.batches.get_mut(batch_id) {
            Some(batch) => {
                batch.restore = Some(restore);
                true
            }
            None => false,
        }
    }

    /// Cancel one action inside its window and run its restore.
    pub fn cancel_action(&self, key: &str) -> CancelOutcome {
        let (record, events) = {
            let mut state = self.inner.lock();
            match state.actions.get(key).map(ActionRecord::current) {
                None => return CancelOutcome::NotFound,
                Some(current) if !current.is_cancelable() => {
                    debug!(key, state = %current, "Cancel arrived too late");
                    return CancelOutcome::TooLate;
                }
                Some(_) => {}
            }
            let Some(record) = state.actions.remove(key) else {
                return CancelOutcome::NotFound;
            };
            self.inner.queue.remove(&entry_id(key));
            advance(&record.state, key, ActionState::Canceled);

            let events = match &record.batch_id {
                Some(batch_id) => self.inner.detach_from_batch(&mut state, batch_id, key),
                None => vec![ToastEvent::Dismiss(action_toast_id(key))],
            };
            (record, events)
        };

        self.inner.emit(events);
        if let Some(restore) = &record.restore {
            run_restore(key, restore);
        }
        advance(&record.state, key, ActionState::Restored);
        info!(key, kind = %record.kind, "Undoable action canceled");
        CancelOutcome::Canceled
    }

    /// Cancel every still-queued member of a batch in one step.
    ///
    /// Members are removed from the queue atomically, so none can expire
    /// mid-cancel. The batch restore runs once if set; otherwise each
    /// canceled member's own restore runs.
    pub fn cancel_batch(&self, batch_id: &str) -> BatchCancelOutcome {
        let (canceled, too_late, records, batch_restore, events) = {
            let mut state = self.inner.lock();
            let Some(batch) = state.batches.remove(batch_id) else {
                return BatchCancelOutcome::default();
            };

            let (canceled, too_late): (Vec<String>, Vec<String>) =
                batch.members.iter().cloned().partition(|key| {
                    state
                        .actions
                        .get(key)
                        .is_some_and(|record| record.current().is_cancelable())
                });

            let entry_ids: Vec<String> = canceled.iter().map(|key| entry_id(key)).collect();
            self.inner.queue.remove_many(entry_ids.as_slice());

            let mut records = Vec::with_capacity(canceled.len());
            for key in &canceled {
                if let Some(record) = state.actions.remove(key) {
                    advance(&record.state, key, ActionState::Canceled);
                    records.push((key.clone(), record));
                }
            }

            let mut events = Vec::new();
            if too_late.is_empty() {
                if batch.shown {
                    events.push(ToastEvent::Dismiss(batch_toast_id(batch_id)));
                }
            } else {
                state.batches.insert(
                    batch_id.to_string(),
                    BatchRecord {
                        members: too_late.clone(),
                        restore: None,
                        shown: batch.shown,
                        shown_countdown: None,
                    },
                );
                if batch.shown {
                    events.extend(self.inner.batch_event(&mut state, batch_id));
                }
            }
            (canceled, too_late, records, batch.restore, events)
        };

        self.inner.emit(events);
        if !records.is_empty() {
            match &batch_restore {
                Some(restore) => run_restore(batch_id, restore),
                None => {
                    for (key, record) in &records {
                        if let Some(restore) = &record.restore {
                            run_restore(key, restore);
                        }
                    }
                }
            }
        }
        for (key, record) in &records {
            advance(&record.state, key, ActionState::Restored);
        }

        info!(
            batch_id,
            canceled = canceled.len(),
            too_late = too_late.len(),
            "Undoable batch canceled"
        );
        BatchCancelOutcome { canceled, too_late }
    }

    /// State of a live action. `None` once it reached a terminal state.
    pub fn state(&self, key: &str) -> Option<ActionState> {
        self.inner.lock().actions.get(key).map(ActionRecord::current)
    }

    /// Current view of one toast.
    pub fn toast(&self, toast_id: &str) -> Option<ToastView> {
        let state = self.inner.lock();
        if let Some(batch_id) = toast_id.strip_prefix("batch:") {
            let batch = state.batches.get(batch_id)?;
            let countdown = batch_countdown(batch, &state.actions, |key| self.inner.remaining(key));
            return Some(batch_view(batch_id, batch, &state.actions, countdown));
        }
        let key = toast_id.strip_prefix("action:")?;
        let record = state.actions.get(key).filter(|record| record.batch_id.is_none())?;
        let countdown = self.inner.remaining(key).map_or(0, countdown_seconds);
        Some(action_view(key, record, countdown))
    }

    /// Every live toast, standalone actions first, each group sorted by id.
    pub fn toasts(&self) -> Vec<ToastView> {
        let state = self.inner.lock();
        let mut singles: Vec<ToastView> = state
            .actions
            .iter()
            .filter(|(_, record)| record.batch_id.is_none())
            .map(|(key, record)| {
                let countdown = self.inner.remaining(key).map_or(0, countdown_seconds);
                action_view(key, record, countdown)
            })
            .collect();
        singles.sort_by(|a, b| a.toast_id.cmp(&b.toast_id));

        let mut batches: Vec<ToastView> = state
            .batches
            .iter()
            .map(|(batch_id, batch)| {
                let countdown = batch_countdown(batch, &state.actions, |key| self.inner.remaining(key));
                batch_view(batch_id, batch, &state.actions, countdown)
            })
            .collect();
        batches.sort_by(|a, b| a.toast_id.cmp(&b.toast_id));

        singles.extend(batches);
        singles
    }

    /// Every live action, sorted by key.
    pub fn live_actions(&self) -> Vec<ActionSummary> {
        let state = self.inner.lock();
        let mut summaries: Vec<ActionSummary> = state
            .actions
            .iter()
            .map(|(key, record)| ActionSummary {
                key: key.clone(),
                kind: record.kind.clone(),
                state: record.current(),
                batch_id: record.batch_id.clone(),
                window_ms: record.window.as_millis() as u64,
                remaining_ms: self
                    .inner
                    .remaining(key)
                    .map(|left| left.as_millis() as u64),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Freeze request on behalf of this service's own system id.
    pub fn freeze(&self) -> std::result::Result<bool, FreezeError> {
        self.inner.coordinator.freeze(&self.inner.config.system_id)
    }

    /// Release one freeze request made with [`freeze`](Self::freeze).
    pub fn unfreeze(&self) -> std::result::Result<bool, FreezeError> {
        self.inner.coordinator.unfreeze(&self.inner.config.system_id)
    }
}
