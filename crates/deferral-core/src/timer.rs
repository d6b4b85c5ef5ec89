//! Owned timer handles.
//!
//! Every timer started by this crate returns a [`TimerHandle`]. Cancelling
//! consumes the handle, so a timer cannot be "cancelled" by forgetting a
//! closure variable: either the owner still holds the handle, or it was
//! handed to [`TimerHandle::cancel`].
//!
//! Cancellation is synchronous. The cancellation flag is checked right before
//! the callback runs and the backing task is aborted. Owners that guard state
//! with a lock should additionally compare the [`TimerId`] passed to the
//! callback against the handle they currently store, under that lock, to close
//! the window between "sleep finished" and "callback acquired the lock".

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Process-unique identity of a started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Handle to a running one-shot or periodic timer.
#[must_use = "dropping a TimerHandle leaves the timer running; call cancel() to stop it"]
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    cancelled: Arc<AtomicBool>,
    task: AbortHandle,
}

impl TimerHandle {
    /// Identity passed to the timer's callback.
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Whether the backing task has run to completion or was aborted.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the timer. The callback will not start after this returns.
    pub fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Run `callback` once after `delay`.
pub fn spawn_after<F>(handle: &Handle, delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce(TimerId) + Send + 'static,
{
    let id = TimerId::next();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let task = handle
        .spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                callback(id);
            }
        })
        .abort_handle();
    TimerHandle {
        id,
        cancelled,
        task,
    }
}

/// Run `tick` every `period` until it returns [`ControlFlow::Break`] or the
/// handle is cancelled. The first tick fires one period after start.
///
/// Late ticks are delayed rather than bursted; callers that care about
/// elapsed time must measure it themselves.
pub fn spawn_every<F>(handle: &Handle, period: Duration, mut tick: F) -> TimerHandle
where
    F: FnMut(TimerId) -> ControlFlow<()> + Send + 'static,
{
    let id = TimerId::next();
    let period = period.max(MIN_PERIOD);
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let task = handle
        .spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if tick(id).is_break() {
                    break;
                }
            }
        })
        .abort_handle();
    TimerHandle {
        id,
        cancelled,
        task,
    }
}
