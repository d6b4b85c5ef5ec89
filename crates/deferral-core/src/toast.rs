//! Presentation contract for pending undoable actions.
//!
//! The core never renders anything. It pushes [`ToastView`]s into a
//! [`ToastSink`] supplied by the embedding application, which is free to draw
//! them, log them, or ignore them.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::ActionError;

/// What the toast's cancel affordance cancels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "target", content = "id", rename_all = "snake_case")]
pub enum CancelTarget {
    /// A single action key.
    Action(String),
    /// Every member of a batch.
    Batch(String),
}

impl CancelTarget {
    /// Toast id used for this target.
    pub fn toast_id(&self) -> String {
        match self {
            Self::Action(key) => action_toast_id(key),
            Self::Batch(batch_id) => batch_toast_id(batch_id),
        }
    }
}

/// Toast id for a standalone action.
pub fn action_toast_id(key: &str) -> String {
    format!("action:{key}")
}

/// Toast id for the aggregate toast of a batch.
pub fn batch_toast_id(batch_id: &str) -> String {
    format!("batch:{batch_id}")
}

/// Whole seconds shown for a remaining duration, rounded up so a toast never
/// shows 0 while its action is still cancelable.
pub fn countdown_seconds(remaining: Duration) -> u64 {
    remaining.as_millis().div_ceil(1000) as u64
}

/// Everything a presentation layer needs to draw one toast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToastView {
    pub toast_id: String,
    /// Action kind, `"mixed"` for batches spanning several kinds.
    pub kind: String,
    pub countdown_seconds: u64,
    /// Single action: its preview. Batch: array of member previews.
    pub preview: Value,
    /// Action keys covered by this toast.
    pub members: Vec<String>,
    pub cancel: CancelTarget,
}

/// Receiver of toast lifecycle events.
///
/// Calls are made outside every internal lock and may arrive from any Tokio
/// worker thread.
pub trait ToastSink: Send + Sync + 'static {
    /// A toast appeared.
    fn show(&self, view: &ToastView);

    /// The displayed whole-second countdown or the member list changed.
    fn update(&self, view: &ToastView);

    /// The action behind the toast failed. `dismiss` follows.
    fn fail(&self, toast_id: &str, error: &ActionError);

    /// The toast is gone.
    fn dismiss(&self, toast_id: &str);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullToastSink;

impl ToastSink for NullToastSink {
    fn show(&self, _view: &ToastView) {}

    fn update(&self, _view: &ToastView) {}

    fn fail(&self, _toast_id: &str, _error: &ActionError) {}

    fn dismiss(&self, _toast_id: &str) {}
}
