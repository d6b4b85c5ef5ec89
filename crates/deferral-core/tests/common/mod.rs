//! Shared helpers for deferral-core integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deferral_core::error::ActionError;
use deferral_core::toast::{ToastSink, ToastView};
use deferral_core::undoable::{ActionExecutor, RestoreFn, restore_fn};

// ---------------------------------------------------------------------------
// RecordingSink: captures every toast event in order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ToastEvent {
    Show(ToastView),
    Update(ToastView),
    Fail(String, ActionError),
    Dismiss(String),
}

impl ToastEvent {
    pub fn toast_id(&self) -> &str {
        match self {
            Self::Show(view) | Self::Update(view) => &view.toast_id,
            Self::Fail(id, _) | Self::Dismiss(id) => id,
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ToastEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ToastEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one toast id, in order.
    pub fn events_for(&self, toast_id: &str) -> Vec<ToastEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.toast_id() == toast_id)
            .collect()
    }

    pub fn shown(&self, toast_id: &str) -> usize {
        self.events_for(toast_id)
            .iter()
            .filter(|event| matches!(event, ToastEvent::Show(_)))
            .count()
    }

    pub fn dismissed(&self, toast_id: &str) -> usize {
        self.events_for(toast_id)
            .iter()
            .filter(|event| matches!(event, ToastEvent::Dismiss(_)))
            .count()
    }

    fn push(&self, event: ToastEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ToastSink for RecordingSink {
    fn show(&self, view: &ToastView) {
        self.push(ToastEvent::Show(view.clone()));
    }

    fn update(&self, view: &ToastView) {
        self.push(ToastEvent::Update(view.clone()));
    }

    fn fail(&self, toast_id: &str, error: &ActionError) {
        self.push(ToastEvent::Fail(toast_id.to_string(), error.clone()));
    }

    fn dismiss(&self, toast_id: &str) {
        self.push(ToastEvent::Dismiss(toast_id.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn executor(&self) -> ActionExecutor {
        let counter = self.clone();
        ActionExecutor::new(move || {
            let counter = counter.clone();
            async move {
                counter.bump();
                Ok(())
            }
        })
    }

    pub fn restore(&self) -> RestoreFn {
        let counter = self.clone();
        restore_fn(move || {
            counter.bump();
            Ok(())
        })
    }
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
