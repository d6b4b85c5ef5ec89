//! deferral-core: deferred execution and coalescing for undoable actions
//!
//! Lets an application say "do X in N seconds unless the user cancels", pause
//! every pending countdown while something modal is open, and fold many small
//! server calls into bulk requests.
//!
//! # Architecture
//!
//! ```text
//!   request_action ──► UndoableActionService ──► ToastSink
//!                           │        ▲
//!               countdown   │        │ freeze / unfreeze
//!                           ▼        │
//!                  DeferredActionQueue ◄── FreezeCoordinator ◄── other systems
//!                           │
//!                  expiry   ▼
//!                     ActionExecutor ──► BatchCoalescer ──► BulkFetcher (HTTP)
//! ```
//!
//! # Modules
//!
//! - `queue`: Named countdown entries with pause, resume, replace and global freeze
//! - `freeze`: Reference-counted freeze requests across registered systems
//! - `batch`: Debounced, chunked bulk fetches with per-key results
//! - `bulk_http`: `BulkFetcher` over a JSON HTTP endpoint
//! - `undoable`: Undo windows, batches and the action state machine
//! - `toast`: Presentation contract for pending actions
//! - `context`: Explicitly constructed instance wiring the pieces together
//! - `timer`: Cancellable one-shot and repeating Tokio timers
//! - `retry`: Exponential backoff for executors
//! - `config`: TOML configuration
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod batch;
pub mod bulk_http;
pub mod config;
pub mod context;
pub mod error;
pub mod freeze;
pub mod logging;
pub mod queue;
pub mod retry;
pub mod timer;
pub mod toast;
pub mod undoable;

pub use batch::{BatchCoalescer, BatchTicket, BulkEntry, BulkFetcher, fetcher_fn};
pub use bulk_http::HttpBulkFetcher;
pub use config::{BatchMode, DeferralConfig};
pub use context::DeferralContext;
pub use error::{ActionError, BatchError, Error, FreezeError, Result};
pub use freeze::FreezeCoordinator;
pub use queue::{AddOptions, DeferredActionQueue, on_complete};
pub use toast::{NullToastSink, ToastSink, ToastView};
pub use undoable::{
    ActionExecutor, ActionRequest, ActionState, ActionTicket, CancelOutcome,
    UndoableActionService, restore_fn,
};

/// Version of the deferral-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
