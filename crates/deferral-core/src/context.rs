//! Explicitly constructed instance of the whole subsystem.
//!
//! Nothing in this crate is process-global. A [`DeferralContext`] owns one
//! freeze coordinator and one queue; services and coalescers built from it
//! share them. Two contexts never see each other's state.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use crate::batch::{BatchCoalescer, BulkFetcher};
use crate::config::DeferralConfig;
use crate::error::{Error, Result};
use crate::freeze::FreezeCoordinator;
use crate::queue::DeferredActionQueue;
use crate::toast::ToastSink;
use crate::undoable::UndoableActionService;

#[derive(Debug, Clone)]
pub struct DeferralContext {
    config: DeferralConfig,
    runtime: Handle,
    coordinator: Arc<FreezeCoordinator>,
    queue: DeferredActionQueue,
}

impl DeferralContext {
    /// Build a context on the current Tokio runtime.
    pub fn new(config: DeferralConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| Error::Runtime(err.to_string()))?;
        Self::with_handle(config, runtime)
    }

    pub fn with_handle(config: DeferralConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let queue = DeferredActionQueue::with_handle(config.queue.clone(), runtime.clone());
        debug!(
            tick_interval_ms = config.queue.tick_interval_ms,
            unfreeze_grace_ms = config.queue.unfreeze_grace_ms,
            "Deferral context created"
        );
        Ok(Self {
            config,
            runtime,
            coordinator: Arc::new(FreezeCoordinator::new()),
            queue,
        })
    }

    pub fn config(&self) -> &DeferralConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Arc<FreezeCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn queue(&self) -> &DeferredActionQueue {
        &self.queue
    }

    /// Undoable action service over this context's queue and coordinator.
    ///
    /// Fails if a service with the same `undo.system_id` is still alive.
    pub fn undoable_service(&self, sink: Arc<dyn ToastSink>) -> Result<UndoableActionService> {
        UndoableActionService::new(
            self.config.undo.clone(),
            self.queue.clone(),
            self.coordinator(),
            sink,
        )
    }

    /// Coalescer using this context's batch settings.
    pub fn batch_coalescer<K, V, F>(&self, fetcher: F) -> BatchCoalescer<K, V>
    where
        K: Eq + std::hash::Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Clone + Send + 'static,
        F: BulkFetcher<K, V>,
    {
        BatchCoalescer::with_handle(self.config.batch.clone(), Arc::new(fetcher), self.runtime.clone())
    }
}
