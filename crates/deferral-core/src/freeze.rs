//! Reference-counted freeze coordination across independent subsystems.
//!
//! Any number of systems register a pair of callbacks. Each system keeps its
//! own freeze request count; the coordinator is frozen while the sum of all
//! counts is positive. Callbacks run only on global transitions:
//!
//! ```text
//!            total 0 -> 1                     total 1 -> 0
//! Thawed ───────────────────► Frozen ───────────────────────► Thawed
//!        every freeze_fn once         every unfreeze_fn once
//! ```
//!
//! Overlapping requests (two hover targets, a modal on top of a menu) only
//! move counters. Callbacks are always invoked after the internal lock is
//! released, so they may call back into the coordinator.
//!
//! Delivery is serialized: one caller at a time runs callbacks, and it keeps
//! going until every system has seen the latest global state. A transition
//! made on another thread while callbacks are running is delivered by the
//! running caller afterwards, in order.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FreezeError, panic_message};

/// Callback invoked on a global freeze or unfreeze transition.
pub type FreezeCallback = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    freeze_fn: FreezeCallback,
    unfreeze_fn: FreezeCallback,
    request_count: u32,
    /// Whether this system's `freeze_fn` is the last callback it was given.
    delivered: bool,
}

#[derive(Default)]
struct CoordinatorState {
    systems: BTreeMap<String, Registration>,
    /// Global state every system is being brought to.
    applied: bool,
    /// A caller is currently running callbacks.
    dispatching: bool,
}

impl CoordinatorState {
    fn total_requests(&self) -> u64 {
        self.systems
            .values()
            .map(|reg| u64::from(reg.request_count))
            .sum()
    }

    /// Callbacks for systems lagging behind `applied`, marked delivered.
    fn take_pending(&mut self) -> Vec<FreezeCallback> {
        let target = self.applied;
        self.systems
            .values_mut()
            .filter(|reg| reg.delivered != target)
            .map(|reg| {
                reg.delivered = target;
                if target {
                    Arc::clone(&reg.freeze_fn)
                } else {
                    Arc::clone(&reg.unfreeze_fn)
                }
            })
            .collect()
    }
}

/// Per-system entry in a [`FreezeStatus`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFreezeStatus {
    pub system_id: String,
    pub request_count: u32,
}

/// Serializable snapshot of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeStatus {
    pub frozen: bool,
    pub total_requests: u64,
    pub systems: Vec<SystemFreezeStatus>,
}

/// Brokers pause/resume requests from many subsystems.
#[derive(Default)]
pub struct FreezeCoordinator {
    state: Mutex<CoordinatorState>,
}

impl std::fmt::Debug for FreezeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreezeCoordinator")
            .field("status", &self.status())
            .finish()
    }
}

fn run_all(callbacks: Vec<FreezeCallback>) {
    for callback in callbacks {
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            warn!(panic = %panic_message(payload.as_ref()), "Freeze callback panicked");
        }
    }
}

impl FreezeCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run callbacks until every system matches the global state.
    ///
    /// Returns at once if another caller is already dispatching; that caller
    /// picks up whatever changed.
    fn dispatch(&self) {
        let mut state = self.lock();
        if state.dispatching {
            return;
        }
        state.dispatching = true;
        loop {
            let pending = state.take_pending();
            if pending.is_empty() {
                state.dispatching = false;
                return;
            }
            drop(state);
            run_all(pending);
            state = self.lock();
        }
    }

    /// Register (or re-register) a system.
    ///
    /// Re-registering keeps the system's outstanding request count and swaps
    /// its callbacks. Stale frozen state (callbacks applied with no
    /// outstanding requests) is healed by unfreezing everything. A system that
    /// joins while the coordinator is frozen has its own `freeze_fn` run once
    /// so it starts out consistent.
    pub fn register_system(
        &self,
        system_id: impl Into<String>,
        freeze_fn: FreezeCallback,
        unfreeze_fn: FreezeCallback,
    ) -> Result<(), FreezeError> {
        let system_id = system_id.into();
        if system_id.is_empty() {
            return Err(FreezeError::EmptySystemId);
        }

        let (heal, join_frozen) = {
            let mut state = self.lock();
            let (request_count, delivered) = state
                .systems
                .get(&system_id)
                .map_or((0, false), |reg| (reg.request_count, reg.delivered));
            state.systems.insert(
                system_id.clone(),
                Registration {
                    freeze_fn,
                    unfreeze_fn,
                    request_count,
                    delivered,
                },
            );

            let heal = state.applied && state.total_requests() == 0;
            if heal {
                state.applied = false;
            }
            (heal, state.applied && !delivered)
        };

        if heal {
            warn!(
                system_id = %system_id,
                "Freeze coordinator was frozen with no outstanding requests; unfreezing all systems"
            );
        } else if join_frozen {
            debug!(system_id = %system_id, "System registered while frozen; applying freeze");
        } else {
            debug!(system_id = %system_id, "System registered with freeze coordinator");
        }
        self.dispatch();
        Ok(())
    }

    /// Remove a system. Returns `false` if it was not registered.
    ///
    /// When the removed system held the last outstanding requests, every
    /// remaining system and the removed one are unfrozen.
    pub fn unregister_system(&self, system_id: &str) -> bool {
        let (removed, released) = {
            let mut state = self.lock();
            let Some(removed) = state.systems.remove(system_id) else {
                return false;
            };
            let released = removed.request_count > 0 && state.applied && state.total_requests() == 0;
            if released {
                state.applied = false;
            }
            (removed, released)
        };

        if released {
            info!(
                system_id,
                released_requests = removed.request_count,
                "Unregistered system held the last freeze requests; unfreezing all systems"
            );
            self.dispatch();
            if removed.delivered {
                run_all(vec![removed.unfreeze_fn]);
            }
        } else {
            debug!(system_id, "System unregistered from freeze coordinator");
        }
        true
    }

    /// Add one freeze request for `system_id`.
    ///
    /// Returns `Ok(true)` when this request froze the coordinator.
    pub fn freeze(&self, system_id: &str) -> Result<bool, FreezeError> {
        let (count, froze) = {
            let mut state = self.lock();
            let Some(reg) = state.systems.get_mut(system_id) else {
                return Err(FreezeError::UnknownSystem(system_id.to_string()));
            };
            reg.request_count = reg.request_count.saturating_add(1);
            let count = reg.request_count;
            let froze = !state.applied;
            state.applied = true;
            (count, froze)
        };

        if froze {
            info!(system_id, request_count = count, "Freezing all systems");
            self.dispatch();
        } else {
            debug!(system_id, request_count = count, "Freeze request counted");
        }
        Ok(froze)
    }

    /// Release one freeze request for `system_id`.
    ///
    /// Returns `Ok(true)` when this release unfroze the coordinator. Releasing
    /// with no outstanding requests is a logged no-op.
    pub fn unfreeze(&self, system_id: &str) -> Result<bool, FreezeError> {
        let (count, thawed) = {
            let mut state = self.lock();
            let Some(reg) = state.systems.get_mut(system_id) else {
                return Err(FreezeError::UnknownSystem(system_id.to_string()));
            };
            if reg.request_count == 0 {
                drop(state);
                warn!(system_id, "Unfreeze requested with no outstanding freeze requests");
                return Ok(false);
            }
            reg.request_count -= 1;
            let count = reg.request_count;
            let thawed = state.applied && state.total_requests() == 0;
            if thawed {
                state.applied = false;
            }
            (count, thawed)
        };

        if thawed {
            info!(system_id, "Last freeze request released; unfreezing all systems");
            self.dispatch();
        } else {
            debug!(system_id, request_count = count, "Freeze request released");
        }
        Ok(thawed)
    }

    /// Drop every outstanding request and unfreeze if frozen.
    ///
    /// Returns `true` if this call thawed the coordinator.
    pub fn force_unfreeze_all(&self) -> bool {
        let thawed = {
            let mut state = self.lock();
            for reg in state.systems.values_mut() {
                reg.request_count = 0;
            }
            std::mem::replace(&mut state.applied, false)
        };

        if thawed {
            warn!("Forcing unfreeze of all systems");
            self.dispatch();
        }
        thawed
    }

    /// Global OR across all registered systems.
    pub fn is_frozen(&self) -> bool {
        self.lock().total_requests() > 0
    }

    /// Outstanding requests held by one system.
    pub fn request_count(&self, system_id: &str) -> Option<u32> {
        self.lock()
            .systems
            .get(system_id)
            .map(|reg| reg.request_count)
    }

    pub fn total_requests(&self) -> u64 {
        self.lock().total_requests()
    }

    /// Registered system ids in sorted order.
    pub fn systems(&self) -> Vec<String> {
        self.lock().systems.keys().cloned().collect()
    }

    pub fn status(&self) -> FreezeStatus {
        let state = self.lock();
        FreezeStatus {
            frozen: state.total_requests() > 0,
            total_requests: state.total_requests(),
            systems: state
                .systems
                .iter()
                .map(|(system_id, reg)| SystemFreezeStatus {
                    system_id: system_id.clone(),
                    request_count: reg.request_count,
                })
                .collect(),
        }
    }
}
