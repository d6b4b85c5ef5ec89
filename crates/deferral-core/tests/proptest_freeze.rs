//! Property-based tests for the freeze coordinator.
//!
//! Verifies under random freeze/unfreeze sequences:
//! - is_frozen is exactly "some system holds a request"
//! - per-system counts match a simple model
//! - each system's callbacks alternate freeze, unfreeze, freeze, ...
//! - callbacks run once per global transition, never once per call
//! - force_unfreeze_all clears every count

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use deferral_core::freeze::FreezeCoordinator;

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

const SYSTEMS: [&str; 3] = ["hover", "modal", "undoable_actions"];

#[derive(Debug, Clone)]
enum Op {
    Freeze(usize),
    Unfreeze(usize),
    ForceUnfreeze,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0..SYSTEMS.len()).prop_map(Op::Freeze),
        5 => (0..SYSTEMS.len()).prop_map(Op::Unfreeze),
        1 => Just(Op::ForceUnfreeze),
    ]
}

// ────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────

type Log = Arc<Mutex<Vec<(usize, bool)>>>;

fn coordinator_with_log() -> (FreezeCoordinator, Log) {
    let coordinator = FreezeCoordinator::new();
    let log: Log = Arc::default();
    for (index, system_id) in SYSTEMS.iter().enumerate() {
        let on_freeze = Arc::clone(&log);
        let on_unfreeze = Arc::clone(&log);
        coordinator
            .register_system(
                *system_id,
                Arc::new(move || on_freeze.lock().unwrap().push((index, true))),
                Arc::new(move || on_unfreeze.lock().unwrap().push((index, false))),
            )
            .unwrap();
    }
    (coordinator, log)
}

fn apply(coordinator: &FreezeCoordinator, model: &mut BTreeMap<usize, u32>, op: &Op) {
    match op {
        Op::Freeze(i) => {
            coordinator.freeze(SYSTEMS[*i]).unwrap();
            *model.entry(*i).or_default() += 1;
        }
        Op::Unfreeze(i) => {
            coordinator.unfreeze(SYSTEMS[*i]).unwrap();
            let count = model.entry(*i).or_default();
            *count = count.saturating_sub(1);
        }
        Op::ForceUnfreeze => {
            coordinator.force_unfreeze_all();
            model.clear();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn frozen_matches_model(ops in prop::collection::vec(arb_op(), 0..64)) {
        let (coordinator, _log) = coordinator_with_log();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&coordinator, &mut model, op);
            let total: u64 = model.values().map(|&c| u64::from(c)).sum();
            prop_assert_eq!(coordinator.is_frozen(), total > 0);
            prop_assert_eq!(coordinator.total_requests(), total);
            for (i, system_id) in SYSTEMS.iter().enumerate() {
                let expected = model.get(&i).copied().unwrap_or(0);
                prop_assert_eq!(coordinator.request_count(system_id), Some(expected));
            }
        }
    }

    #[test]
    fn callbacks_alternate_per_system(ops in prop::collection::vec(arb_op(), 0..64)) {
        let (coordinator, log) = coordinator_with_log();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&coordinator, &mut model, op);
        }

        let log = log.lock().unwrap().clone();
        for i in 0..SYSTEMS.len() {
            let calls: Vec<bool> = log.iter().filter(|(s, _)| *s == i).map(|(_, f)| *f).collect();
            for (n, frozen) in calls.iter().enumerate() {
                prop_assert_eq!(*frozen, n % 2 == 0);
            }
            // An odd number of calls means the last transition was a freeze.
            prop_assert_eq!(calls.len() % 2 == 1, coordinator.is_frozen());
        }
    }

    #[test]
    fn callbacks_run_once_per_transition(ops in prop::collection::vec(arb_op(), 0..64)) {
        let (coordinator, log) = coordinator_with_log();
        let mut model = BTreeMap::new();
        let mut transitions = 0_usize;
        let mut was_frozen = false;
        for op in &ops {
            apply(&coordinator, &mut model, op);
            let frozen = coordinator.is_frozen();
            if frozen != was_frozen {
                transitions += 1;
                was_frozen = frozen;
            }
        }
        prop_assert_eq!(log.lock().unwrap().len(), transitions * SYSTEMS.len());
    }
}

#[test]
fn two_systems_unfreeze_only_after_last_release() {
    let (coordinator, log) = coordinator_with_log();
    coordinator.freeze("hover").unwrap();
    coordinator.freeze("modal").unwrap();
    assert_eq!(log.lock().unwrap().len(), SYSTEMS.len());

    coordinator.unfreeze("hover").unwrap();
    assert_eq!(log.lock().unwrap().len(), SYSTEMS.len());

    coordinator.unfreeze("modal").unwrap();
    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), SYSTEMS.len() * 2);
    assert!(log[SYSTEMS.len()..].iter().all(|(_, frozen)| !frozen));
}
