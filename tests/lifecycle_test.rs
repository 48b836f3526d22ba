//! Lifecycle state machine properties.

use belay::lifecycle::{transition_allowed, LifecycleController};
use belay::WorkerState;
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = WorkerState> {
    prop_oneof![
        Just(WorkerState::Initialized),
        Just(WorkerState::Running),
        Just(WorkerState::Suspended),
        Just(WorkerState::Stopping),
        Just(WorkerState::Draining),
        Just(WorkerState::Drained),
        Just(WorkerState::Stopped),
        Just(WorkerState::Failed),
    ]
}

proptest! {
    /// The controller accepts exactly the transitions the matrix allows,
    /// and its state only moves on accepted transitions.
    #[test]
    fn controller_enforces_the_transition_matrix(
        targets in proptest::collection::vec(any_state(), 1..48)
    ) {
        let lifecycle = LifecycleController::new();
        let mut model = WorkerState::Initialized;
        for target in targets {
            let accepted = lifecycle.transition(target).is_ok();
            let legal = transition_allowed(model, target);
            prop_assert_eq!(accepted, legal);
            if legal {
                model = target;
            }
            prop_assert_eq!(lifecycle.state(), model);
        }
    }

    /// Terminal states absorb: once STOPPED or FAILED, nothing moves.
    #[test]
    fn terminal_states_admit_no_transitions(
        reached in prop_oneof![Just(WorkerState::Stopped), Just(WorkerState::Failed)],
        targets in proptest::collection::vec(any_state(), 1..16)
    ) {
        let lifecycle = LifecycleController::new();
        lifecycle.transition(WorkerState::Running).unwrap();
        match reached {
            WorkerState::Failed => {
                lifecycle.transition(WorkerState::Failed).unwrap();
            }
            _ => {
                for step in [
                    WorkerState::Stopping,
                    WorkerState::Draining,
                    WorkerState::Drained,
                    WorkerState::Stopped,
                ] {
                    lifecycle.transition(step).unwrap();
                }
            }
        }
        for target in targets {
            prop_assert!(lifecycle.transition(target).is_err());
            prop_assert!(!lifecycle.fail());
            prop_assert_eq!(lifecycle.state(), reached);
        }
    }

    /// The shutdown path never moves backward: along any accepted
    /// sequence, once the worker leaves the RUNNING/SUSPENDED pair it
    /// only advances through STOPPING, DRAINING, DRAINED, STOPPED.
    #[test]
    fn drain_progression_is_monotonic(
        targets in proptest::collection::vec(any_state(), 1..48)
    ) {
        fn drain_rank(state: WorkerState) -> Option<u8> {
            match state {
                WorkerState::Stopping => Some(0),
                WorkerState::Draining => Some(1),
                WorkerState::Drained => Some(2),
                WorkerState::Stopped => Some(3),
                _ => None,
            }
        }

        let lifecycle = LifecycleController::new();
        let mut highest: Option<u8> = None;
        for target in targets {
            if lifecycle.transition(target).is_ok() {
                if let Some(rank) = drain_rank(target) {
                    if let Some(previous) = highest {
                        prop_assert!(rank > previous);
                    }
                    highest = Some(rank);
                }
            }
        }
    }
}

#[test]
fn failed_is_reachable_from_every_non_terminal_state() {
    for state in [
        WorkerState::Initialized,
        WorkerState::Running,
        WorkerState::Suspended,
        WorkerState::Stopping,
        WorkerState::Draining,
        WorkerState::Drained,
    ] {
        assert!(transition_allowed(state, WorkerState::Failed), "{state}");
    }
    assert!(!transition_allowed(WorkerState::Stopped, WorkerState::Failed));
    assert!(!transition_allowed(WorkerState::Failed, WorkerState::Failed));
}
