use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::broker::{CancelCallback, CancelRegistrar};

enum CoordinatorState {
    Armed(Vec<CancelCallback>),
    Fired,
}

/// Tells the dispatch loop to stop once the session is terminal.
///
/// Registration and firing race: the dispatch task may register only after
/// the session already resolved. A late registration is invoked on the
/// registering thread before `register` returns. Every callback runs at most
/// once, outside the lock.
pub struct CancellationCoordinator {
    state: Mutex<CoordinatorState>,
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState::Armed(Vec::new())),
        }
    }

    /// Returns `false` if the coordinator had already fired.
    pub fn fire(&self) -> bool {
        let callbacks = match mem::replace(&mut *self.lock_state(), CoordinatorState::Fired) {
            CoordinatorState::Armed(callbacks) => callbacks,
            CoordinatorState::Fired => return false,
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        matches!(*self.lock_state(), CoordinatorState::Fired)
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CancelRegistrar for CancellationCoordinator {
    fn register(&self, callback: CancelCallback) {
        let mut state = self.lock_state();
        match &mut *state {
            CoordinatorState::Armed(callbacks) => callbacks.push(callback),
            CoordinatorState::Fired => {
                drop(state);
                callback();
            }
        }
    }
}
