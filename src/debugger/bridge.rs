//! Blocking hand-off between the execution thread and the protocol side
//!
//! The execution thread runs synchronously and parks on a condition variable
//! while paused. Protocol handlers mutate the shared state through
//! [`Bridge::update`], which wakes every waiter after the lock is released.
//! Never hold the lock across an `.await` or while evaluating expressions.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct Bridge<S> {
    state: Mutex<S>,
    changed: Condvar,
}

impl<S> Bridge<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    /// Lock for reading or a mutation that wakes nobody
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the state, then notify all waiters
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = {
            let mut state = self.lock();
            f(&mut state)
        };
        self.changed.notify_all();
        result
    }

    /// Block the calling thread until `ready` holds
    pub fn wait_until(&self, mut ready: impl FnMut(&S) -> bool) {
        let guard = self.lock();
        let _guard = self
            .changed
            .wait_while(guard, |state| !ready(state))
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`Bridge::wait_until`] with an upper bound; returns whether `ready` held
    pub fn wait_until_timeout(&self, timeout: Duration, mut ready: impl FnMut(&S) -> bool) -> bool {
        let guard = self.lock();
        let (_guard, result) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !ready(state))
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }
}
