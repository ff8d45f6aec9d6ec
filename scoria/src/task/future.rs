//! Observation side of a task: readiness and the produced value.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::sync::Backoff;

use super::TaskState;

/// A shared view of a task's completion state and its result.
///
/// Ready exactly when the task has returned (`latch == 0`), from the
/// point of view of any observing thread. Cloneable; the value itself
/// can be taken once, by [`get`](Future::get).
pub struct Future<R> {
    state: Arc<TaskState>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for Future<R> {
    fn clone(&self) -> Self {
        Future {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R> Future<R> {
    pub(crate) fn new(state: Arc<TaskState>) -> Future<R> {
        Future {
            state,
            _marker: PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_complete()
    }

    /// Spins (with backoff) until the task has returned. Prefer
    /// [`Executor::join`](super::Executor::join), which helps drain the
    /// ready queue instead of waiting idle.
    pub fn wait(&self) {
        let mut backoff = Backoff::default();
        while !self.is_ready() {
            backoff.snooze();
        }
    }
}

impl<R: 'static> Future<R> {
    /// Waits for completion and takes the value.
    ///
    /// Panics if the value was already taken through another clone of
    /// this future.
    pub fn get(self) -> R {
        self.wait();
        let boxed = self
            .state
            .take_value()
            .expect("future value already taken");
        *boxed.downcast::<R>().expect("future value type mismatch")
    }
}
