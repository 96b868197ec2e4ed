//! Critical section over kernel state.
//!
//! Masking interrupts is modelled as holding one lock. The section is not
//! reentrant: entering it twice on the same host thread is a bug and panics
//! instead of deadlocking.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard; leaves the section when dropped.
pub struct CriticalSection<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<'a, T> CriticalSection<'a, T> {
    /// Enters the section protecting `state`.
    ///
    /// # Panics
    ///
    /// If the calling host thread is already inside a section.
    pub fn enter(state: &'a Mutex<T>) -> Self {
        DEPTH.with(|depth| {
            assert_eq!(depth.get(), 0, "critical sections must not nest");
            depth.set(1);
        });
        Self {
            guard: state.lock(),
        }
    }

    /// Checks whether the calling host thread is inside a section.
    pub fn is_active() -> bool {
        DEPTH.with(|depth| depth.get() > 0)
    }
}

impl<T> Deref for CriticalSection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CriticalSection<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for CriticalSection<'_, T> {
    fn drop(&mut self) {
        DEPTH.with(|depth| {
            assert!(depth.get() > 0, "critical section underflow");
            depth.set(0);
        });
    }
}
