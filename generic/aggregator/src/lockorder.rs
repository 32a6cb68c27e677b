// SPDX-License-Identifier: MPL-2.0

//! Mutexes tagged with their position in the lock hierarchy.
//!
//! Locks must always be taken top to bottom in the order of [`LockLevel`]. In debug builds
//! every acquisition is checked against the levels already held by the current thread.

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockLevel {
    /// Serializes data and serialized events from one producer.
    PadStream,
    /// Serializes a flush-start against a chain on the same input.
    PadFlush,
    /// Owns the output thread's join handle.
    Task,
    /// Serializes everything pushed on the output.
    SrcStream,
    /// Output thread state and its condition variable.
    Src,
    /// Element state: settings, pads, segment, caps.
    Object,
    /// Per-input queue and its condition variable. Several pads may be held together.
    PadData,
    /// Per-input segment.
    PadObject,
    JitterBufferState,
    Queue,
}

impl LockLevel {
    fn allows_siblings(self) -> bool {
        matches!(self, LockLevel::PadData)
    }
}

#[cfg(debug_assertions)]
mod held {
    use super::LockLevel;
    use smallvec::SmallVec;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<SmallVec<[LockLevel; 8]>> = RefCell::new(SmallVec::new());
    }

    pub(super) fn acquire(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(max) = held.iter().max() {
                assert!(
                    *max < level || (*max == level && level.allows_siblings()),
                    "lock order violation: taking {level:?} while holding {held:?}",
                );
            }
            held.push(level);
        });
    }

    pub(super) fn release(level: LockLevel) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(idx) = held.iter().rposition(|l| *l == level) {
                held.remove(idx);
            }
        });
    }
}

#[cfg(not(debug_assertions))]
mod held {
    use super::LockLevel;

    #[inline(always)]
    pub(super) fn acquire(_level: LockLevel) {}

    #[inline(always)]
    pub(super) fn release(_level: LockLevel) {}
}

#[derive(Debug)]
pub(crate) struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub(crate) fn new(level: LockLevel, value: T) -> Self {
        OrderedMutex {
            level,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> OrderedGuard<'_, T> {
        held::acquire(self.level);
        OrderedGuard {
            level: self.level,
            guard: self.inner.lock(),
        }
    }
}

pub(crate) struct OrderedGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> OrderedGuard<'_, T> {
    pub(crate) fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.guard);
    }

    pub(crate) fn wait_until(&mut self, cond: &Condvar, deadline: Instant) -> WaitTimeoutResult {
        cond.wait_until(&mut self.guard, deadline)
    }

    /// Runs `f` with the lock temporarily released.
    pub(crate) fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        held::release(self.level);
        let ret = MutexGuard::unlocked(&mut self.guard, f);
        held::acquire(self.level);
        ret
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        held::release(self.level);
    }
}
