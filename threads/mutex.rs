// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A minimal mutual-exclusion primitive for application durable state.
//!
//! The mutex is a plain `Copy` value the application embeds in its own
//! durable record; acquiring and releasing it are staged writes like
//! any other. Contention is handled by cooperative spinning: a thread
//! that fails [`TryLock::try_acquire`] should [`deschedule`][crate::deschedule]
//! and retry when the scheduler revisits it. Correctness depends on
//! the scheduler eventually revisiting the waiter and the holder
//! eventually releasing; there is no fairness or starvation guarantee.
//!
//! The [`TryLock`] trait isolates this busy-wait design so a blocking
//! queue implementation can replace it without touching callers.

use crate::thread::ThreadId;
use crate::MAX_NUM_THREADS;

/// The holder value meaning "no thread".
///
const NO_HOLDER: u8 = MAX_NUM_THREADS as u8 + 1;

/// A lock that can be attempted without blocking.
///
pub trait TryLock {
    /// Attempts to take the lock for `owner`, returning whether it is
    /// now held by `owner`. A lock already held by `owner` reports
    /// success without counting nested acquisitions.
    ///
    fn try_acquire(&mut self, owner: ThreadId) -> bool;

    /// Releases the lock.
    ///
    fn release(&mut self);
}

/// A spin-style mutex for serializing access to shared application
/// state across threads.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mutex {
    locked: bool,
    holder: u8,
}

impl Mutex {
    /// Creates an unlocked mutex.
    ///
    pub const fn new() -> Mutex {
        Mutex {
            locked: false,
            holder: NO_HOLDER,
        }
    }

    /// Returns the holding thread, if the mutex is locked.
    ///
    pub fn holder(&self) -> Option<ThreadId> {
        if self.locked {
            ThreadId::new(self.holder)
        } else {
            None
        }
    }

    /// Destroys the lock state: clears all metadata. Threads waiting
    /// on the mutex are not notified; they observe it unlocked on
    /// their next poll.
    ///
    pub fn reset(&mut self) {
        self.locked = false;
        self.holder = NO_HOLDER;
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

impl TryLock for Mutex {
    fn try_acquire(&mut self, owner: ThreadId) -> bool {
        if self.locked && self.holder != owner.as_u8() {
            return false;
        }

        self.locked = true;
        self.holder = owner.as_u8();
        true
    }

    /// Unlocks unconditionally. The caller is not verified to be the
    /// holder; that discipline is the caller's contract, and callers
    /// wanting it checked must enforce it themselves.
    ///
    fn release(&mut self) {
        self.locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ThreadId = ThreadId::new_unsafe(1);
    const T2: ThreadId = ThreadId::new_unsafe(2);

    #[test]
    fn acquire_and_contend() {
        let mut mutex = Mutex::new();
        assert_eq!(mutex.holder(), None);

        assert!(mutex.try_acquire(T1));
        assert_eq!(mutex.holder(), Some(T1));
        assert!(!mutex.try_acquire(T2));

        mutex.release();
        assert_eq!(mutex.holder(), None);
        assert!(mutex.try_acquire(T2));
        assert_eq!(mutex.holder(), Some(T2));
    }

    #[test]
    fn reacquire_by_holder_is_already_held() {
        let mut mutex = Mutex::new();
        assert!(mutex.try_acquire(T1));
        assert!(mutex.try_acquire(T1));
        assert_eq!(mutex.holder(), Some(T1));

        // No nesting count: one release fully unlocks.
        mutex.release();
        assert_eq!(mutex.holder(), None);
    }

    #[test]
    fn release_does_not_check_the_caller() {
        let mut mutex = Mutex::new();
        assert!(mutex.try_acquire(T1));

        // Any caller may release; the weak contract is deliberate.
        mutex.release();
        assert!(mutex.try_acquire(T2));
    }

    #[test]
    fn reset_clears_metadata() {
        let mut mutex = Mutex::new();
        assert!(mutex.try_acquire(T1));
        mutex.reset();
        assert_eq!(mutex, Mutex::new());
        assert!(mutex.try_acquire(T2));
    }
}
