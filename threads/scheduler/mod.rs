// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The scheduler task: round-robin dispatch over the thread table.
//!
//! The scheduler is not special to the substrate. It is an ordinary
//! task, registered under [`SCHEDULER_TASK`] and dispatched through
//! the same transition primitive as everything else, so a crash during
//! dispatch simply re-executes dispatch from its start after reboot.
//! Dispatch therefore performs no non-idempotent side effect before
//! its final atomic hand-off.
//!
//! Fairness is round-robin and strictly cooperative: a thread that
//! never yields starves the others, and that is the caller's
//! responsibility, not a scheduler failure.

use crate::thread::{current_field, free_count_field, free_mask_field, slot_field};
use crate::{NvState, MAX_NUM_THREADS};
use log::{error, trace};
use nvmem::Flash;
use task::{Machine, RegisterError, TaskId, TaskRef, TaskSet, Transition};

/// The task id the scheduler is registered under.
///
pub const SCHEDULER_TASK: TaskId = TaskId::new_unsafe(0);

/// The scheduler's durable task reference.
///
pub(crate) const SCHEDULER_REF: TaskRef = TaskRef::Normal(SCHEDULER_TASK);

/// Registers the scheduler task. Call once while building the task
/// set, before booting the machine.
///
pub fn install<A: Copy, F: Flash<NvState<A>>>(
    tasks: &mut TaskSet<NvState<A>, F>,
) -> Result<(), RegisterError> {
    tasks.register(SCHEDULER_TASK, dispatch)
}

/// The scheduler task body.
///
/// One pass over the table rebuilds the free-slot cache, then a linear
/// probe with wraparound from the slot after the current one finds the
/// next active thread. The new current index is staged and commits
/// atomically with the hand-off to that thread's recorded task.
///
/// Zero active slots is a fatal invariant violation: at minimum the
/// thread that entered the scheduler must have been active, so an
/// empty table means the last thread ended with nothing left to run.
/// It is surfaced as a hard stop, never an infinite scan.
///
pub(crate) fn dispatch<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
) -> Transition {
    // Rebuild the free-slot cache, bounding its staleness to one
    // scheduler round.
    let mut mask = 0u8;
    let mut free = 0u8;
    for index in 0..MAX_NUM_THREADS {
        if !machine.store().read(slot_field(index)).active {
            mask |= 1 << index;
            free += 1;
        }
    }
    machine.store_mut().stage(free_mask_field(), mask);
    machine.store_mut().stage(free_count_field(), free);

    let current = machine.store().read(current_field()) as usize;
    for offset in 1..=MAX_NUM_THREADS {
        let index = (current + offset) % MAX_NUM_THREADS;
        let slot = machine.store().read(slot_field(index));
        if slot.active {
            machine.store_mut().stage(current_field(), index as u8);
            trace!("dispatch: thread {} resumes {:?}", index, slot.context.task);
            return Transition::To(slot.context.task);
        }
    }

    error!("dispatch: no active thread left to run");
    Transition::Fatal("no active thread left to run")
}
