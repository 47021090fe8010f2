// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The durable thread table and the thread control operations.
//!
//! ## The table
//!
//! Threads occupy fixed slots in nonvolatile storage. A slot's
//! `active` bit is the authoritative record of liveness; the free-slot
//! cache carried alongside is derived and rebuilt once per scheduler
//! pass, so it is never more than one round stale.
//!
//! ## Commit ordering
//!
//! Operations called from a running thread stage their table writes;
//! the writes become durable atomically with the thread's hand-off to
//! the scheduler. [`initialize`] is the exception: it runs once at
//! first boot and commits each slot write independently, so a crash
//! mid-initialization converges by re-running the remaining idempotent
//! assignments.

use crate::scheduler::SCHEDULER_REF;
use crate::{Error, NvState, MAX_NUM_THREADS};
use log::{debug, trace};
use nvmem::{FieldRef, Flash};
use task::{Context, Machine, TaskId, TaskRef, Transition};

/// The free-slot cache bits for a table with every slot free.
///
const ALL_FREE: u8 = (1 << MAX_NUM_THREADS) - 1;

/// Uniquely identifies an active thread's slot.
///
/// Thread ids are stable for the slot's lifetime while it is active.
/// They are not globally unique across the program's lifetime: a slot
/// freed by [`end`] can be reused by a later [`create`].
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ThreadId(pub(crate) u8);

impl ThreadId {
    /// Returns a thread id if within the range [0, [`MAX_NUM_THREADS`]),
    /// or None otherwise.
    ///
    pub const fn new(id: u8) -> Option<ThreadId> {
        if (id as usize) < MAX_NUM_THREADS {
            Some(ThreadId(id))
        } else {
            None
        }
    }

    /// Returns a thread id if within the range [0, [`MAX_NUM_THREADS`]),
    /// or panics otherwise.
    ///
    pub const fn new_unsafe(id: u8) -> ThreadId {
        if (id as usize) >= MAX_NUM_THREADS {
            panic!("thread id out of range");
        }

        ThreadId(id)
    }

    /// Returns a numerical representation for the thread id.
    ///
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the thread id as a table index.
    ///
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// One entry in the thread table.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Slot {
    pub id: ThreadId,
    pub context: Context,
    pub active: bool,
}

/// The durable thread table: the slots, the index of the slot whose
/// context is presently executing, and the derived free-slot cache.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TableState {
    pub slots: [Slot; MAX_NUM_THREADS],
    pub current: u8,
    pub free_mask: u8,
    pub free_count: u8,
    pub initialised: bool,
}

impl TableState {
    pub(crate) fn new() -> TableState {
        let mut slots = [Slot {
            id: ThreadId(0),
            context: Context {
                task: SCHEDULER_REF,
                time: 0,
            },
            active: false,
        }; MAX_NUM_THREADS];

        for (index, slot) in slots.iter_mut().enumerate() {
            slot.id = ThreadId(index as u8);
        }

        TableState {
            slots,
            current: 0,
            free_mask: ALL_FREE,
            free_count: MAX_NUM_THREADS as u8,
            initialised: false,
        }
    }
}

// Typed handles for the table's durable fields.

pub(crate) fn slot_field<A: Copy>(index: usize) -> FieldRef<NvState<A>, Slot> {
    FieldRef::indexed(index, |s, i| s.table.slots[i], |s, i, v| s.table.slots[i] = v)
}

pub(crate) fn current_field<A: Copy>() -> FieldRef<NvState<A>, u8> {
    FieldRef::new(|s, _| s.table.current, |s, _, v| s.table.current = v)
}

pub(crate) fn free_mask_field<A: Copy>() -> FieldRef<NvState<A>, u8> {
    FieldRef::new(|s, _| s.table.free_mask, |s, _, v| s.table.free_mask = v)
}

pub(crate) fn free_count_field<A: Copy>() -> FieldRef<NvState<A>, u8> {
    FieldRef::new(|s, _| s.table.free_count, |s, _, v| s.table.free_count = v)
}

pub(crate) fn initialised_field<A: Copy>() -> FieldRef<NvState<A>, bool> {
    FieldRef::new(|s, _| s.table.initialised, |s, _, v| s.table.initialised = v)
}

fn assert_initialised<A: Copy, F: Flash<NvState<A>>>(machine: &Machine<NvState<A>, F>) {
    if !machine.store().read(initialised_field()) {
        panic!("thread table used before initialize");
    }
}

/// Initializes the thread table at true first boot, reserving slot 0
/// for the calling (bootstrap) thread with its current context.
///
/// Every slot write is an independently committed, idempotent
/// assignment: a crash mid-initialization converges by re-running the
/// remaining writes, and re-entry after the final commit is a no-op.
/// Call this at the top of the bootstrap task, before staging any
/// other durable writes.
///
pub fn initialize<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
) -> Result<(), Error> {
    if machine.store().read(initialised_field()) {
        return Ok(());
    }

    let context = machine.context();
    let boot = Slot {
        id: ThreadId(0),
        context: Context {
            task: context.task.untagged(),
            time: context.time,
        },
        active: true,
    };
    machine.store_mut().commit(slot_field(0), boot)?;

    for index in 1..MAX_NUM_THREADS {
        let mut slot = machine.store().read(slot_field(index));
        slot.active = false;
        machine.store_mut().commit(slot_field(index), slot)?;
    }

    machine.store_mut().commit(current_field(), 0)?;
    machine.store_mut().commit(free_mask_field(), ALL_FREE & !1)?;
    machine
        .store_mut()
        .commit(free_count_field(), MAX_NUM_THREADS as u8 - 1)?;
    machine.store_mut().commit(initialised_field(), true)?;

    debug!("thread table initialized; bootstrap thread in slot 0");
    Ok(())
}

/// Creates a new thread running the given task, returning its id.
///
/// The free-slot cache accelerates the search, but the authoritative
/// active bits have the final say: a cache made stale by activity
/// since the last scheduler pass falls back to a full scan. Fails with
/// [`Error::CapacityExceeded`] when every slot is active — a
/// recoverable condition the caller must check — and with
/// [`Error::InvalidHandle`] when the task has no registered body.
///
/// The slot write is staged; it becomes durable with the calling
/// thread's next hand-off.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn create<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
    task: TaskId,
) -> Result<ThreadId, Error> {
    assert_initialised(machine);
    if !machine.tasks().contains(task) {
        return Err(Error::InvalidHandle);
    }

    let mask = machine.store().read(free_mask_field());
    let mut choice = None;
    for index in 0..MAX_NUM_THREADS {
        if mask & (1 << index) != 0 && !machine.store().read(slot_field(index)).active {
            choice = Some(index);
            break;
        }
    }
    if choice.is_none() {
        // The cache may be stale; the active bits are authoritative.
        for index in 0..MAX_NUM_THREADS {
            if !machine.store().read(slot_field(index)).active {
                choice = Some(index);
                break;
            }
        }
    }

    let index = match choice {
        Some(index) => index,
        None => return Err(Error::CapacityExceeded),
    };

    let slot = Slot {
        id: ThreadId(index as u8),
        context: Context {
            task: TaskRef::Normal(task),
            time: 0,
        },
        active: true,
    };
    machine.store_mut().stage(slot_field(index), slot);
    machine.store_mut().stage(free_mask_field(), mask & !(1 << index));
    let free = machine.store().read(free_count_field());
    machine
        .store_mut()
        .stage(free_count_field(), free.saturating_sub(1));

    debug!("created thread {} running task {}", index, task.as_u8());
    Ok(ThreadId(index as u8))
}

/// Ends the calling thread: deactivates its own slot and hands
/// control to the scheduler. The slot becomes reusable by a future
/// [`create`]. A thread cannot end a different thread.
///
/// The returned transition must be returned from the task body; the
/// thread never resumes.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn end<A: Copy, F: Flash<NvState<A>>>(machine: &mut Machine<NvState<A>, F>) -> Transition {
    assert_initialised(machine);

    let index = machine.store().read(current_field()) as usize;
    let mut slot = machine.store().read(slot_field(index));
    slot.active = false;
    machine.store_mut().stage(slot_field(index), slot);

    let mask = machine.store().read(free_mask_field());
    machine.store_mut().stage(free_mask_field(), mask | (1 << index));
    let free = machine.store().read(free_count_field());
    machine
        .store_mut()
        .stage(free_count_field(), free.saturating_add(1));

    debug!("thread {} ended", index);
    Transition::To(SCHEDULER_REF)
}

/// Returns the calling thread's context. Pure read; no side effects.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn current_thread<A: Copy, F: Flash<NvState<A>>>(
    machine: &Machine<NvState<A>, F>,
) -> Context {
    assert_initialised(machine);
    let index = machine.store().read(current_field()) as usize;
    machine.store().read(slot_field(index)).context
}

/// Returns the calling thread's id. Pure read; no side effects.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn current_thread_id<A: Copy, F: Flash<NvState<A>>>(
    machine: &Machine<NvState<A>, F>,
) -> ThreadId {
    assert_initialised(machine);
    let index = machine.store().read(current_field()) as usize;
    machine.store().read(slot_field(index)).id
}

/// Yields control to the scheduler, recording `next` as the task the
/// calling thread resumes at. This is the only path by which a running
/// thread gives up control without terminating.
///
/// The slot write and the hand-off commit in the same atomic swap, so
/// a crash can never resume into the scheduler with stale slot data.
/// The returned transition must be returned from the task body.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn yield_to_scheduler<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
    next: TaskId,
) -> Transition {
    assert_initialised(machine);
    if !machine.tasks().contains(next) {
        return Transition::Fatal("yield to a task with no registered body");
    }

    let index = machine.store().read(current_field()) as usize;
    let mut slot = machine.store().read(slot_field(index));
    slot.context = Context {
        task: TaskRef::Normal(next),
        time: slot.context.time.wrapping_add(1),
    };
    machine.store_mut().stage(slot_field(index), slot);

    trace!("thread {} yields, resuming at task {}", index, next.as_u8());
    Transition::To(SCHEDULER_REF)
}

/// Re-enqueues the calling thread to run its current task again after
/// one scheduler round-trip. Used for spin-style waiting, such as
/// mutex contention.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn deschedule<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
) -> Transition {
    let task = machine.context().task.id();
    yield_to_scheduler(machine, task)
}

/// Hands the bootstrap thread over to the scheduler, recording `next`
/// as the task it resumes at. Call once, after [`initialize`] and any
/// initial [`create`]s; from here on the scheduler owns the flow of
/// execution.
///
/// # Panics
///
/// Panics if called before [`initialize`].
///
pub fn start_multithreaded<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
    next: TaskId,
) -> Transition {
    yield_to_scheduler(machine, next)
}

/// Returns the number of active slots. Diagnostic read.
///
pub fn active_count<A: Copy, F: Flash<NvState<A>>>(machine: &Machine<NvState<A>, F>) -> usize {
    (0..MAX_NUM_THREADS)
        .filter(|&index| machine.store().read(slot_field(index)).active)
        .count()
}

/// Returns whether the given thread's slot is active. Diagnostic read.
///
pub fn is_active<A: Copy, F: Flash<NvState<A>>>(
    machine: &Machine<NvState<A>, F>,
    thread: ThreadId,
) -> bool {
    machine.store().read(slot_field(thread.as_usize())).active
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_range() {
        assert_eq!(ThreadId::new(0), Some(ThreadId(0)));
        assert_eq!(ThreadId::new(3).map(|id| id.as_u8()), Some(3));
        assert_eq!(ThreadId::new(4), None);
    }

    #[test]
    fn new_table_is_empty_and_uninitialised() {
        let table = TableState::new();
        assert!(!table.initialised);
        assert_eq!(table.current, 0);
        assert_eq!(table.free_mask, ALL_FREE);
        assert_eq!(table.free_count as usize, MAX_NUM_THREADS);
        for (index, slot) in table.slots.iter().enumerate() {
            assert!(!slot.active);
            assert_eq!(slot.id.as_usize(), index);
        }
    }
}
