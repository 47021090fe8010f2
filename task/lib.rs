// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Checkpointed task execution for intermittently-powered devices.
//!
//! A task is a unit of resumable work: a plain function, registered
//! under a stable [`TaskId`], that runs to completion and returns a
//! [`Transition`] naming the task to run next. The [`Machine`] drives
//! tasks as a trampoline: it reads the committed checkpoint, runs the
//! named task's body, then durably commits the hand-off — the body's
//! staged nonvolatile writes and the new checkpoint land in a single
//! atomic swap.
//!
//! ## Crash resumption
//!
//! Because a body's durable writes only become visible at the hand-off,
//! losing power anywhere inside a body simply re-runs that body from
//! its start after reboot, against exactly the state it first observed.
//! Task bodies therefore need no crash handling of their own; they only
//! have to keep their durable writes inside the store's staging
//! discipline.
//!
//! ## Identity, not pointers
//!
//! The durable checkpoint names tasks by [`TaskId`], never by function
//! pointer, so a record written before a reboot remains meaningful in
//! the next boot's address space. A [`TaskRef`] additionally carries
//! the interrupt-handler tag as an explicit variant, preserving the
//! untag-before-use contract without bit-stuffing.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

mod machine;

pub use machine::{Machine, Step};

use nvmem::PowerFailure;

/// The maximum number of registered tasks.
///
pub const MAX_TASKS: usize = 16;

/// Uniquely identifies a registered task.
///
/// Task ids are stable across reboots, which is what allows them to be
/// stored in nonvolatile checkpoints.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u8);

impl TaskId {
    /// Returns a task id if within the range [0, [`MAX_TASKS`]), or
    /// None otherwise.
    ///
    pub const fn new(id: u8) -> Option<TaskId> {
        if (id as usize) < MAX_TASKS {
            Some(TaskId(id))
        } else {
            None
        }
    }

    /// Returns a task id if within the range [0, [`MAX_TASKS`]), or
    /// panics otherwise.
    ///
    pub const fn new_unsafe(id: u8) -> TaskId {
        if (id as usize) >= MAX_TASKS {
            panic!("task id out of range");
        }

        TaskId(id)
    }

    /// Returns a numerical representation for the task id.
    ///
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the task id as a registry index.
    ///
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// A durable reference to a task, carrying the interrupt-handler tag
/// as an explicit variant.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskRef {
    /// An ordinary task.
    Normal(TaskId),

    /// A task running as an interrupt handler.
    Interrupt(TaskId),
}

impl TaskRef {
    /// Returns the referenced task's id, dropping any tag.
    ///
    pub const fn id(self) -> TaskId {
        match self {
            TaskRef::Normal(id) => id,
            TaskRef::Interrupt(id) => id,
        }
    }

    /// Returns whether the reference carries the handler tag.
    ///
    pub const fn is_interrupt(self) -> bool {
        matches!(self, TaskRef::Interrupt(_))
    }

    /// Returns the same reference with the handler tag set.
    ///
    pub const fn tagged(self) -> TaskRef {
        TaskRef::Interrupt(self.id())
    }

    /// Returns the same reference with the handler tag cleared.
    ///
    pub const fn untagged(self) -> TaskRef {
        TaskRef::Normal(self.id())
    }
}

/// A checkpoint record: the task to resume and the logical time of the
/// hand-off that committed it.
///
/// Logical time is monotonically non-decreasing and advances on every
/// hand-off; the storage layer uses it for staleness checks.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Context {
    pub task: TaskRef,
    pub time: u32,
}

/// What a task body returns: where control goes next.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Hand off to the given task. The hand-off is committed durably
    /// before the task runs.
    To(TaskRef),

    /// Stop the machine. Staged writes are still flushed. This is a
    /// host-side convenience; deployed firmware runs forever.
    Halt,

    /// Power was lost while the body committed durable state. On
    /// hardware the device just dies; in a simulation the body returns
    /// this so the machine stops at the same point, to be recovered
    /// from the surviving image.
    PowerLoss(PowerFailure),

    /// An invariant was violated. The machine stops without committing
    /// anything, exactly as if power had been lost, and surfaces the
    /// violation as a [`Fault`].
    Fatal(&'static str),
}

/// A record the machine can checkpoint into.
///
pub trait Durable: Copy {
    /// Returns the current checkpoint.
    ///
    fn context(&self) -> Context;

    /// Replaces the checkpoint.
    ///
    fn set_context(&mut self, context: Context);
}

/// A task body. Bodies must be ordinary functions so their identity
/// survives reboot; all durable state travels through the machine's
/// store.
///
pub type TaskFn<R, F> = fn(&mut Machine<R, F>) -> Transition;

/// Describes a failed task registration.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterError {
    /// The id is already bound to a body.
    Occupied(TaskId),
}

/// A fixed-capacity registry mapping task ids to task bodies.
///
/// The registry is volatile and rebuilt at every boot; only the ids
/// are durable.
///
#[derive(Clone, Copy)]
pub struct TaskSet<R: Durable, F: nvmem::Flash<R>> {
    entries: [Option<TaskFn<R, F>>; MAX_TASKS],
}

impl<R: Durable, F: nvmem::Flash<R>> TaskSet<R, F> {
    /// Creates an empty registry.
    ///
    pub fn new() -> TaskSet<R, F> {
        TaskSet {
            entries: [None; MAX_TASKS],
        }
    }

    /// Binds a task id to a body.
    ///
    pub fn register(&mut self, id: TaskId, body: TaskFn<R, F>) -> Result<(), RegisterError> {
        if self.entries[id.as_usize()].is_some() {
            return Err(RegisterError::Occupied(id));
        }

        self.entries[id.as_usize()] = Some(body);
        Ok(())
    }

    /// Returns whether the id is bound to a body.
    ///
    pub fn contains(&self, id: TaskId) -> bool {
        self.entries[id.as_usize()].is_some()
    }

    /// Returns the body bound to the id, if any.
    ///
    pub fn get(&self, id: TaskId) -> Option<TaskFn<R, F>> {
        self.entries[id.as_usize()]
    }
}

impl<R: Durable, F: nvmem::Flash<R>> Default for TaskSet<R, F> {
    fn default() -> TaskSet<R, F> {
        TaskSet::new()
    }
}

/// A condition that stops the machine.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Power was lost (only the fault-injection flash produces this;
    /// recover from the surviving image and run again).
    PowerLoss(PowerFailure),

    /// The checkpoint names a task id with no registered body.
    UnknownTask(TaskId),

    /// A task body reported an invariant violation.
    Invariant(&'static str),
}

impl From<PowerFailure> for Fault {
    fn from(failure: PowerFailure) -> Fault {
        Fault::PowerLoss(failure)
    }
}

/// The process-wide diagnostic hook, invoked once per fatal fault so a
/// halt is observable rather than a silent hang.
///
static FAULT_HOOK: spin::Once<fn(&Fault)> = spin::Once::new();

/// Installs the diagnostic fault hook. Only the first call has any
/// effect.
///
pub fn set_fault_hook(hook: fn(&Fault)) {
    FAULT_HOOK.call_once(|| hook);
}

pub(crate) fn report_fault(fault: &Fault) {
    if let Some(hook) = FAULT_HOOK.get() {
        hook(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvmem::RamFlash;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct Record {
        context: Context,
    }

    impl Durable for Record {
        fn context(&self) -> Context {
            self.context
        }

        fn set_context(&mut self, context: Context) {
            self.context = context;
        }
    }

    fn noop(_machine: &mut Machine<Record, RamFlash<Record>>) -> Transition {
        Transition::Halt
    }

    #[test]
    fn task_id_range() {
        assert_eq!(TaskId::new(0), Some(TaskId::new_unsafe(0)));
        assert_eq!(TaskId::new(15).map(|id| id.as_u8()), Some(15));
        assert_eq!(TaskId::new(16), None);
    }

    #[test]
    fn task_ref_tagging() {
        let id = TaskId::new_unsafe(3);
        let normal = TaskRef::Normal(id);
        assert!(!normal.is_interrupt());
        assert!(normal.tagged().is_interrupt());
        assert_eq!(normal.tagged().untagged(), normal);
        assert_eq!(normal.tagged().id(), id);
    }

    #[test]
    fn register_rejects_duplicates() {
        let id = TaskId::new_unsafe(1);
        let mut tasks: TaskSet<Record, RamFlash<Record>> = TaskSet::new();
        assert_eq!(tasks.register(id, noop), Ok(()));
        assert_eq!(tasks.register(id, noop), Err(RegisterError::Occupied(id)));
        assert!(tasks.contains(id));
        assert!(!tasks.contains(TaskId::new_unsafe(2)));
    }
}
