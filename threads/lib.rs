// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Cooperative multithreading for intermittently-powered devices.
//!
//! This crate multiplexes several logical threads of control onto the
//! single-threaded, checkpoint-based [`task::Machine`]. A "context
//! switch" here is a durable record of which thread runs next: every
//! hand-off commits through the nonvolatile store, so an arbitrary
//! power failure leaves the system able to resume with the same
//! forward-progress guarantee the substrate gives a single thread.
//!
//! ## Threads
//!
//! Threads live in a fixed table of [`MAX_NUM_THREADS`] durable slots.
//! The bootstrap code claims slot 0 with [`initialize`], spawns more
//! threads with [`create`], and enters the scheduler with
//! [`start_multithreaded`]. A running thread gives up control only
//! voluntarily — [`yield_to_scheduler`], [`deschedule`], or [`end`] —
//! or when a hardware interrupt arrives through the [`interrupt`]
//! bridge. There is no preemption and no priority; the scheduler task
//! visits active slots round-robin.
//!
//! ## Crash safety
//!
//! The thread table is the one shared mutable resource between
//! threads, and all access goes through the operations in this crate
//! because only they know the required commit ordering. Mutations made
//! while a thread runs are staged in the store and land atomically
//! with the thread's next hand-off, so replaying an interrupted task
//! after reboot observes exactly the state it saw the first time.
//!
//! ## Mutual exclusion
//!
//! The [`mutex`] module provides a minimal lock for application state,
//! built on cooperative descheduling. It protects application data
//! only; the thread table needs no lock because at most one thread
//! ever runs.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

pub mod interrupt;
pub mod mutex;
pub mod scheduler;
pub mod thread;

pub use crate::mutex::{Mutex, TryLock};
pub use crate::scheduler::{install, SCHEDULER_TASK};
pub use crate::thread::{
    active_count, create, current_thread, current_thread_id, deschedule, end, initialize,
    is_active, start_multithreaded, yield_to_scheduler, ThreadId,
};

use crate::interrupt::BridgeState;
use crate::thread::TableState;
use nvmem::{Flash, PowerFailure};
use task::{Context, Durable, Machine, TaskId, TaskRef, TaskSet, Transition};

/// The maximum number of concurrently live threads, including the
/// bootstrap thread.
///
pub const MAX_NUM_THREADS: usize = 4;

/// The durable record for the whole threading subsystem: the
/// substrate checkpoint, the thread table, the interrupt bridge, and
/// the application's own durable state `A`.
///
/// The record is read and written only through the store's staging
/// and commit discipline; a reboot can happen between any two durable
/// writes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NvState<A: Copy> {
    pub(crate) checkpoint: Context,
    pub(crate) table: TableState,
    pub(crate) bridge: BridgeState,

    /// Application durable state.
    pub app: A,
}

impl<A: Copy> NvState<A> {
    /// Creates the first-boot record. `entry` is the bootstrap task
    /// the machine starts executing.
    ///
    pub fn new(entry: TaskId, app: A) -> NvState<A> {
        NvState {
            checkpoint: Context {
                task: TaskRef::Normal(entry),
                time: 0,
            },
            table: TableState::new(),
            bridge: BridgeState::new(),
            app,
        }
    }
}

impl<A: Copy> Durable for NvState<A> {
    fn context(&self) -> Context {
        self.checkpoint
    }

    fn set_context(&mut self, context: Context) {
        self.checkpoint = context;
    }
}

/// Describes an error from a thread control operation.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Every slot in the thread table is active. Recoverable: the
    /// caller can retry after some thread ends.
    CapacityExceeded,

    /// The operation referenced a task with no registered body.
    InvalidHandle,

    /// Power was lost before a durable write landed (fault-injection
    /// backends only).
    PowerLoss(PowerFailure),
}

impl From<PowerFailure> for Error {
    fn from(failure: PowerFailure) -> Error {
        Error::PowerLoss(failure)
    }
}

impl From<Error> for Transition {
    /// Converts an operation failure into the transition a task body
    /// should return: simulated power loss stops the machine as a
    /// brown-out would, and programming errors stop it fatally.
    ///
    fn from(error: Error) -> Transition {
        match error {
            Error::PowerLoss(failure) => Transition::PowerLoss(failure),
            Error::CapacityExceeded => Transition::Fatal("thread capacity exceeded"),
            Error::InvalidHandle => Transition::Fatal("operation on an invalid handle"),
        }
    }
}

/// Rebuilds the machine from the committed image after a reboot and
/// performs the bridge bookkeeping a reboot implies: if the crash
/// happened inside an interrupt handler, the return path must skip
/// the platform stack fixup it already performed.
///
pub fn recover<A: Copy, F: Flash<NvState<A>>>(
    flash: F,
    tasks: TaskSet<NvState<A>, F>,
) -> Result<Machine<NvState<A>, F>, Error> {
    let mut machine = Machine::recover(flash, tasks);
    interrupt::note_reboot(machine.store_mut())?;
    Ok(machine)
}
