// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Mutual exclusion between threads contending for one lock.

use nvmem::RamFlash;
use task::{Machine, TaskId, TaskSet, Transition};
use threads::{Mutex, NvState, TryLock, MAX_NUM_THREADS};

const MAIN: TaskId = TaskId::new_unsafe(1);
const CONTEND: TaskId = TaskId::new_unsafe(2);
const MAIN_LOOP: TaskId = TaskId::new_unsafe(3);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct App {
    mutex: Mutex,
    phase: [u8; MAX_NUM_THREADS],
    holders: u8,
    max_holders: u8,
    done: u8,
}

const APP: App = App {
    mutex: Mutex::new(),
    phase: [0; MAX_NUM_THREADS],
    holders: 0,
    max_holders: 0,
    done: 0,
};

type M = Machine<NvState<App>, RamFlash<NvState<App>>>;

fn main_task(machine: &mut M) -> Transition {
    if let Err(error) = threads::initialize(machine) {
        return error.into();
    }
    if let Err(error) = threads::create(machine, CONTEND) {
        return error.into();
    }
    if let Err(error) = threads::create(machine, CONTEND) {
        return error.into();
    }

    threads::start_multithreaded(machine, MAIN_LOOP)
}

/// Each contender acquires the lock, holds it across one full
/// scheduler round, then releases and ends. A failed acquisition spins
/// via deschedule, as the lock's contract prescribes.
///
fn contend(machine: &mut M) -> Transition {
    let id = threads::current_thread_id(machine);
    let app = machine.store().state().app;
    match app.phase[id.as_usize()] {
        0 => {
            let mut mutex = app.mutex;
            if mutex.try_acquire(id) {
                machine.store_mut().stage_with(|record| {
                    record.app.mutex = mutex;
                    record.app.phase[id.as_usize()] = 1;
                    record.app.holders += 1;
                    record.app.max_holders = record.app.max_holders.max(record.app.holders);
                });
            }
            threads::deschedule(machine)
        }
        1 => {
            assert_eq!(app.mutex.holder(), Some(id));
            machine
                .store_mut()
                .stage_with(|record| record.app.phase[id.as_usize()] = 2);
            threads::deschedule(machine)
        }
        _ => {
            let mut mutex = app.mutex;
            mutex.release();
            machine.store_mut().stage_with(|record| {
                record.app.mutex = mutex;
                record.app.holders -= 1;
                record.app.done += 1;
            });
            threads::end(machine)
        }
    }
}

fn main_loop(machine: &mut M) -> Transition {
    if machine.store().state().app.done == 2 {
        return Transition::Halt;
    }

    threads::deschedule(machine)
}

fn tasks() -> TaskSet<NvState<App>, RamFlash<NvState<App>>> {
    let mut tasks = TaskSet::new();
    threads::install(&mut tasks).unwrap();
    tasks.register(MAIN, main_task).unwrap();
    tasks.register(CONTEND, contend).unwrap();
    tasks.register(MAIN_LOOP, main_loop).unwrap();
    tasks
}

#[test]
fn contended_lock_serializes_critical_sections() {
    let initial = NvState::new(MAIN, APP);
    let mut machine = Machine::first_boot(RamFlash::new(initial), tasks(), initial).unwrap();
    machine.run().unwrap();

    let app = machine.store().committed_state().app;
    assert_eq!(app.done, 2);
    assert_eq!(app.max_holders, 1);
    assert_eq!(app.mutex.holder(), None);
    assert_eq!(threads::active_count(&machine), 1);
}
