// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The trampoline that drives checkpointed tasks.

use crate::{report_fault, Context, Durable, Fault, TaskRef, TaskSet, Transition};
use log::error;
use nvmem::{Flash, Store};

/// The outcome of one trampoline iteration.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// A task ran and its hand-off was committed.
    Ran,

    /// A task asked the machine to stop.
    Halted,
}

/// Owns the durable store and the task registry, and multiplexes the
/// processor between tasks.
///
/// The machine is rebuilt from the flash image at every boot; nothing
/// in it is durable except through the store.
///
pub struct Machine<R: Durable, F: Flash<R>> {
    store: Store<R, F>,
    tasks: TaskSet<R, F>,
}

impl<R: Durable, F: Flash<R>> Machine<R, F> {
    /// Creates a machine at true first boot, seeding the flash with
    /// `initial`. The initial checkpoint must name a registered task.
    ///
    pub fn first_boot(flash: F, tasks: TaskSet<R, F>, initial: R) -> Result<Machine<R, F>, Fault> {
        let entry = initial.context().task.id();
        if !tasks.contains(entry) {
            return Err(Fault::UnknownTask(entry));
        }

        let store = Store::first_boot(flash, initial)?;
        Ok(Machine { store, tasks })
    }

    /// Rebuilds a machine from the committed image after a reboot.
    /// Execution re-enters at the committed checkpoint's task.
    ///
    pub fn recover(flash: F, tasks: TaskSet<R, F>) -> Machine<R, F> {
        Machine {
            store: Store::recover(flash),
            tasks,
        }
    }

    /// Returns the presently-executing task's checkpoint record.
    ///
    pub fn context(&self) -> Context {
        self.store.state().context()
    }

    /// Returns the durable store.
    ///
    pub fn store(&self) -> &Store<R, F> {
        &self.store
    }

    /// Returns the durable store mutably.
    ///
    pub fn store_mut(&mut self) -> &mut Store<R, F> {
        &mut self.store
    }

    /// Returns the task registry.
    ///
    pub fn tasks(&self) -> &TaskSet<R, F> {
        &self.tasks
    }

    /// Consumes the machine, returning the backing flash. Used by
    /// crash tests to reboot from the surviving image.
    ///
    pub fn into_flash(self) -> F {
        self.store.into_flash()
    }

    /// Runs one trampoline iteration: the committed checkpoint's task
    /// body, then the durable hand-off it requested.
    ///
    /// The body's staged writes and the new checkpoint become durable
    /// in the same atomic swap, so a crash anywhere in between replays
    /// the body against the state it first observed.
    ///
    pub fn step(&mut self) -> Result<Step, Fault> {
        let context = self.context();
        let body = self
            .tasks
            .get(context.task.id())
            .ok_or_else(|| Fault::UnknownTask(context.task.id()))?;

        match body(self) {
            Transition::To(next) => {
                self.commit_handoff(next)?;
                Ok(Step::Ran)
            }
            Transition::Halt => {
                self.store.flush()?;
                Ok(Step::Halted)
            }
            Transition::PowerLoss(failure) => Err(Fault::PowerLoss(failure)),
            Transition::Fatal(message) => Err(Fault::Invariant(message)),
        }
    }

    /// Steps until a task halts the machine or a fault stops it. Fatal
    /// faults are reported through the diagnostic hook before being
    /// returned, so a stopped machine is observable.
    ///
    pub fn run(&mut self) -> Result<(), Fault> {
        loop {
            match self.step() {
                Ok(Step::Ran) => {}
                Ok(Step::Halted) => return Ok(()),
                Err(fault) => {
                    if let Fault::Invariant(message) = fault {
                        error!("machine stopped: {}", message);
                    }
                    report_fault(&fault);
                    return Err(fault);
                }
            }
        }
    }

    fn commit_handoff(&mut self, next: TaskRef) -> Result<(), Fault> {
        if !self.tasks.contains(next.id()) {
            return Err(Fault::UnknownTask(next.id()));
        }

        let time = self.context().time.wrapping_add(1);
        self.store.stage_with(|record| {
            record.set_context(Context { task: next, time });
        });
        self.store.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskId;
    use nvmem::{CrashFlash, RamFlash};

    const PING: TaskId = TaskId::new_unsafe(1);
    const PONG: TaskId = TaskId::new_unsafe(2);

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct Record {
        context: Context,
        count: u32,
    }

    impl Durable for Record {
        fn context(&self) -> Context {
            self.context
        }

        fn set_context(&mut self, context: Context) {
            self.context = context;
        }
    }

    fn initial() -> Record {
        Record {
            context: Context {
                task: TaskRef::Normal(PING),
                time: 0,
            },
            count: 0,
        }
    }

    fn ping<F: Flash<Record>>(machine: &mut Machine<Record, F>) -> Transition {
        machine.store_mut().stage_with(|r| r.count += 1);
        if machine.store().state().count >= 6 {
            return Transition::Halt;
        }
        Transition::To(TaskRef::Normal(PONG))
    }

    fn pong<F: Flash<Record>>(_machine: &mut Machine<Record, F>) -> Transition {
        Transition::To(TaskRef::Normal(PING))
    }

    fn tasks<F: Flash<Record>>() -> TaskSet<Record, F> {
        let mut tasks = TaskSet::new();
        tasks.register(PING, ping).unwrap();
        tasks.register(PONG, pong).unwrap();
        tasks
    }

    #[test]
    fn trampoline_runs_to_halt() {
        let mut machine =
            Machine::first_boot(RamFlash::new(initial()), tasks(), initial()).unwrap();
        machine.run().unwrap();
        assert_eq!(machine.store().committed_state().count, 6);
    }

    #[test]
    fn logical_time_advances_on_every_handoff() {
        let mut machine =
            Machine::first_boot(RamFlash::new(initial()), tasks(), initial()).unwrap();
        machine.step().unwrap();
        assert_eq!(machine.context().time, 1);
        machine.step().unwrap();
        assert_eq!(machine.context().time, 2);
    }

    #[test]
    fn unregistered_entry_task_is_rejected() {
        let mut tasks: TaskSet<Record, RamFlash<Record>> = TaskSet::new();
        tasks.register(PONG, pong).unwrap();
        let result = Machine::first_boot(RamFlash::new(initial()), tasks, initial());
        assert!(matches!(result, Err(Fault::UnknownTask(id)) if id == PING));
    }

    #[test]
    fn handoff_to_unregistered_task_is_a_fault() {
        fn stray<F: Flash<Record>>(_machine: &mut Machine<Record, F>) -> Transition {
            Transition::To(TaskRef::Normal(TaskId::new_unsafe(9)))
        }

        let mut tasks: TaskSet<Record, RamFlash<Record>> = TaskSet::new();
        tasks.register(PING, stray).unwrap();
        let mut machine =
            Machine::first_boot(RamFlash::new(initial()), tasks, initial()).unwrap();
        let result = machine.run();
        assert!(matches!(result, Err(Fault::UnknownTask(id)) if id.as_u8() == 9));
    }

    #[test]
    fn power_loss_replays_the_interrupted_body() {
        // A full run needs: 2 writes for first boot, then 2 writes per
        // hand-off. Crash at every budget and check that recovery
        // always converges to the uninterrupted final state.
        let baseline = {
            let mut machine =
                Machine::first_boot(CrashFlash::new(initial()), tasks(), initial()).unwrap();
            machine.run().unwrap();
            let total = machine.store_mut().flash_mut().writes();
            (*machine.store().committed_state(), total)
        };

        for budget in 0..baseline.1 {
            let flash = CrashFlash::with_budget(initial(), budget);
            let end = match Machine::first_boot(flash, tasks(), initial()) {
                Err(Fault::PowerLoss(_)) => {
                    // Nothing durable yet; the next boot is again a
                    // first boot.
                    let mut machine =
                        Machine::first_boot(CrashFlash::new(initial()), tasks(), initial())
                            .unwrap();
                    machine.run().unwrap();
                    *machine.store().committed_state()
                }
                Err(fault) => panic!("unexpected fault: {:?}", fault),
                Ok(mut machine) => {
                    match machine.run() {
                        Ok(()) => {}
                        Err(Fault::PowerLoss(_)) => {}
                        Err(fault) => panic!("unexpected fault: {:?}", fault),
                    }
                    let mut flash = machine.into_flash();
                    flash.set_budget(None);
                    let mut machine = Machine::recover(flash, tasks());
                    machine.run().unwrap();
                    *machine.store().committed_state()
                }
            };
            assert_eq!(end, baseline.0, "diverged at budget {}", budget);
        }
    }
}
