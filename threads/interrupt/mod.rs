// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The interrupt bridge: safe migration of control into and out of
//! interrupt context.
//!
//! Interrupts are the one source of true asynchronous preemption in
//! the system. The bridge records, durably and in a single write,
//! that execution has moved into a handler: the interrupted task's
//! reference is saved, the handler's reference is committed as
//! current with its handler tag set, and delivery is masked so a
//! handler can never be re-entered. The return path restores the
//! interrupted task directly, bypassing the scheduler, since the
//! resumption target is already known.
//!
//! A reboot while inside a handler re-enters the handler task, like
//! any other task. The `REBOOTED` flag makes the return path
//! idempotent across such a crash: the platform stack fixup that
//! already ran before the reboot is skipped on replay.
//!
//! Wiring the bridge to a concrete interrupt vector and stack layout
//! is platform work outside this crate; the platform calls
//! [`fire`] from its vector entry and [`setup_complete`] once its
//! user-level interrupt configuration is finished.

use crate::scheduler::SCHEDULER_REF;
use crate::{Error, NvState};
use bitflags::bitflags;
use log::{debug, trace};
use nvmem::{FieldRef, Flash, PowerFailure, Store};
use task::{Context, Machine, TaskId, TaskRef, Transition};

bitflags! {
    /// The bridge's persisted flags, kept in one byte so entry and
    /// exit each need only a single durable write.
    ///
    pub(crate) struct BridgeFlags: u8 {
        /// The platform finished its interrupt configuration.
        const SETUP_DONE = 1 << 0;

        /// Hardware interrupt delivery is enabled.
        const ENABLED = 1 << 1;

        /// Execution is inside a handler.
        const ACTIVE = 1 << 2;

        /// A reboot happened since handler entry.
        const REBOOTED = 1 << 3;
    }
}

/// The bridge's durable state.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BridgeState {
    pub flags: BridgeFlags,
    pub saved: TaskRef,
}

impl BridgeState {
    pub(crate) fn new() -> BridgeState {
        BridgeState {
            flags: BridgeFlags::empty(),
            saved: SCHEDULER_REF,
        }
    }
}

fn bridge_field<A: Copy>() -> FieldRef<NvState<A>, BridgeState> {
    FieldRef::new(|s, _| s.bridge, |s, _, v| s.bridge = v)
}

/// Signals that user-level interrupt configuration is finished. The
/// platform calls this once; [`fire`] refuses delivery until then.
///
pub fn setup_complete<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
) -> Result<(), Error> {
    let mut bridge = machine.store().read(bridge_field());
    bridge.flags.insert(BridgeFlags::SETUP_DONE);
    machine.store_mut().commit(bridge_field(), bridge)?;
    Ok(())
}

/// Enables hardware interrupt delivery. Inside a handler the request
/// is ignored, preventing reentrant handler invocation.
///
pub fn enable<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
) -> Result<(), Error> {
    if in_handler(machine) {
        return Ok(());
    }

    let mut bridge = machine.store().read(bridge_field());
    bridge.flags.insert(BridgeFlags::ENABLED);
    machine.store_mut().commit(bridge_field(), bridge)?;
    Ok(())
}

/// Disables hardware interrupt delivery.
///
pub fn disable<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
) -> Result<(), Error> {
    let mut bridge = machine.store().read(bridge_field());
    bridge.flags.remove(BridgeFlags::ENABLED);
    machine.store_mut().commit(bridge_field(), bridge)?;
    Ok(())
}

/// Returns whether interrupt delivery is enabled.
///
pub fn enabled<A: Copy, F: Flash<NvState<A>>>(machine: &Machine<NvState<A>, F>) -> bool {
    machine
        .store()
        .read(bridge_field())
        .flags
        .contains(BridgeFlags::ENABLED)
}

/// Returns whether execution is inside an interrupt handler: setup
/// has completed and the current task reference carries the handler
/// tag.
///
pub fn in_handler<A: Copy, F: Flash<NvState<A>>>(machine: &Machine<NvState<A>, F>) -> bool {
    let bridge = machine.store().read(bridge_field());
    bridge.flags.contains(BridgeFlags::SETUP_DONE) && machine.context().task.is_interrupt()
}

/// The handler-entry hook the platform's interrupt vector calls.
///
/// Returns `Ok(false)` without any durable write when delivery is
/// refused: setup incomplete, delivery disabled, or already inside a
/// handler. Otherwise saves the interrupted task's reference, marks
/// the bridge active, masks delivery, and commits the tagged handler
/// as current, all in one durable write, so a crash can never leave
/// the system half inside a handler.
///
pub fn fire<A: Copy, F: Flash<NvState<A>>>(
    machine: &mut Machine<NvState<A>, F>,
    handler: TaskId,
) -> Result<bool, Error> {
    if !machine.tasks().contains(handler) {
        return Err(Error::InvalidHandle);
    }

    let bridge = machine.store().read(bridge_field());
    if !bridge.flags.contains(BridgeFlags::SETUP_DONE | BridgeFlags::ENABLED)
        || in_handler(machine)
    {
        return Ok(false);
    }

    let context = machine.context();
    let time = context.time.wrapping_add(1);
    machine.store_mut().stage_with(move |record| {
        record.bridge.saved = context.task;
        record.bridge.flags = (bridge.flags | BridgeFlags::ACTIVE) - BridgeFlags::ENABLED;
        record.checkpoint = Context {
            task: TaskRef::Interrupt(handler),
            time,
        };
    });
    machine.store_mut().flush()?;

    debug!("interrupt: entered handler task {}", handler.as_u8());
    Ok(true)
}

/// The handler return path, called from the handler task's body.
///
/// Runs the platform's stack fixup unless a reboot since entry means
/// it already ran; clears the bridge, re-enables delivery, and
/// transitions directly to the interrupted task with its handler tag
/// cleared, bypassing the scheduler, since the resumption target is
/// already known. The returned transition must be returned from the
/// handler body; the staged bridge writes commit atomically with it.
///
pub fn epilogue<A, F, G>(machine: &mut Machine<NvState<A>, F>, fixup: G) -> Transition
where
    A: Copy,
    F: Flash<NvState<A>>,
    G: FnOnce(&mut Machine<NvState<A>, F>),
{
    let bridge = machine.store().read(bridge_field());
    if !bridge.flags.contains(BridgeFlags::ACTIVE) {
        return Transition::Fatal("interrupt return outside a handler");
    }

    if !bridge.flags.contains(BridgeFlags::REBOOTED) {
        fixup(machine);
    }

    let resume = bridge.saved.untagged();
    machine.store_mut().stage_with(move |record| {
        record.bridge.flags =
            (bridge.flags - (BridgeFlags::ACTIVE | BridgeFlags::REBOOTED)) | BridgeFlags::ENABLED;
    });

    trace!("interrupt: returning to {:?}", resume);
    Transition::To(resume)
}

/// Records, at reboot, that a crash happened inside a handler, so the
/// return path skips the stack fixup it already performed. Committing
/// the flag is itself idempotent and safe to re-run.
///
pub(crate) fn note_reboot<A: Copy, F: Flash<NvState<A>>>(
    store: &mut Store<NvState<A>, F>,
) -> Result<(), PowerFailure> {
    let mut bridge = store.read(bridge_field());
    if bridge.flags.contains(BridgeFlags::ACTIVE) && !bridge.flags.contains(BridgeFlags::REBOOTED)
    {
        bridge.flags.insert(BridgeFlags::REBOOTED);
        store.commit(bridge_field(), bridge)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bridge_is_idle() {
        let bridge = BridgeState::new();
        assert_eq!(bridge.flags, BridgeFlags::empty());
        assert!(!bridge.saved.is_interrupt());
    }

    #[test]
    fn flag_arithmetic() {
        let entry = (BridgeFlags::SETUP_DONE | BridgeFlags::ENABLED | BridgeFlags::ACTIVE)
            - BridgeFlags::ENABLED;
        assert!(entry.contains(BridgeFlags::ACTIVE));
        assert!(!entry.contains(BridgeFlags::ENABLED));

        let exit = (entry - (BridgeFlags::ACTIVE | BridgeFlags::REBOOTED)) | BridgeFlags::ENABLED;
        assert_eq!(exit, BridgeFlags::SETUP_DONE | BridgeFlags::ENABLED);
    }
}
