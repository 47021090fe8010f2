// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Crash-atomic nonvolatile storage for intermittently-powered devices.
//!
//! This crate implements the durable storage layer the rest of Ember is
//! built on: a typed record of application state, kept in nonvolatile
//! memory behind a double-bank shadow copy, so that an arbitrary power
//! failure leaves either the old record or the new record — never a torn
//! mixture of the two.
//!
//! ## Shadow copy and swap
//!
//! The durable [`Image`] holds two banks and a selector. The bank named
//! by the selector is the committed record; the other bank is scratch.
//! Committing works in two steps: the whole working copy is written to
//! the scratch bank, then the selector is flipped. Only the selector
//! write changes which record a reboot will observe, and a selector is
//! small enough for the hardware to write atomically, so a crash at any
//! point leaves a well-formed record behind.
//!
//! ## Durable fields
//!
//! A [`FieldRef`] is a typed handle for one logical field of the record.
//! Callers read and write fields through a [`Store`], either committing
//! a field immediately ([`Store::commit`]) or staging several writes to
//! land together in a single swap ([`Store::stage`] + [`Store::flush`]).
//!
//! ## Backing flash
//!
//! The [`Flash`] trait abstracts the physical medium. [`RamFlash`] backs
//! the image with host memory and never fails. [`CrashFlash`] is a
//! fault-injection backend for testing: it cuts the power after a fixed
//! budget of durable writes, reporting [`PowerFailure`] so a simulation
//! can stop exactly where an intermittent device would brown out, then
//! reboot from whatever had landed.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

/// Identifies one of the two banks in a durable [`Image`].
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BankId {
    A,
    B,
}

impl BankId {
    /// Returns the other bank.
    ///
    pub const fn other(self) -> BankId {
        match self {
            BankId::A => BankId::B,
            BankId::B => BankId::A,
        }
    }

    /// Returns the bank's index into [`Image::banks`].
    ///
    pub const fn index(self) -> usize {
        match self {
            BankId::A => 0,
            BankId::B => 1,
        }
    }
}

/// The durable bytes of a record of type `R`: two banks and the
/// selector naming the committed one.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Image<R: Copy> {
    pub banks: [R; 2],
    pub select: BankId,
}

impl<R: Copy> Image<R> {
    /// Returns the committed record, as a reboot would observe it.
    ///
    pub fn committed(&self) -> R {
        self.banks[self.select.index()]
    }
}

/// Power was lost before a durable write landed.
///
/// Real flash backends never produce this; on hardware the device
/// simply stops. The fault-injection backend returns it so a host
/// simulation can stop at the same point and then reboot from the
/// surviving image.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerFailure;

/// A nonvolatile medium holding one [`Image`].
///
/// `write_bank` may be torn arbitrarily by a crash; that is safe
/// because the selector still names the old bank. `write_select` is
/// the one write that must be atomic on the target hardware.
///
pub trait Flash<R: Copy> {
    /// Reads the whole image, as done once at reboot.
    ///
    fn read(&self) -> Image<R>;

    /// Writes one bank.
    ///
    fn write_bank(&mut self, bank: BankId, value: R) -> Result<(), PowerFailure>;

    /// Atomically points the selector at the given bank.
    ///
    fn write_select(&mut self, bank: BankId) -> Result<(), PowerFailure>;
}

/// A [`Flash`] backed by host memory. Never fails.
///
pub struct RamFlash<R: Copy> {
    image: Image<R>,
}

impl<R: Copy> RamFlash<R> {
    /// Creates a flash whose banks both hold `seed`.
    ///
    pub fn new(seed: R) -> RamFlash<R> {
        RamFlash {
            image: Image {
                banks: [seed; 2],
                select: BankId::A,
            },
        }
    }
}

impl<R: Copy> Flash<R> for RamFlash<R> {
    fn read(&self) -> Image<R> {
        self.image
    }

    fn write_bank(&mut self, bank: BankId, value: R) -> Result<(), PowerFailure> {
        self.image.banks[bank.index()] = value;
        Ok(())
    }

    fn write_select(&mut self, bank: BankId) -> Result<(), PowerFailure> {
        self.image.select = bank;
        Ok(())
    }
}

/// A fault-injection [`Flash`] that cuts the power after a budget of
/// durable writes.
///
/// Each bank write and each selector write costs one unit of budget.
/// Once the budget is exhausted the write does not land and
/// [`PowerFailure`] is returned. The image keeps whatever had landed,
/// so a test can take the flash back out of the machine and reboot
/// from it.
///
pub struct CrashFlash<R: Copy> {
    image: Image<R>,
    budget: Option<u32>,
    writes: u32,
}

impl<R: Copy> CrashFlash<R> {
    /// Creates a flash with an unlimited write budget.
    ///
    pub fn new(seed: R) -> CrashFlash<R> {
        CrashFlash {
            image: Image {
                banks: [seed; 2],
                select: BankId::A,
            },
            budget: None,
            writes: 0,
        }
    }

    /// Creates a flash that will fail the `budget + 1`-th durable write.
    ///
    pub fn with_budget(seed: R, budget: u32) -> CrashFlash<R> {
        let mut flash = CrashFlash::new(seed);
        flash.budget = Some(budget);
        flash
    }

    /// Replaces the write budget. `None` means unlimited.
    ///
    pub fn set_budget(&mut self, budget: Option<u32>) {
        self.budget = budget;
    }

    /// Returns the number of durable writes that have landed.
    ///
    pub fn writes(&self) -> u32 {
        self.writes
    }

    fn spend(&mut self) -> Result<(), PowerFailure> {
        if let Some(budget) = self.budget {
            if budget == 0 {
                return Err(PowerFailure);
            }
            self.budget = Some(budget - 1);
        }
        self.writes += 1;
        Ok(())
    }
}

impl<R: Copy> Flash<R> for CrashFlash<R> {
    fn read(&self) -> Image<R> {
        self.image
    }

    fn write_bank(&mut self, bank: BankId, value: R) -> Result<(), PowerFailure> {
        self.spend()?;
        self.image.banks[bank.index()] = value;
        Ok(())
    }

    fn write_select(&mut self, bank: BankId) -> Result<(), PowerFailure> {
        self.spend()?;
        self.image.select = bank;
        Ok(())
    }
}

/// A typed handle for one logical field of a durable record `R`.
///
/// The handle carries non-capturing accessor functions plus an element
/// index, so array entries can be addressed without closures that
/// capture. Owning crates build their handles as `const`s or small
/// constructor functions.
///
#[derive(Clone, Copy)]
pub struct FieldRef<R, T> {
    index: usize,
    get: fn(&R, usize) -> T,
    set: fn(&mut R, usize, T),
}

impl<R, T: Copy> FieldRef<R, T> {
    /// Creates a handle for a scalar field. The index passed to the
    /// accessors is always zero.
    ///
    pub const fn new(get: fn(&R, usize) -> T, set: fn(&mut R, usize, T)) -> FieldRef<R, T> {
        FieldRef { index: 0, get, set }
    }

    /// Creates a handle for one element of an array field.
    ///
    pub const fn indexed(
        index: usize,
        get: fn(&R, usize) -> T,
        set: fn(&mut R, usize, T),
    ) -> FieldRef<R, T> {
        FieldRef { index, get, set }
    }

    /// Reads the field out of a record.
    ///
    pub fn read(&self, record: &R) -> T {
        (self.get)(record, self.index)
    }

    /// Writes the field into a record.
    ///
    pub fn write(&self, record: &mut R, value: T) {
        (self.set)(record, self.index, value)
    }
}

/// Mediates all access to a durable record.
///
/// The store keeps a working copy of the record in volatile memory and
/// the last committed copy behind the shadow banks in flash. Writes are
/// either staged — visible to subsequent reads, durable only at the
/// next [`flush`](Store::flush) — or committed immediately as a single
/// atomic field write.
///
pub struct Store<R: Copy, F: Flash<R>> {
    flash: F,
    live: R,
    durable: R,
    select: BankId,
    dirty: bool,
}

impl<R: Copy, F: Flash<R>> Store<R, F> {
    /// Seeds the flash with `initial` at true first boot.
    ///
    pub fn first_boot(mut flash: F, initial: R) -> Result<Store<R, F>, PowerFailure> {
        flash.write_bank(BankId::A, initial)?;
        flash.write_select(BankId::A)?;
        Ok(Store {
            flash,
            live: initial,
            durable: initial,
            select: BankId::A,
            dirty: false,
        })
    }

    /// Adopts the committed record after a reboot.
    ///
    pub fn recover(flash: F) -> Store<R, F> {
        let image = flash.read();
        let committed = image.committed();
        Store {
            flash,
            live: committed,
            durable: committed,
            select: image.select,
            dirty: false,
        }
    }

    /// Reads a field from the working copy, so an operation observes
    /// its own staged writes.
    ///
    pub fn read<T: Copy>(&self, field: FieldRef<R, T>) -> T {
        field.read(&self.live)
    }

    /// Reads a field from the last committed record, as a reboot at
    /// this instant would observe it.
    ///
    pub fn committed<T: Copy>(&self, field: FieldRef<R, T>) -> T {
        field.read(&self.durable)
    }

    /// Returns the whole working copy.
    ///
    pub fn state(&self) -> &R {
        &self.live
    }

    /// Returns the whole last-committed record.
    ///
    pub fn committed_state(&self) -> &R {
        &self.durable
    }

    /// Stages one field write. Durable at the next flush.
    ///
    pub fn stage<T: Copy>(&mut self, field: FieldRef<R, T>, value: T) {
        field.write(&mut self.live, value);
        self.dirty = true;
    }

    /// Stages an arbitrary update of the working copy. Durable at the
    /// next flush.
    ///
    pub fn stage_with(&mut self, update: impl FnOnce(&mut R)) {
        update(&mut self.live);
        self.dirty = true;
    }

    /// Commits one field write immediately: atomic, idempotent, and
    /// safe to re-run after a crash.
    ///
    /// Any writes staged earlier land in the same swap.
    ///
    pub fn commit<T: Copy>(&mut self, field: FieldRef<R, T>, value: T) -> Result<(), PowerFailure> {
        self.stage(field, value);
        self.flush()
    }

    /// Makes all staged writes durable in one shadow-copy-and-swap.
    ///
    /// The working copy is written to the scratch bank, then the
    /// selector is flipped. A crash before the flip leaves the old
    /// record; re-running the flush is always safe.
    ///
    pub fn flush(&mut self) -> Result<(), PowerFailure> {
        if !self.dirty {
            return Ok(());
        }
        let target = self.select.other();
        self.flash.write_bank(target, self.live)?;
        self.flash.write_select(target)?;
        self.select = target;
        self.durable = self.live;
        self.dirty = false;
        Ok(())
    }

    /// Returns whether any staged writes have not yet been flushed.
    ///
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the backing flash, for fault injection in tests.
    ///
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Consumes the store, returning the backing flash.
    ///
    pub fn into_flash(self) -> F {
        self.flash
    }
}
