//! The executor: register file, NZCV flags, fetch-decode-execute loop,
//! interrupt entry, and the [`Machine`] aggregate that drives a [`Core`]
//! against a [`crate::membus::Bus`] one tick at a time.
//!
//! Grounded on the teacher's `Cpu6502::step(&mut bus)` shape (`src/cpu/
//! mod.rs`, `src/cpu6502.rs`): the core never owns the bus, it borrows it
//! for the duration of one step. Registration-order device clocking (spec
//! §5) is realized by [`Machine`], the one place that owns both sides.

mod execute;
mod regs;

pub use regs::{Flags, RegisterFile};

use crate::isa::{Fields, Word, PC};
use crate::membus::Bus;

/// A point-in-time dump of architectural state, for tests and the CLI's
/// status line. Cheap and side-effect-free, mirroring the teacher's
/// `CpuState` accessor convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub regs: [Word; 16],
    pub flags: Flags,
}

/// Register file, flags, and the fetch-decode-execute step. Holds no bus
/// reference; every stepping method takes one by `&mut`.
pub struct Core {
    regs: RegisterFile,
    flags: Flags,
    start_pc: Word,
    start_sp: Word,
    /// Set by [`Core::interrupt`]; serviced at the start of the next
    /// [`Core::step`] (spec §5: "entry happens between instructions only").
    pending_interrupt: Option<Word>,
}

impl Core {
    pub fn new(start_pc: Word, start_sp: Word) -> Self {
        let mut regs = RegisterFile::new();
        regs.set(PC, start_pc);
        regs.set(crate::isa::SP, start_sp);
        Core { regs, flags: Flags::default(), start_pc, start_sp, pending_interrupt: None }
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot { regs: self.regs.all(), flags: self.flags }
    }

    pub fn pc(&self) -> Word {
        self.regs.get(PC)
    }

    /// A device's interrupt-request entry point (spec §4.3, "Interrupts").
    /// Recorded, not serviced immediately: at most one is serviced per
    /// cycle, at the top of the next `step()`.
    pub fn interrupt(&mut self, address: Word) {
        self.pending_interrupt = Some(address);
    }

    pub fn soft_reset(&mut self) {
        self.regs.set(PC, self.start_pc);
        self.regs.set(crate::isa::SP, self.start_sp);
    }

    pub fn hard_reset(&mut self) {
        self.regs = RegisterFile::new();
        self.flags = Flags::default();
        self.soft_reset();
        self.pending_interrupt = None;
    }

    /// Fetch, decode, and execute exactly one instruction, then service a
    /// pending interrupt if one was raised (spec §5: "a device that raises
    /// an interrupt mid-`clock()` has its request serviced immediately
    /// after the core's next instruction retires" — so the in-flight
    /// instruction always completes first, and the pushed return address
    /// reflects its already-advanced `PC`).
    pub fn step(&mut self, bus: &mut Bus) {
        let pc = self.regs.get(PC);
        let word = bus.read_word(pc);
        let fields = Fields::decode(word);

        if !fields.cond.evaluate(self.flags.n, self.flags.z, self.flags.c, self.flags.v) {
            self.regs.set(PC, pc.wrapping_add(4));
        } else {
            execute::dispatch(self, bus, fields);
        }

        if let Some(addr) = self.pending_interrupt.take() {
            self.enter_interrupt(bus, addr);
        }
    }

    fn enter_interrupt(&mut self, bus: &mut Bus, address: Word) {
        let sp = self.regs.get(crate::isa::SP);
        let sp1 = sp.wrapping_sub(4);
        bus.write_word(sp1, self.flags.pack());
        let sp2 = sp1.wrapping_sub(4);
        bus.write_word(sp2, self.regs.get(PC));
        self.regs.set(crate::isa::SP, sp2);
        self.flags = Flags::default();
        self.regs.set(PC, address);
    }

    /// Return-from-exception: pops `PC` then a saved NZCV word, in that
    /// order, off `SP` (spec §4.3). The inverse of [`Core::enter_interrupt`],
    /// which pushes flags first so `PC` ends up on top of the stack.
    pub(crate) fn rfe(&mut self, bus: &mut Bus) {
        let sp = self.regs.get(crate::isa::SP);
        let new_pc = bus.read_word(sp);
        let flags_word = bus.read_word(sp.wrapping_add(4));
        self.regs.set(crate::isa::SP, sp.wrapping_add(8));
        self.flags = Flags::unpack(flags_word);
        self.regs.set(PC, new_pc);
    }

    pub(crate) fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub(crate) fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }
}

/// Aggregates a [`Core`] and a [`Bus`], realizing spec §4.1's "the bus
/// owns a single core" contract: each [`Machine::tick`] clocks every
/// mapped device once (registration order) then steps the core exactly
/// once.
pub struct Machine {
    pub bus: Bus,
    pub core: Core,
}

impl Machine {
    pub fn new(bus: Bus, core: Core) -> Self {
        Machine { bus, core }
    }

    pub fn tick(&mut self) {
        self.bus.tick();
        self.core.step(&mut self.bus);
    }

    pub fn tick_n(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }

    pub fn soft_reset(&mut self) {
        self.core.soft_reset();
        self.bus.soft_reset();
    }

    pub fn hard_reset(&mut self) {
        self.core.hard_reset();
        self.bus.hard_reset();
    }

    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membus::Mapping;

    fn machine_with_program(words: &[u32]) -> Machine {
        let mut bus = Bus::new();
        let mut image = Vec::with_capacity(words.len() * 4);
        for w in words {
            image.extend_from_slice(&w.to_le_bytes());
        }
        let len = image.len().max(64) as u32;
        bus.register(Mapping::new(0, len), Box::new(crate::devices::Ram::new(len as usize)));
        for (i, w) in words.iter().enumerate() {
            bus.write_word((i as u32) * 4, *w);
        }
        let core = Core::new(0, len);
        Machine::new(bus, core)
    }

    #[test]
    fn unconditional_nop_advances_pc_by_four() {
        let mut m = machine_with_program(&[0]);
        m.tick();
        assert_eq!(m.core.pc(), 4);
    }

    #[test]
    fn false_condition_skips_but_still_advances_pc() {
        // cond = NV (0b1111) at bits 31..28, rest zero: always false.
        let word = 0b1111_0000_0000_0000_0000_0000_0000_0000u32;
        let mut m = machine_with_program(&[word]);
        m.tick();
        assert_eq!(m.core.pc(), 4);
    }

    #[test]
    fn interrupt_pushes_pc_and_flags_then_jumps() {
        // Matches spec §8 scenario 5: the in-flight instruction (the NOP
        // at address 0) retires first (PC -> 4), then entry pushes that
        // already-advanced PC and jumps; the handler's own first
        // instruction does not execute in this same tick.
        let mut m = machine_with_program(&[0, 0, 0, 0]);
        let sp_before = m.core.regs().get(crate::isa::SP);
        m.core.interrupt(0x100);
        m.tick();
        assert_eq!(m.core.pc(), 0x100);
        let sp_after = m.core.regs().get(crate::isa::SP);
        assert_eq!(sp_after, sp_before - 8);
        assert_eq!(m.bus.read_word(sp_after), 4);
        assert_eq!(m.bus.read_word(sp_after + 4), 0);
    }

    #[test]
    fn hard_reset_restores_start_pc_and_sp() {
        let mut m = machine_with_program(&[0]);
        m.tick();
        m.hard_reset();
        assert_eq!(m.core.pc(), 0);
    }
}
