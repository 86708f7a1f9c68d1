//! The memory-mapped device bus: OR-reduction reads, fan-out writes, and
//! the tick/reset propagation that drives clockable devices.
//!
//! Grounded on the teacher's `src/bus/mod.rs` façade (a struct holding a
//! set of mapped components dispatched by address range), generalized from
//! the NES's fixed PPU/APU/cartridge wiring to an open, registrable device
//! list.

mod device;

pub use device::{DeviceKind, MappedDevice, Mapping};

/// The 32-bit address space a [`Bus`] routes reads and writes over.
pub type Address = u32;

/// A registered device plus the address range it claims.
struct Slot {
    mapping: Mapping,
    device: Box<dyn MappedDevice>,
}

/// Routes byte/word reads and writes to every device mapped over the
/// touched address, per spec §5's bus semantics:
///
/// - **Read**: every device whose range contains the address contributes
///   its value; the bus OR-reduces all contributions together (a device
///   not covering an address contributes 0).
/// - **Write**: the value fans out to every device whose range contains
///   the address; each decides independently whether to accept it.
///
/// Devices are consulted in registration order, which only matters for
/// side effects (e.g. a keyboard clearing its buffer on read) since the
/// OR-reduction itself is commutative.
#[derive(Default)]
pub struct Bus {
    slots: Vec<Slot>,
}

impl Bus {
    pub fn new() -> Self {
        Bus { slots: Vec::new() }
    }

    /// Register a device over `[mapping.start, mapping.start + mapping.len)`.
    /// Overlapping mappings are allowed; overlap is how OR-reduction is
    /// meant to be used (e.g. a debug console aliased over unused ROM).
    pub fn register(&mut self, mapping: Mapping, device: Box<dyn MappedDevice>) {
        self.slots.push(Slot { mapping, device });
    }

    fn touching(&self, addr: Address) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(move |slot| slot.mapping.contains(addr))
    }

    fn touching_mut(&mut self, addr: Address) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut().filter(move |slot| slot.mapping.contains(addr))
    }

    pub fn read_byte(&mut self, addr: Address) -> u8 {
        let mut acc = 0u8;
        for slot in self.touching_mut(addr) {
            acc |= slot.device.read_byte(addr - slot.mapping.start);
        }
        acc
    }

    pub fn write_byte(&mut self, addr: Address, value: u8) {
        for slot in self.touching_mut(addr) {
            slot.device.write_byte(addr - slot.mapping.start, value);
        }
    }

    /// Word-aligned reads OR-reduce each covering device's `read_word`.
    /// Unaligned reads reproduce the source's surprising behavior (spec
    /// §9, "Open question — unaligned word loads"): they fall through to
    /// the byte path and return a single zero-extended byte, rather than
    /// assembling four bytes across the misalignment.
    pub fn read_word(&mut self, addr: Address) -> u32 {
        if addr % 4 != 0 {
            return self.read_byte(addr) as u32;
        }
        let mut acc = 0u32;
        for slot in self.touching_mut(addr) {
            acc |= slot.device.read_word(addr - slot.mapping.start);
        }
        acc
    }

    /// Word-aligned writes fan out to each covering device's `write_word`.
    /// Unaligned writes mirror the read side: only the low byte is
    /// written, at `addr`.
    pub fn write_word(&mut self, addr: Address, value: u32) {
        if addr % 4 != 0 {
            self.write_byte(addr, value as u8);
            return;
        }
        for slot in self.touching_mut(addr) {
            slot.device.write_word(addr - slot.mapping.start, value);
        }
    }

    /// Privileged word write used by the assembler to populate ROM-like
    /// devices at build time (spec §3, `write_word_forced`).
    pub fn write_word_forced(&mut self, addr: Address, value: u32) {
        for slot in self.touching_mut(addr) {
            slot.device.write_word_forced(addr - slot.mapping.start, value);
        }
    }

    /// Privileged byte write, the forced counterpart of [`Bus::write_byte`].
    pub fn write_byte_forced(&mut self, addr: Address, value: u8) {
        for slot in self.touching_mut(addr) {
            slot.device.write_byte_forced(addr - slot.mapping.start, value);
        }
    }

    /// Advance every mapped device by one tick, in registration order.
    pub fn tick(&mut self) {
        for slot in &mut self.slots {
            slot.device.tick();
        }
    }

    pub fn tick_n(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// A soft reset leaves RAM contents intact but re-reads reset vectors
    /// and re-arms peripherals (spec §5, Reset semantics).
    pub fn soft_reset(&mut self) {
        for slot in &mut self.slots {
            slot.device.soft_reset();
        }
    }

    /// A hard reset additionally clears volatile device state (RAM zeroed,
    /// etc).
    pub fn hard_reset(&mut self) {
        for slot in &mut self.slots {
            slot.device.hard_reset();
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = (&Mapping, &dyn MappedDevice)> {
        self.slots.iter().map(|s| (&s.mapping, s.device.as_ref()))
    }
}
