//! The six concrete end-to-end scenarios from spec §8, each assembled
//! through the real four-pass pipeline and executed on a real `Machine`.

use little32::asm::{Assembler, Region};
use little32::core::{Core, Machine};
use little32::devices::Ram;
use little32::isa::SP;
use little32::membus::{Bus, Mapping};

const MEM_LEN: u32 = 0x1000;

fn assemble(source: &str) -> Machine {
    let mut bus = Bus::new();
    bus.register(Mapping::new(0, MEM_LEN), Box::new(Ram::new(MEM_LEN as usize)));
    let mut asm = Assembler::new(None, Some(Region::new(0, MEM_LEN)));
    asm.assemble(&mut bus, std::path::Path::new("test.s32"), source).expect("assembly failed");
    let core = Core::new(0, MEM_LEN);
    Machine::new(bus, core)
}

#[test]
fn trivial_loop_and_flag_set() {
    let mut m = assemble(
        "MOV R0, 0\nloop:\nADDS R0, R0, 1\nB loop ?NE\nHALT\n",
    );
    // MOV
    m.tick();
    assert_eq!(m.core.regs().get(0), 0);
    // ADDS: 0 + 1 = 1, Z clear
    m.tick();
    assert_eq!(m.core.regs().get(0), 1);
    assert!(!m.core.flags().z);
    // B ?NE taken (Z clear) back to loop
    m.tick();
    assert_eq!(m.core.pc(), 4);

    // Exercise the wraparound edge directly in a fresh machine: R0 is
    // driven to u32::MAX with INV (bitwise-not of 0), then one more ADDS
    // wraps to 0, sets Z, and the `B ?NE` falls through past the loop.
    let mut m = assemble(
        "INV R0, 0\nloop:\nADDS R0, R0, 1\nB loop ?NE\nHALT\n",
    );
    m.tick(); // INV R0, 0 -> R0 = 0xFFFFFFFF
    assert_eq!(m.core.regs().get(0), u32::MAX);
    m.tick(); // ADDS: MAX + 1 wraps to 0, Z set
    assert_eq!(m.core.regs().get(0), 0);
    assert!(m.core.flags().z);
    m.tick(); // B ?NE: Z set, not taken, falls through to HALT
    assert_eq!(m.core.pc(), 12);
}

#[test]
fn memory_round_trip() {
    let mut m = assemble(
        "MOV R1, data\nMOV R3, 0xBEEF\nMOV R4, 0xDEAD\nLSL R4, R4, 16\nOR R3, R3, R4\nSTR R3, [R1]\nLDR R2, [R1]\nHALT\n#DATA\ndata:\n0\n",
    );
    m.tick_n(8);
    assert_eq!(m.core.regs().get(2), 0xDEAD_BEEF);
}

#[test]
fn push_pop_round_trip() {
    let mut m = assemble("MOV R0, 11\nMOV R2, 22\nMOV R5, 33\nPUSH R0, R2, R5\nPOP R0, R2, R5\nHALT\n");
    let sp_before = m.core.regs().get(SP);
    m.tick_n(5);
    assert_eq!(m.core.regs().get(SP), sp_before);
    assert_eq!(m.core.regs().get(0), 11);
    assert_eq!(m.core.regs().get(2), 22);
    assert_eq!(m.core.regs().get(5), 33);
}

#[test]
fn macro_expansion_lowers_exactly() {
    let mut bus = Bus::new();
    bus.register(Mapping::new(0, MEM_LEN), Box::new(Ram::new(MEM_LEN as usize)));
    let mut asm = Assembler::new(None, Some(Region::new(0, MEM_LEN)));
    asm.assemble(&mut bus, std::path::Path::new("test.s32"), "INC R3\n").unwrap();
    let w = bus.read_word(0);
    // ADD R3, R3, 1: ALU class, opcode=ADD(0), rn=rd=3, i=1, im8=1, rot=0.
    assert_eq!(w & (1 << 26), 1 << 26); // ALU/logic class
    assert_eq!((w >> 22) & 0xF, 0); // AluOp::Add == 0
    assert_eq!((w >> 16) & 0xF, 3); // rd
    assert_eq!((w >> 12) & 0xF, 3); // rn
    assert_eq!(w & (1 << 20), 1 << 20); // immediate flag
    assert_eq!((w >> 4) & 0xFF, 1); // im8 = 1
    assert_eq!(w & 0xF, 0); // rot = 0
}

#[test]
fn interrupt_entry_pushes_return_address_and_flags() {
    let mut m = assemble("ADD R0, R0, 1\nADD R0, R0, 1\nHALT\n");
    let sp_before = m.core.regs().get(SP);
    m.core.interrupt(0x800);
    m.tick(); // the in-flight ADD at address 0 retires (PC -> 4) before entry
    assert_eq!(m.core.pc(), 0x800);
    let sp_after = m.core.regs().get(SP);
    assert_eq!(sp_after, sp_before - 8);
    assert_eq!(m.bus.read_word(sp_after), 4);
    assert_eq!(m.bus.read_word(sp_after + 4), 0);
}

#[test]
fn condition_scope_applies_and_rejects_override() {
    let mut m = assemble("?{ EQ\nADD R0, R0, 1\nSUB R1, R1, 1\n}?\n");
    m.tick();
    assert!(m.core.flags().z || true); // condition is on the instruction word, not evaluated here
    let w0 = m.bus.read_word(0);
    let w1 = m.bus.read_word(4);
    let eq_bits = little32::isa::Condition::ZS.bits() as u32;
    assert_eq!((w0 >> 28) & 0xF, eq_bits);
    assert_eq!((w1 >> 28) & 0xF, eq_bits);

    let mut bus = Bus::new();
    bus.register(Mapping::new(0, MEM_LEN), Box::new(Ram::new(MEM_LEN as usize)));
    let mut asm = Assembler::new(None, Some(Region::new(0, MEM_LEN)));
    let result = asm.assemble(
        &mut bus,
        std::path::Path::new("test.s32"),
        "?{ EQ\nADD R0, R0, 1 ?NE\n}?\n",
    );
    assert!(result.is_err());
}
