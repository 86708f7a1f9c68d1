//! Per-class instruction execution. One function per bit-layout row from
//! spec §6's field table; [`dispatch`] is the single entry point `Core`
//! calls after condition evaluation passes.

use crate::core::Core;
use crate::isa::{barrel_rotate, Class, Fields, Word, PC, SP, LR};
use crate::membus::Bus;

pub fn dispatch(core: &mut Core, bus: &mut Bus, fields: Fields) {
    let pc = core.regs().get(PC);
    match fields.class() {
        Class::AluLogic => {
            alu_logic(core, fields);
            core.regs_mut().set(PC, pc.wrapping_add(4));
        }
        Class::Branch => branch(core, bus, fields, pc),
        Class::MemWord => {
            mem_word(core, bus, fields);
            core.regs_mut().set(PC, pc.wrapping_add(4));
        }
        Class::RegList => {
            reg_list(core, bus, fields);
            core.regs_mut().set(PC, pc.wrapping_add(4));
        }
        Class::MoveMulti => {
            move_multi(core, fields);
            core.regs_mut().set(PC, pc.wrapping_add(4));
        }
        Class::Fpu => {
            fpu(core, fields);
            core.regs_mut().set(PC, pc.wrapping_add(4));
        }
        Class::Undefined => {
            core.regs_mut().set(PC, pc.wrapping_add(4));
        }
    }
}

fn reg(word: Word, lo: u32, bits: u32) -> u32 {
    (word >> lo) & ((1u32 << bits) - 1)
}

/// Resolve the flex "second operand" field shared by arithmetic/logic,
/// load/store, and the register-list base-index absence. `field_lo` is
/// where the 8- or 12-bit operand field starts; the register-mode index
/// always sits in the field's own top nibble (spec §6 layout note).
fn flex_operand(core: &Core, word: Word, field_lo: u32, field_bits: u32) -> Word {
    let i = (word >> 20) & 1;
    let rot = reg(word, 0, 4);
    if i == 1 {
        let imm = reg(word, field_lo, field_bits);
        barrel_rotate(imm, rot)
    } else {
        let reg_index = reg(word, field_lo + field_bits - 4, 4) as u8;
        barrel_rotate(core.regs().get(reg_index), rot)
    }
}

fn alu_logic(core: &mut Core, fields: Fields) {
    use crate::isa::AluOp;

    let w = fields.raw;
    let op = AluOp::from_bits(reg(w, 22, 4) as u8);
    let s = (w >> 21) & 1 != 0;
    let rd = reg(w, 16, 4) as u8;

    let (lhs, operand) = if op.is_two_operand() {
        (core.regs().get(rd), flex_operand(core, w, 4, 12))
    } else {
        let rs = reg(w, 12, 4) as u8;
        (core.regs().get(rs), flex_operand(core, w, 4, 8))
    };

    let n_bit = fields.n;
    let carry_in = core.flags().c;
    let (result, carry, overflow) = compute_alu(op, lhs, operand, n_bit, carry_in);

    if !matches!(op, AluOp::Cmp | AluOp::Cmn | AluOp::Tst) {
        core.regs_mut().set(rd, result);
    }

    let flags = core.flags_mut();
    if s || matches!(op, AluOp::Cmp | AluOp::Cmn | AluOp::Tst) {
        flags.set_nz(result);
        flags.c = carry;
        flags.v = overflow;
    }
}

/// Returns `(result, carry, overflow)` per spec §4.3's flag-setting rule.
/// `carry_in` is the core's current C flag, consumed only by `ADC`/`SBB`
/// (add/subtract-with-carry); every other additive op fixes its own
/// carry-in per the usual `ADD`/`SUB`/`CMP`/`CMN` convention.
fn compute_alu(op: crate::isa::AluOp, lhs: Word, rhs: Word, n: bool, carry_in: bool) -> (Word, bool, bool) {
    use crate::isa::AluOp::*;

    match op {
        Add | Cmn => add_with_carry(lhs, rhs, false),
        Sub | Cmp => add_with_carry(lhs, !rhs, true),
        Adc => add_with_carry(lhs, rhs, carry_in),
        Sbb => add_with_carry(lhs, !rhs, carry_in),
        Asl => {
            let shift = rhs & 0x1F;
            let result = lhs.wrapping_shl(shift);
            let lossy = shift > 0 && (lhs >> (32 - shift.max(1))) != 0;
            let overflow = (lhs as i32).is_negative() != (result as i32).is_negative();
            (result, lossy, overflow)
        }
        Asr => {
            let shift = rhs & 0x1F;
            let result = ((lhs as i32) >> shift) as u32;
            let lossy = shift > 0 && (lhs & ((1u32 << shift) - 1)) != 0;
            (result, lossy, false)
        }
        Orr => (lhs | rhs, false, false),
        And | Tst => (lhs & rhs, false, false),
        Xor => (lhs ^ rhs, false, false),
        Lsl => {
            let shift = rhs & 0x1F;
            let result = lhs.wrapping_shl(shift);
            let lossy = shift > 0 && (lhs >> (32 - shift.max(1))) != 0;
            (result, lossy, false)
        }
        Lsr => {
            let shift = rhs & 0x1F;
            let result = lhs.wrapping_shr(shift);
            let lossy = shift > 0 && (lhs & ((1u32 << shift) - 1)) != 0;
            (result, lossy, false)
        }
        Mov => {
            let result = if n { !rhs } else { rhs };
            let overflow = (rhs as i32).is_negative() != (result as i32).is_negative();
            (result, false, overflow)
        }
        Inv => {
            let result = !rhs;
            let overflow = (rhs as i32).is_negative() != (result as i32).is_negative();
            (result, false, overflow)
        }
    }
}

/// 33-bit sign-extended add: `lhs + rhs (+ carry_in)`. `invert_rhs_input`
/// controls nothing here (caller pre-inverts for subtraction); this just
/// computes carry-out-of-bit-32 and signed overflow.
fn add_with_carry(lhs: Word, rhs: Word, carry_in: bool) -> (Word, bool, bool) {
    let (r1, c1) = lhs.overflowing_add(rhs);
    let (result, c2) = r1.overflowing_add(carry_in as Word);
    let carry = c1 || c2;
    let overflow = ((lhs ^ result) & (rhs ^ result) & 0x8000_0000) != 0;
    (result, carry, overflow)
}

fn branch(core: &mut Core, bus: &mut Bus, fields: Fields, pc: Word) {
    let w = fields.raw;
    let l = (w >> 24) & 1 != 0;
    let magnitude = reg(w, 0, 24);

    if fields.n && magnitude == 0 {
        if l {
            core.regs_mut().set(PC, core.regs().get(LR));
        } else {
            core.rfe(bus);
        }
        return;
    }

    let offset = (magnitude << 2) as i32;
    let offset = if fields.n { -offset } else { offset };
    let target = (pc as i32).wrapping_add(offset) as Word;

    if l {
        core.regs_mut().set(LR, pc.wrapping_add(4));
    }
    core.regs_mut().set(PC, target);
}

fn mem_word(core: &mut Core, bus: &mut Bus, fields: Fields) {
    let w = fields.raw;
    let byte_mode = (w >> 22) & 1 != 0;
    let write_mode = (w >> 21) & 1 != 0;
    let data_reg = reg(w, 16, 4) as u8;
    let base_reg = reg(w, 12, 4) as u8;

    let offset = flex_operand_signed(core, w);
    let address = (core.regs().get(base_reg) as i32).wrapping_add(offset) as Word;

    if write_mode {
        let value = core.regs().get(data_reg);
        if byte_mode {
            bus.write_byte(address, value as u8);
        } else {
            bus.write_word(address, value);
        }
    } else {
        let value = if byte_mode {
            bus.read_byte(address) as Word
        } else {
            bus.read_word(address)
        };
        core.regs_mut().set(data_reg, value);
    }
}

/// Like [`flex_operand`] but the result is a signed offset: `N` (bit 27)
/// selects the sign of the whole offset.
fn flex_operand_signed(core: &Core, w: Word) -> i32 {
    let magnitude = flex_operand(core, w, 4, 8) as i32;
    if (w >> 27) & 1 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn reg_list(core: &mut Core, bus: &mut Bus, fields: Fields) {
    let w = fields.raw;
    let push = (w >> 20) & 1 != 0;
    let base_reg = reg(w, 16, 4) as u8;
    let list = reg(w, 0, 16);

    let mut base = core.regs().get(base_reg);

    if push {
        for i in (0..16u8).rev() {
            if (list >> i) & 1 != 0 {
                base = base.wrapping_sub(4);
                let value = core.regs().get(i);
                bus.write_word(base, value);
            }
        }
    } else {
        for i in 0..16u8 {
            if (list >> i) & 1 != 0 {
                let value = bus.read_word(base);
                core.regs_mut().set(i, value);
                base = base.wrapping_add(4);
            }
        }
    }

    core.regs_mut().set(base_reg, base);
}

fn move_multi(core: &mut Core, fields: Fields) {
    let w = fields.raw;
    let is_swap = (w >> 20) & 1 != 0;
    let rn = reg(w, 16, 4) as u8;

    if is_swap {
        let second = reg(w, 12, 4) as u8;
        let rot = reg(w, 0, 4);
        let a = core.regs().get(rn);
        let b = barrel_rotate(core.regs().get(second), rot);
        core.regs_mut().set(rn, b);
        core.regs_mut().set(second, a);
    } else {
        let value = core.regs().get(rn);
        let list = reg(w, 0, 16);
        for i in 0..16u8 {
            if (list >> i) & 1 != 0 {
                core.regs_mut().set(i, value);
            }
        }
    }
}

fn fpu(core: &mut Core, fields: Fields) {
    use crate::isa::FpuOp;

    let w = fields.raw;
    let op = FpuOp::from_bits(reg(w, 20, 3) as u8);
    let rd = reg(w, 16, 4) as u8;
    let rn = reg(w, 12, 4) as u8;
    let rm = reg(w, 8, 4) as u8;
    let rot = reg(w, 0, 4);

    let a = f32::from_bits(core.regs().get(rn));
    let b_word = barrel_rotate(core.regs().get(rm), rot);
    let b = f32::from_bits(b_word);

    match op {
        FpuOp::Addf => core.regs_mut().set(rd, (a + b).to_bits()),
        FpuOp::Subf => core.regs_mut().set(rd, (a - b).to_bits()),
        FpuOp::Mulf => core.regs_mut().set(rd, (a * b).to_bits()),
        FpuOp::Divf => core.regs_mut().set(rd, (a / b).to_bits()),
        FpuOp::Itof => {
            let source = b_word as i32;
            core.regs_mut().set(rd, (source as f32).to_bits());
        }
        FpuOp::Ftoi => {
            let truncated = a.trunc();
            core.regs_mut().set(rd, truncated as i32 as Word);
        }
        FpuOp::Cmpf | FpuOp::Cmpfi => {
            let diff = a - b;
            let flags = core.flags_mut();
            flags.n = diff.is_sign_negative() && diff != 0.0;
            flags.z = diff == 0.0;
            flags.c = false;
            flags.v = a.is_sign_positive() != b.is_sign_positive()
                && (a.abs() > f32::MAX / 2.0 || b.abs() > f32::MAX / 2.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Core, Machine};
    use crate::membus::{Bus, Mapping};

    fn machine() -> Machine {
        let mut bus = Bus::new();
        bus.register(Mapping::new(0, 0x1000), Box::new(crate::devices::Ram::new(0x1000)));
        let core = Core::new(0, 0x1000);
        Machine::new(bus, core)
    }

    fn encode_alu(op: crate::isa::AluOp, s: bool, rd: u8, rs: u8, imm: u32) -> Word {
        (0b0000 << 28) // AL
            | (1 << 26)
            | ((op.bits() as u32) << 22)
            | ((s as u32) << 21)
            | (1 << 20) // immediate
            | ((rd as u32) << 16)
            | ((rs as u32) << 12)
            | (imm & 0xFF) << 4
    }

    #[test]
    fn add_immediate_sets_destination_register() {
        let mut m = machine();
        let word = encode_alu(crate::isa::AluOp::Add, true, 0, 1, 5);
        m.bus.write_word(0, word);
        m.tick();
        assert_eq!(m.core.regs().get(0), 5);
        assert!(!m.core.flags().z);
    }

    #[test]
    fn sub_resulting_in_zero_sets_z_flag() {
        let mut m = machine();
        m.core.regs_mut().set(1, 5);
        let word = encode_alu(crate::isa::AluOp::Sub, true, 0, 1, 5);
        m.bus.write_word(0, word);
        m.tick();
        assert_eq!(m.core.regs().get(0), 0);
        assert!(m.core.flags().z);
    }

    #[test]
    fn adc_consumes_incoming_carry_flag() {
        let mut m = machine();
        m.core.flags_mut().c = true;
        m.core.regs_mut().set(1, 5);
        let word = encode_alu(crate::isa::AluOp::Adc, true, 0, 1, 1);
        m.bus.write_word(0, word);
        m.tick();
        // 5 + 1 + carry_in(1) = 7
        assert_eq!(m.core.regs().get(0), 7);
    }

    #[test]
    fn adc_without_incoming_carry_behaves_like_plain_add() {
        let mut m = machine();
        m.core.flags_mut().c = false;
        m.core.regs_mut().set(1, 5);
        let word = encode_alu(crate::isa::AluOp::Adc, true, 0, 1, 1);
        m.bus.write_word(0, word);
        m.tick();
        assert_eq!(m.core.regs().get(0), 6);
    }

    #[test]
    fn branch_unconditional_sets_pc() {
        let mut m = machine();
        // B +8: bit26=0,bit25=1,L=0,N=0, magnitude=2 (words)
        let word = (0b0000u32 << 28) | (1 << 25) | 2;
        m.bus.write_word(0, word);
        m.tick();
        assert_eq!(m.core.pc(), 8);
    }

    #[test]
    fn bl_stores_return_address_in_lr() {
        let mut m = machine();
        let word = (0b0000u32 << 28) | (1 << 25) | (1 << 24) | 2;
        m.bus.write_word(0, word);
        m.tick();
        assert_eq!(m.core.regs().get(LR), 4);
        assert_eq!(m.core.pc(), 8);
    }

    #[test]
    fn ret_jumps_to_lr() {
        let mut m = machine();
        m.core.regs_mut().set(LR, 0x40);
        let word = (0b0000u32 << 28) | (1 << 27) | (1 << 25) | (1 << 24);
        m.bus.write_word(0, word);
        m.tick();
        assert_eq!(m.core.pc(), 0x40);
    }

    #[test]
    fn store_then_load_word_round_trips() {
        let mut m = machine();
        m.core.regs_mut().set(0, 0x100);
        m.core.regs_mut().set(1, 0xCAFEBABE);
        // RWW: store word. class bits26=0,25=0,24=1,23=1,B=0,W=1,i=1(imm=0).
        // data_reg (R1) at bits[19:16], base_reg (R0) at bits[15:12].
        let store = (0b0000u32 << 28) | (1 << 24) | (1 << 23) | (1 << 21) | (1 << 20) | (1 << 16) | (0 << 12);
        m.bus.write_word(0, store);
        m.tick();
        assert_eq!(m.bus.read_word(0x100), 0xCAFEBABE);
    }

    #[test]
    fn push_pop_round_trip_via_swr_srr() {
        let mut m = machine();
        m.core.regs_mut().set(SP, 0x100);
        m.core.regs_mut().set(1, 0x1234);
        // SWR SP, {R1}: class 26=0,25=0,24=1,23=0,22=1,21=0,W=1
        let push = (0b0000u32 << 28) | (1 << 24) | (1 << 22) | (1 << 20) | ((SP as u32) << 16) | (1 << 1);
        m.bus.write_word(0, push);
        m.tick();
        assert_eq!(m.core.regs().get(SP), 0xFC);

        m.core.regs_mut().set(1, 0);
        // SRR SP, {R1}: W=0
        let pop = (0b0000u32 << 28) | (1 << 24) | (1 << 22) | ((SP as u32) << 16) | (1 << 1);
        m.bus.write_word(4, pop);
        m.tick();
        assert_eq!(m.core.regs().get(1), 0x1234);
        assert_eq!(m.core.regs().get(SP), 0x100);
    }
}
