//! Pass D — turn one parsed instruction into its 32-bit word (spec §4.2,
//! §4.4). Grounded on `L32_L32Assembler.cpp`'s final encoding loop (the
//! `switch (def.packing)` block): same bit-packing rules per `PackType`,
//! the same immediate-fit search, and the same "negative-immediate
//! normalizes by flipping the opcode's low bit" rule for `Flex3i`/`Flex2i`.
//!
//! A reference to an undefined label doesn't fail here — it comes back as
//! [`Encoded::Unresolved`] so the driver can retry once the label exists.

use super::error::AssemblerError;
use super::expr::{EvalResult, LabelLookup};
use super::parse::{Arg, ParsedInstr};
use crate::isa::{self, AluOp, Condition, FpuOp, PackType, Word};

pub enum Encoded {
    Word(Word),
    Unresolved(String),
}

fn err(parsed: &ParsedInstr, message: impl Into<String>) -> AssemblerError {
    AssemblerError::new(parsed.line, parsed.column, parsed.mnemonic.clone(), message)
}

enum FlexOutcome {
    /// Packed in place; `true` if a negative immediate flipped the opcode.
    Done(bool),
    Unresolved(String),
}

/// Pack one flex operand (register or rotated immediate) into `mem` at
/// `field_lo..field_lo+field_bits`, with the register-mode index sitting
/// in the field's own top nibble and the 4-bit rotate field at bits 0..3
/// (spec §4.2).
fn encode_flex(
    mem: &mut Word,
    arg: &Arg,
    field_lo: u32,
    field_bits: u32,
    shift: Option<u8>,
    here: Word,
    labels: &dyn LabelLookup,
    allow_sign_flip: bool,
    parsed: &ParsedInstr,
) -> Result<FlexOutcome, AssemblerError> {
    match arg {
        Arg::Reg(r) => {
            if let Some(s) = shift {
                if s % 2 != 0 {
                    return Err(err(parsed, "register rotation shifts must be even"));
                }
            }
            let reg_lo = field_lo + field_bits - 4;
            *mem |= (*r as Word) << reg_lo;
            *mem |= ((shift.unwrap_or(0) / 2) as Word) & 0xF;
            Ok(FlexOutcome::Done(false))
        }
        Arg::Expr(e) => {
            let value = match e.eval(here, labels) {
                EvalResult::Value(v) => v,
                EvalResult::Unresolved(name) => return Ok(FlexOutcome::Unresolved(name)),
            };
            let (magnitude, flip) = if value < 0 {
                if !allow_sign_flip {
                    return Err(err(parsed, "negative immediate not supported for this opcode"));
                }
                ((value.unsigned_abs()) as u32, true)
            } else {
                (value as u32, false)
            };
            let rotated = magnitude.rotate_left((shift.unwrap_or(0) as u32) & 31);
            let (min_val, field) = isa::find_immediate_encoding(rotated, field_bits)
                .ok_or_else(|| err(parsed, "immediate value is too large"))?;
            *mem |= 1 << 20;
            *mem |= min_val << field_lo;
            *mem |= field & 0xF;
            Ok(FlexOutcome::Done(flip))
        }
        _ => Err(err(parsed, "expected a register or an immediate value")),
    }
}

fn as_reg(arg: &Arg, parsed: &ParsedInstr) -> Result<u8, AssemblerError> {
    match arg {
        Arg::Reg(r) => Ok(*r),
        _ => Err(err(parsed, "expected a register")),
    }
}

fn as_list(arg: &Arg, parsed: &ParsedInstr) -> Result<u16, AssemblerError> {
    match arg {
        Arg::RegList(mask) => Ok(*mask),
        _ => Err(err(parsed, "expected a register list")),
    }
}

fn class_and_op_bits(parsed: &ParsedInstr) -> (Word, bool) {
    // Returns (class-selector bits fixed at assembly time, "i" packing
    // allows sign-flip normalization).
    let alu = isa::lookup(&parsed.mnemonic).and_then(|op| op.alu_op());
    if let Some(op) = alu {
        return ((1 << 26) | ((op.bits() as Word) << 22), true);
    }
    (0, false)
}

/// Encode one parsed instruction at address `here`, resolving label
/// references through `labels`. Returns [`Encoded::Unresolved`] (not an
/// error) when a referenced label doesn't exist yet.
pub fn encode_instruction(
    parsed: &ParsedInstr,
    here: Word,
    labels: &dyn LabelLookup,
) -> Result<Encoded, AssemblerError> {
    let opcode = isa::lookup(&parsed.mnemonic)
        .ok_or_else(|| err(parsed, format!("unknown instruction '{}'", parsed.mnemonic)))?;

    if parsed.n && !opcode.allow_n {
        return Err(err(parsed, "this instruction does not accept the N flag"));
    }
    if parsed.s && !opcode.allow_s {
        return Err(err(parsed, "this instruction does not accept the S flag"));
    }
    if parsed.shift.is_some() && !opcode.allow_shift {
        return Err(err(parsed, "this instruction does not accept a rotation shift"));
    }
    let is_mem_op = matches!(parsed.mnemonic.as_str(), "RRW" | "RWW" | "RRB" | "RWB");
    let expected_arity = if is_mem_op { Some(2) } else { opcode.packing.arity() };
    if let Some(expected) = expected_arity {
        if parsed.args.len() != expected {
            return Err(err(parsed, format!("expected {expected} argument(s)")));
        }
    }

    let cond = parsed.cond.unwrap_or(Condition::AL);
    let mut mem: Word = ((cond.bits() as Word) << 28) | ((parsed.n as Word) << 27) | ((parsed.s as Word) << 21);

    match opcode.packing {
        PackType::None => {
            mem |= branch_class_bits(&parsed.mnemonic);
        }

        PackType::BranchOffset => {
            mem |= branch_class_bits(&parsed.mnemonic);
            let Arg::Expr(e) = &parsed.args[0] else {
                return Err(err(parsed, "expected a branch target"));
            };
            let value = match e.eval(here, labels) {
                EvalResult::Value(v) => v,
                EvalResult::Unresolved(name) => return Ok(Encoded::Unresolved(name)),
            };
            let is_negative = value < 0;
            let magnitude_bytes = (value.unsigned_abs() as u32).rotate_left((parsed.shift.unwrap_or(0) as u32) & 31);
            if magnitude_bytes & 3 != 0 {
                return Err(err(parsed, "branch offset must be word-aligned"));
            }
            if magnitude_bytes > 0x03FF_FFFC {
                return Err(err(parsed, "branch offset is too large"));
            }
            let words = magnitude_bytes >> 2;
            mem |= words;
            if words != 0 && is_negative {
                mem |= 1 << 27;
            }
        }

        PackType::Reg3 => {
            mem = reg3_fpu_bits(&parsed.mnemonic, mem);
            let rd = as_reg(&parsed.args[0], parsed)?;
            let rn = as_reg(&parsed.args[1], parsed)?;
            let rm = as_reg(&parsed.args[2], parsed)?;
            mem |= (rd as Word) << 16;
            mem |= (rn as Word) << 12;
            mem |= (rm as Word) << 8;
        }

        PackType::Reg2 => {
            mem = reg2_class_bits(&parsed.mnemonic, mem);
            let rd = as_reg(&parsed.args[0], parsed)?;
            let rn = as_reg(&parsed.args[1], parsed)?;
            mem |= (rd as Word) << 16;
            mem |= (rn as Word) << 12;
        }

        PackType::RegList => {
            mem = reglist_class_bits(&parsed.mnemonic, mem);
            let base = as_reg(&parsed.args[0], parsed)?;
            let list = as_list(&parsed.args[1], parsed)?;
            mem |= (base as Word) << 16;
            mem |= list as Word;
        }

        PackType::Flex3 | PackType::Flex3i => {
            let (class_bits, is_alu) = class_and_op_bits(parsed);
            mem |= class_bits;
            let allow_sign_flip = matches!(opcode.packing, PackType::Flex3i);

            let (rd, rn, flex_arg) = match (parsed.args.as_slice(), is_alu) {
                ([a, Arg::Mem { base, offset }], false) => {
                    mem |= mem_class_bits(&parsed.mnemonic);
                    // Data register lives at bits[19:16], base register at
                    // bits[15:12] (matches `mem_word`'s `data_reg = reg(w, 16, 4)`
                    // / `base_reg = reg(w, 12, 4)`) — the same slot order as
                    // the ALU's rd/rn, with the data register taking rd's slot.
                    (as_reg(a, parsed)?, *base, Arg::Expr(offset.clone()))
                }
                ([a, b, c], true) => (as_reg(a, parsed)?, as_reg(b, parsed)?, c.clone()),
                _ => return Err(err(parsed, "malformed operand list")),
            };

            mem |= (rd as Word) << 16;
            mem |= (rn as Word) << 12;
            match encode_flex(&mut mem, &flex_arg, 4, 8, parsed.shift, here, labels, allow_sign_flip, parsed)? {
                FlexOutcome::Unresolved(name) => return Ok(Encoded::Unresolved(name)),
                FlexOutcome::Done(flip) => {
                    if flip {
                        mem ^= 1 << 22;
                    }
                }
            }
        }

        PackType::Flex2 | PackType::Flex2i => {
            let (class_bits, _) = class_and_op_bits(parsed);
            mem |= class_bits;
            let allow_sign_flip = matches!(opcode.packing, PackType::Flex2i);

            let rd = as_reg(&parsed.args[0], parsed)?;
            mem |= (rd as Word) << 16;
            match encode_flex(&mut mem, &parsed.args[1], 4, 12, parsed.shift, here, labels, allow_sign_flip, parsed)? {
                FlexOutcome::Unresolved(name) => return Ok(Encoded::Unresolved(name)),
                FlexOutcome::Done(flip) => {
                    if flip {
                        mem ^= 1 << 22;
                    }
                }
            }
        }
    }

    Ok(Encoded::Word(mem))
}

fn branch_class_bits(mnemonic: &str) -> Word {
    let l = matches!(mnemonic, "BL" | "RET");
    (1 << 25) | ((l as Word) << 24)
}

fn mem_class_bits(mnemonic: &str) -> Word {
    let byte_mode = matches!(mnemonic, "RRB" | "RWB");
    let write_mode = matches!(mnemonic, "RWW" | "RWB");
    (1 << 24) | (1 << 23) | ((byte_mode as Word) << 22) | ((write_mode as Word) << 21)
}

fn reglist_class_bits(mnemonic: &str, mut mem: Word) -> Word {
    mem |= 1 << 24;
    match mnemonic {
        "SWR" => mem |= (1 << 22) | (1 << 20),
        "SRR" => mem |= 1 << 22,
        "MVM" => mem |= (1 << 22) | (1 << 21),
        _ => {}
    }
    mem
}

fn reg2_class_bits(mnemonic: &str, mut mem: Word) -> Word {
    match mnemonic {
        "SWP" => mem |= (1 << 24) | (1 << 22) | (1 << 21) | (1 << 20),
        "ITOF" => mem |= (1 << 23) | (FpuOp::Itof.bits() as Word) << 20,
        "FTOI" => mem |= (1 << 23) | (FpuOp::Ftoi.bits() as Word) << 20,
        "CMPF" => mem |= (1 << 23) | (FpuOp::Cmpf.bits() as Word) << 20,
        "CMPFI" => mem |= (1 << 23) | (FpuOp::Cmpfi.bits() as Word) << 20,
        _ => {}
    }
    mem
}

fn reg3_fpu_bits(mnemonic: &str, mem: Word) -> Word {
    let op = match mnemonic {
        "ADDF" => FpuOp::Addf,
        "SUBF" => FpuOp::Subf,
        "MULF" => FpuOp::Mulf,
        "DIVF" => FpuOp::Divf,
        _ => return mem,
    };
    mem | (1 << 23) | ((op.bits() as Word) << 20)
}
