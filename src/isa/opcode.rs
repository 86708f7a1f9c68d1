//! The 16-entry ALU/logic opcode table and argument-packing policy.
//!
//! Grounded on the teacher's static-dispatch-table convention (a plain
//! `const` array consulted by both assembler and disassembler) rather than
//! a runtime map: the table is fixed at compile time.

/// One of the 16 ALU/logic opcodes (bits 25..22 of an ALU/logic-class word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Adc,
    Sbb,
    Asl,
    Asr,
    Cmp,
    Cmn,
    Orr,
    And,
    Xor,
    Tst,
    Lsl,
    Lsr,
    Mov,
    Inv,
}

impl AluOp {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Self {
        use AluOp::*;
        const TABLE: [AluOp; 16] = [
            Add, Sub, Adc, Sbb, Asl, Asr, Cmp, Cmn, Orr, And, Xor, Tst, Lsl, Lsr, Mov, Inv,
        ];
        TABLE[(bits & 0xF) as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "ADD",
            AluOp::Sub => "SUB",
            AluOp::Adc => "ADC",
            AluOp::Sbb => "SBB",
            AluOp::Asl => "ASL",
            AluOp::Asr => "ASR",
            AluOp::Cmp => "CMP",
            AluOp::Cmn => "CMN",
            AluOp::Orr => "ORR",
            AluOp::And => "AND",
            AluOp::Xor => "XOR",
            AluOp::Tst => "TST",
            AluOp::Lsl => "LSL",
            AluOp::Lsr => "LSR",
            AluOp::Mov => "MOV",
            AluOp::Inv => "INV",
        }
    }

    /// `CMP`/`CMN`/`TST` always compute flags and never accept `S`.
    pub fn forbids_s(self) -> bool {
        matches!(self, AluOp::Cmp | AluOp::Cmn | AluOp::Tst)
    }

    /// True for additive-family ops (carry/overflow computed from the
    /// sign-extended 33-bit add), false for shifts/logical ops.
    pub fn is_additive(self) -> bool {
        matches!(self, AluOp::Add | AluOp::Sub | AluOp::Adc | AluOp::Sbb | AluOp::Cmp | AluOp::Cmn)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, AluOp::Asl | AluOp::Asr | AluOp::Lsl | AluOp::Lsr)
    }

    pub fn is_move(self) -> bool {
        matches!(self, AluOp::Mov | AluOp::Inv)
    }

    /// Two-operand opcodes pack a 12-bit immediate and a single `rn`;
    /// three-operand opcodes pack an 8-bit immediate and two `rn` fields.
    pub fn is_two_operand(self) -> bool {
        matches!(self, AluOp::Cmp | AluOp::Cmn | AluOp::Tst | AluOp::Mov | AluOp::Inv)
    }

    /// The opposite-sign counterpart used when normalizing a negative
    /// immediate (spec §4.2): `ADD`<->`SUB`, `CMP`<->`CMN`, `MOV`<->`INV`.
    pub fn sign_flip_counterpart(self) -> Option<AluOp> {
        match self {
            AluOp::Add => Some(AluOp::Sub),
            AluOp::Sub => Some(AluOp::Add),
            AluOp::Cmp => Some(AluOp::Cmn),
            AluOp::Cmn => Some(AluOp::Cmp),
            AluOp::Mov => Some(AluOp::Inv),
            AluOp::Inv => Some(AluOp::Mov),
            _ => None,
        }
    }
}

/// The FPU sub-opcode (bits 22..20 when the class is `Fpu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuOp {
    Addf,
    Subf,
    Mulf,
    Divf,
    Itof,
    Ftoi,
    Cmpf,
    Cmpfi,
}

impl FpuOp {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Self {
        use FpuOp::*;
        const TABLE: [FpuOp; 8] = [Addf, Subf, Mulf, Divf, Itof, Ftoi, Cmpf, Cmpfi];
        TABLE[(bits & 0x7) as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            FpuOp::Addf => "ADDF",
            FpuOp::Subf => "SUBF",
            FpuOp::Mulf => "MULF",
            FpuOp::Divf => "DIVF",
            FpuOp::Itof => "ITOF",
            FpuOp::Ftoi => "FTOI",
            FpuOp::Cmpf => "CMPF",
            FpuOp::Cmpfi => "CMPFI",
        }
    }
}

/// How the assembler maps parsed argument tokens onto instruction bit
/// fields (spec GLOSSARY, "Packing type").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    None,
    BranchOffset,
    Reg3,
    Flex3,
    Flex3i,
    Flex2,
    Flex2i,
    Reg2,
    RegList,
}

impl PackType {
    /// Number of comma-separated argument groups this packing expects
    /// (not counting a trailing register list, which is one argument).
    pub fn arity(self) -> Option<usize> {
        match self {
            PackType::None => Some(0),
            PackType::BranchOffset => Some(1),
            PackType::Reg3 | PackType::Flex3 | PackType::Flex3i => Some(3),
            PackType::Flex2 | PackType::Flex2i | PackType::Reg2 => Some(2),
            PackType::RegList => Some(2), // base register + list
        }
    }
}

/// Static metadata the assembler and disassembler share for one mnemonic.
#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    pub mnemonic: &'static str,
    pub packing: PackType,
    pub allow_n: bool,
    pub allow_s: bool,
    pub allow_shift: bool,
}

macro_rules! op {
    ($mnemonic:literal, $packing:expr) => {
        Opcode { mnemonic: $mnemonic, packing: $packing, allow_n: true, allow_s: true, allow_shift: true }
    };
    ($mnemonic:literal, $packing:expr, n=$n:literal, s=$s:literal, shift=$shift:literal) => {
        Opcode { mnemonic: $mnemonic, packing: $packing, allow_n: $n, allow_s: $s, allow_shift: $shift }
    };
}

/// The full static instruction table, keyed by mnemonic. Consulted by the
/// assembler's pass D and by the disassembler. `ADD`/`SUB`/`ADC`/.../`INV`
/// additionally carry their [`AluOp`] via [`Opcode::alu_op`].
pub const OPCODES: &[Opcode] = &[
    op!("ADD", PackType::Flex3i),
    op!("SUB", PackType::Flex3i),
    op!("ADC", PackType::Flex3),
    op!("SBB", PackType::Flex3),
    op!("ASL", PackType::Flex3),
    op!("ASR", PackType::Flex3),
    op!("CMP", PackType::Flex2i, n = true, s = false, shift = true),
    op!("CMN", PackType::Flex2i, n = true, s = false, shift = true),
    op!("ORR", PackType::Flex3),
    op!("AND", PackType::Flex3),
    op!("XOR", PackType::Flex3),
    op!("TST", PackType::Flex2, n = true, s = false, shift = true),
    op!("LSL", PackType::Flex3),
    op!("LSR", PackType::Flex3),
    op!("MOV", PackType::Flex2i),
    op!("INV", PackType::Flex2i),
    op!("B", PackType::BranchOffset, n = true, s = false, shift = false),
    op!("BL", PackType::BranchOffset, n = true, s = false, shift = false),
    op!("RFE", PackType::None, n = true, s = false, shift = false),
    op!("RET", PackType::None, n = true, s = false, shift = false),
    op!("RRW", PackType::Flex3, n = true, s = false, shift = true),
    op!("RWW", PackType::Flex3, n = true, s = false, shift = true),
    op!("RRB", PackType::Flex3, n = true, s = false, shift = true),
    op!("RWB", PackType::Flex3, n = true, s = false, shift = true),
    op!("SRR", PackType::RegList, n = true, s = false, shift = false),
    op!("SWR", PackType::RegList, n = true, s = false, shift = false),
    op!("MVM", PackType::RegList, n = true, s = false, shift = false),
    op!("SWP", PackType::Reg2, n = true, s = false, shift = false),
    op!("ADDF", PackType::Reg3, n = true, s = false, shift = false),
    op!("SUBF", PackType::Reg3, n = true, s = false, shift = false),
    op!("MULF", PackType::Reg3, n = true, s = false, shift = false),
    op!("DIVF", PackType::Reg3, n = true, s = false, shift = false),
    op!("ITOF", PackType::Reg2, n = true, s = false, shift = false),
    op!("FTOI", PackType::Reg2, n = true, s = false, shift = false),
    op!("CMPF", PackType::Reg2, n = true, s = false, shift = false),
    op!("CMPFI", PackType::Reg2, n = true, s = false, shift = false),
];

/// Look up a mnemonic's static metadata.
pub fn lookup(mnemonic: &str) -> Option<&'static Opcode> {
    OPCODES.iter().find(|op| op.mnemonic == mnemonic)
}

impl Opcode {
    /// The ALU sub-opcode, for the 16 ALU/logic mnemonics.
    pub fn alu_op(&self) -> Option<AluOp> {
        use AluOp::*;
        Some(match self.mnemonic {
            "ADD" => Add,
            "SUB" => Sub,
            "ADC" => Adc,
            "SBB" => Sbb,
            "ASL" => Asl,
            "ASR" => Asr,
            "CMP" => Cmp,
            "CMN" => Cmn,
            "ORR" => Orr,
            "AND" => And,
            "XOR" => Xor,
            "TST" => Tst,
            "LSL" => Lsl,
            "LSR" => Lsr,
            "MOV" => Mov,
            "INV" => Inv,
            _ => return None,
        })
    }

    pub fn fpu_op(&self) -> Option<FpuOp> {
        use FpuOp::*;
        Some(match self.mnemonic {
            "ADDF" => Addf,
            "SUBF" => Subf,
            "MULF" => Mulf,
            "DIVF" => Divf,
            "ITOF" => Itof,
            "FTOI" => Ftoi,
            "CMPF" => Cmpf,
            "CMPFI" => Cmpfi,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alu_op_bits_round_trip() {
        for bits in 0..16u8 {
            let op = AluOp::from_bits(bits);
            assert_eq!(op.bits(), bits);
        }
    }

    #[test]
    fn fpu_op_bits_round_trip() {
        for bits in 0..8u8 {
            let op = FpuOp::from_bits(bits);
            assert_eq!(op.bits(), bits);
        }
    }

    #[test]
    fn cmp_cmn_tst_forbid_s() {
        assert!(lookup("CMP").unwrap().allow_s == false);
        assert!(lookup("CMN").unwrap().allow_s == false);
        assert!(lookup("TST").unwrap().allow_s == false);
        assert!(AluOp::Cmp.forbids_s());
        assert!(AluOp::Tst.forbids_s());
        assert!(!AluOp::Add.forbids_s());
    }

    #[test]
    fn ret_rfe_forbid_shift() {
        assert!(!lookup("RET").unwrap().allow_shift);
        assert!(!lookup("RFE").unwrap().allow_shift);
    }

    #[test]
    fn fpu_opcodes_forbid_s_and_shift() {
        for m in ["ADDF", "SUBF", "MULF", "DIVF", "ITOF", "FTOI", "CMPF", "CMPFI"] {
            let op = lookup(m).unwrap();
            assert!(!op.allow_s);
            assert!(!op.allow_shift);
        }
    }

    #[test]
    fn sign_flip_counterparts_are_symmetric() {
        assert_eq!(AluOp::Add.sign_flip_counterpart(), Some(AluOp::Sub));
        assert_eq!(AluOp::Sub.sign_flip_counterpart(), Some(AluOp::Add));
        assert_eq!(AluOp::Mov.sign_flip_counterpart(), Some(AluOp::Inv));
        assert_eq!(AluOp::Orr.sign_flip_counterpart(), None);
    }
}
