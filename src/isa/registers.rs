//! The 16-entry register name table. Indices 13/14/15 are SP/LR/PC.

/// `SP` — stack pointer.
pub const SP: u8 = 13;
/// `LR` — link register.
pub const LR: u8 = 14;
/// `PC` — program counter.
pub const PC: u8 = 15;

/// Canonical register names by index, `R0`..`R12`, `SP`, `LR`, `PC`.
pub const REGISTER_NAMES: [&str; 16] = [
    "R0", "R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8", "R9", "R10", "R11", "R12", "SP", "LR",
    "PC",
];

/// Resolve a register name (case-sensitive, as produced by the lexer) to
/// its index, or `None` if `name` isn't a reserved register identifier.
pub fn from_name(name: &str) -> Option<u8> {
    REGISTER_NAMES
        .iter()
        .position(|&r| r == name)
        .map(|i| i as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architectural_names_resolve() {
        assert_eq!(from_name("SP"), Some(SP));
        assert_eq!(from_name("LR"), Some(LR));
        assert_eq!(from_name("PC"), Some(PC));
        assert_eq!(from_name("R0"), Some(0));
        assert_eq!(from_name("R12"), Some(12));
        assert_eq!(from_name("R13"), None);
        assert_eq!(from_name("sp"), None);
    }
}
