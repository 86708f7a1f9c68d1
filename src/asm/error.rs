//! `AssemblerError` — the structured `{ line_no, line, message }` payload
//! spec §6/§7 require from `assemble(path, source)`, as a `thiserror`
//! enum instead of the source's thrown `FormatException`.

use thiserror::Error;

/// One assembler failure, carrying enough context for a host to print a
/// caret diagnostic: the 1-based line number, the offending token's raw
/// text, and a human-readable message. `column` is 0-based, derived from
/// the token's own span.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{line}:{column}: {message} (near `{raw}`)")]
pub struct AssemblerError {
    pub line: usize,
    pub column: usize,
    pub raw: String,
    pub message: String,
}

impl AssemblerError {
    pub fn new(line: usize, column: usize, raw: impl Into<String>, message: impl Into<String>) -> Self {
        AssemblerError { line, column, raw: raw.into(), message: message.into() }
    }

    pub fn lex(line: usize, column: usize, raw: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(line, column, raw, message)
    }
}
