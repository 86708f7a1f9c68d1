//! Macro definitions and expansion (spec §4.4, Pass C). A macro is an
//! arity (possibly variadic) plus a token-stream body containing `@N`
//! placeholders and an optional `...` variadic tail; expanding one
//! substitutes the invocation's argument token lists back in.
//!
//! The built-in library mirrors the `const_replace` table in the
//! original assembler's header: syntactic sugar that lowers straight to
//! real mnemonics, seeded into the outermost macro scope before any user
//! source is read.

use std::collections::HashMap;

use super::error::AssemblerError;
use super::lexer::Lexer;
use super::token::{Punct, Token, TokenKind};
use crate::isa::Condition;

/// One arity-specific expansion. A macro name may carry more than one
/// (spec's original `const_replace` table lists e.g. `INC` twice, once
/// for arity 1 and once for arity 2); the first variant whose arity
/// matches the call site wins.
#[derive(Clone)]
struct Variant {
    arity: usize,
    variadic: bool,
    body: Vec<Token>,
}

impl Variant {
    fn matches(&self, nargs: usize) -> bool {
        if self.variadic { nargs >= self.arity } else { nargs == self.arity }
    }
}

#[derive(Clone)]
pub struct MacroDef {
    variants: Vec<Variant>,
}

impl MacroDef {
    pub fn user_defined(arity: usize, variadic: bool, body: Vec<Token>) -> Self {
        MacroDef { variants: vec![Variant { arity, variadic, body }] }
    }

    fn from_template(arity: usize, variadic: bool, template: &str) -> Self {
        let mut body = Lexer::tokenize(template).expect("builtin macro template must lex cleanly");
        body.retain(|t| !t.is_eof());
        MacroDef { variants: vec![Variant { arity, variadic, body }] }
    }

    /// Add another arity-specific expansion to this (built-in) macro.
    fn with_variant(mut self, arity: usize, variadic: bool, template: &str) -> Self {
        let mut body = Lexer::tokenize(template).expect("builtin macro template must lex cleanly");
        body.retain(|t| !t.is_eof());
        self.variants.push(Variant { arity, variadic, body });
        self
    }

    /// True if some variant of this macro accepts `nargs` arguments.
    pub fn matches(&self, nargs: usize) -> bool {
        self.variants.iter().any(|v| v.matches(nargs))
    }

    /// Expand this macro against `args` (one token list per argument, in
    /// call order), picking the first variant whose arity matches.
    pub fn expand(&self, args: &[Vec<Token>], call_site: &Token) -> Result<Vec<Token>, AssemblerError> {
        let variant = self.variants.iter().find(|v| v.matches(args.len())).ok_or_else(|| {
            AssemblerError::new(
                call_site.line,
                call_site.column,
                call_site.raw.clone(),
                "wrong number of macro arguments",
            )
        })?;

        let mut out = Vec::new();
        let mut i = 0;
        while i < variant.body.len() {
            let tok = &variant.body[i];
            if tok.punct() == Some(Punct::At) {
                if let Some(TokenKind::Integer(n)) = variant.body.get(i + 1).map(|t| t.kind.clone()) {
                    let index = n as usize;
                    if let Some(arg) = args.get(index) {
                        out.extend(arg.iter().cloned());
                    }
                    i += 2;
                    continue;
                }
            }
            if tok.punct() == Some(Punct::Ellipsis) {
                // The variadic tail always stands for *every* call-site
                // argument (the original's `requiredArgs == -1` path
                // splices in all of `old_args` from its first element),
                // not just the ones past this variant's declared minimum
                // arity — `arity` here is only a lower bound for `matches`.
                for (j, arg) in args.iter().enumerate() {
                    if j > 0 {
                        out.push(comma_like(tok));
                    }
                    out.extend(arg.iter().cloned());
                }
                i += 1;
                continue;
            }
            out.push(tok.clone());
            i += 1;
        }
        out.push(Token { kind: TokenKind::Eol, line: call_site.line, column: call_site.column, raw: String::new() });
        Ok(out)
    }
}

fn comma_like(near: &Token) -> Token {
    Token { kind: TokenKind::Punct(Punct::Comma), line: near.line, column: near.column, raw: ",".into() }
}

/// The full built-in macro library, ready to seed a fresh macro scope.
pub fn builtin_macros() -> HashMap<String, MacroDef> {
    let mut m = HashMap::new();
    let mut add = |name: &str, def: MacroDef| {
        m.insert(name.to_string(), def);
    };

    add("HALT", MacroDef::from_template(0, false, "B 0\n"));

    add("STR", MacroDef::from_template(1, true, "RWW ...\n"));
    add("LDR", MacroDef::from_template(1, true, "RRW ...\n"));
    add("STRB", MacroDef::from_template(1, true, "RWB ...\n"));
    add("LDRB", MacroDef::from_template(1, true, "RRB ...\n"));

    add("PUSH", MacroDef::from_template(1, true, "SWR SP, {...}\n"));
    add("POP", MacroDef::from_template(1, true, "SRR SP, {...}\n"));

    add("OR", MacroDef::from_template(1, true, "ORR ...\n"));

    // `INC`/`DEC` are overloaded by arity, mirroring the original table's
    // two entries per name: `INC r, n` (arity 2) treats `n` as the source
    // operand; `INC r` (arity 1) reuses `r` as both destination and source.
    add(
        "INC",
        MacroDef::from_template(2, false, "ADD @0, @1, 1\n").with_variant(1, false, "ADD @0, @0, 1\n"),
    );
    add(
        "DEC",
        MacroDef::from_template(2, false, "SUB @0, @1, 1\n").with_variant(1, false, "SUB @0, @0, 1\n"),
    );

    // Reuse-destination-as-source sugar, one arity-2 form per opcode
    // (grounded on the same `const_replace` table entries as INC/DEC).
    for op in ["ADD", "SUB", "LSL", "LSR"] {
        add(op, MacroDef::from_template(2, false, &format!("{op} @0, @0, @1\n")));
    }

    // BAL..BLE: one unconditional-syntax branch alias per non-AL
    // condition, forcing the condition via the `?COND` suffix marker
    // rather than requiring the caller to write it out.
    for bits in 1..16u8 {
        let cond = Condition::from_bits(bits);
        for name in cond.names() {
            add(&format!("B{name}"), MacroDef::from_template(1, false, &format!("B @0 ?{name}\n")));
        }
    }

    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::lexer::Lexer;

    fn call_site() -> Token {
        Token { kind: TokenKind::Eol, line: 1, column: 0, raw: String::new() }
    }

    fn arg(src: &str) -> Vec<Token> {
        let mut toks = Lexer::tokenize(src).unwrap();
        toks.retain(|t| !t.is_eof() && !t.is_eol());
        toks
    }

    #[test]
    fn halt_expands_to_branch_zero() {
        let macros = builtin_macros();
        let halt = macros.get("HALT").unwrap();
        let expanded = halt.expand(&[], &call_site()).unwrap();
        assert_eq!(expanded[0].text(), Some("B"));
        assert_eq!(expanded[1].kind, TokenKind::Integer(0));
    }

    #[test]
    fn inc_reuses_destination_as_source() {
        let macros = builtin_macros();
        let inc = macros.get("INC").unwrap();
        let expanded = inc.expand(&[arg("R0")], &call_site()).unwrap();
        assert_eq!(expanded[0].text(), Some("ADD"));
        assert_eq!(expanded[1].kind, TokenKind::Register(0));
        assert_eq!(expanded[3].kind, TokenKind::Register(0));
        assert_eq!(expanded[5].kind, TokenKind::Integer(1));
    }

    #[test]
    fn push_wraps_variadic_args_in_braces() {
        let macros = builtin_macros();
        let push = macros.get("PUSH").unwrap();
        let expanded = push.expand(&[arg("R0"), arg("R1")], &call_site()).unwrap();
        // SWR SP , { R0 , R1 }
        let texts: Vec<_> = expanded.iter().map(|t| t.kind.clone()).collect();
        assert!(texts.contains(&TokenKind::Register(0)));
        assert!(texts.contains(&TokenKind::Register(1)));
        assert!(texts.contains(&TokenKind::Punct(Punct::LBrace)));
        assert!(texts.contains(&TokenKind::Punct(Punct::RBrace)));
    }

    #[test]
    fn conditional_branch_alias_forces_condition_suffix() {
        let macros = builtin_macros();
        let beq = macros.get("BEQ").unwrap();
        let expanded = beq.expand(&[arg("loop")], &call_site()).unwrap();
        assert_eq!(expanded[0].text(), Some("B"));
        assert_eq!(expanded[1].text(), Some("loop"));
        assert_eq!(expanded[2].kind, TokenKind::Punct(Punct::Question));
        assert_eq!(expanded[3].text(), Some("EQ"));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let macros = builtin_macros();
        let inc = macros.get("INC").unwrap();
        assert!(inc.expand(&[], &call_site()).is_err());
    }
}
