//! The assembler driver: sequences passes A-D over a live token stream,
//! owns the two memory-cursor axes (spec §4.4), and is the only thing in
//! `asm` that touches a [`Bus`] directly.
//!
//! Grounded on `L32_L32Assembler.cpp`'s `Assemble()` — a single function
//! that walks a mutable token list front-to-back, dispatching on the
//! shape of whatever sits at the front. This driver keeps that shape: a
//! [`VecDeque<Token>`] plays the role of the original's `TokenList`, and
//! macro/variable substitution splice tokens back onto its front exactly
//! as the source does.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::error::AssemblerError;
use super::expr::{self, EvalResult, LabelLookup};
use super::lexer::Lexer;
use super::macros::{builtin_macros, MacroDef};
use super::parse::{self, ParsedInstr};
use super::scope::{MacroFrame, PendingFixup, ScopeStack};
use super::token::{Punct, Token, TokenKind};
use crate::isa::{self, Condition};
use crate::membus::Bus;

/// A contiguous memory region backing one of the two banks a program can
/// target (spec §4.4, "`#RAM`/`#ROM` bank selection").
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub fn new(base: u32, size: u32) -> Self {
        Region { base, size }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bank {
    Ram,
    Rom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Program,
    Data,
}

/// Wraps the live scope stack so [`Expr::eval`]/`encode_instruction` can
/// resolve labels without the expression/encoder modules needing to know
/// about [`ScopeStack`] at all.
struct ScopeLookup<'a>(&'a ScopeStack);

impl LabelLookup for ScopeLookup<'_> {
    fn lookup(&self, name: &str) -> Option<u32> {
        self.0.lookup_label(name)
    }
}

fn err_tok(tok: &Token, message: impl Into<String>) -> AssemblerError {
    AssemblerError::new(tok.line, tok.column, tok.raw.clone(), message)
}

fn lexically_normal(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Drives the four assembler passes over one or more source files,
/// mutating a [`Bus`] in place as instructions and data literals resolve
/// (spec §4.4, §4.5).
pub struct Assembler {
    scopes: ScopeStack,
    ram: Option<Region>,
    rom: Option<Region>,
    ram_cursor: u32,
    rom_cursor: u32,
    bank: Option<Bank>,
    cur_endpoint: Option<Endpoint>,
    program_start: Option<u32>,
    program_end: Option<u32>,
    data_start: Option<u32>,
    data_end: Option<u32>,
    entry_point: Option<u32>,
    include_stack: Vec<PathBuf>,
    rng: StdRng,
}

impl Assembler {
    /// Builds a fresh assembler. `rom` and `ram` describe whichever banks
    /// actually exist on the target system; either (but not both) may be
    /// absent, matching spec §4.4's "`#RAM`/`#ROM` ... is a hard error
    /// only when `FORCE`d".
    pub fn new(rom: Option<Region>, ram: Option<Region>) -> Self {
        let mut scopes = ScopeStack::new();
        scopes.macros[0] = MacroFrame { macros: builtin_macros() };
        let bank = if rom.is_some() {
            Some(Bank::Rom)
        } else if ram.is_some() {
            Some(Bank::Ram)
        } else {
            None
        };
        Assembler {
            scopes,
            ram,
            rom,
            ram_cursor: 0,
            rom_cursor: 0,
            bank,
            cur_endpoint: None,
            program_start: None,
            program_end: None,
            data_start: None,
            data_end: None,
            entry_point: None,
            include_stack: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    pub fn program_bounds(&self) -> Option<(u32, u32)> {
        match (self.program_start, self.program_end) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }

    pub fn data_bounds(&self) -> Option<(u32, u32)> {
        match (self.data_start, self.data_end) {
            (Some(s), Some(e)) => Some((s, e)),
            _ => None,
        }
    }

    /// Drops every scope but the root (and the built-in macro library),
    /// matching spec §7's "flush scopes before propagating a fatal error"
    /// policy so a caller that catches the error and retries starts clean.
    pub fn flush_scopes(&mut self) {
        self.scopes.reset();
    }

    /// Assembles `source` (from file `path`, used for diagnostics and as
    /// the base directory for `#ASSEMBLE`/`#FILE`/`#LINES`), writing
    /// directly into `bus`. May be called more than once against the same
    /// `Assembler` to link multiple top-level files into one image.
    pub fn assemble(&mut self, bus: &mut Bus, path: &Path, source: &str) -> Result<(), AssemblerError> {
        let normalized = lexically_normal(path);
        if self.include_stack.contains(&normalized) {
            return Err(AssemblerError::new(0, 0, path.display().to_string(), "circular #ASSEMBLE include"));
        }
        self.include_stack.push(normalized);
        let is_root = self.include_stack.len() == 1;

        let result = self.assemble_inner(bus, path, source);
        self.include_stack.pop();

        if is_root {
            if let Err(e) = &result {
                let _ = e;
                self.flush_scopes();
                return result;
            }
            self.retry_all_pending(bus)?;
            let leftover = self.scopes.take_root_pending();
            if let Some(first) = leftover.first() {
                let line = first.line();
                self.flush_scopes();
                return Err(AssemblerError::new(line, 0, String::new(), "undefined label referenced at end of assembly"));
            }
        }

        result
    }

    fn assemble_inner(&mut self, bus: &mut Bus, path: &Path, source: &str) -> Result<(), AssemblerError> {
        let working_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let tokens = Lexer::tokenize(source)?;
        let mut queue: VecDeque<Token> = tokens.into();
        let mut byte_mode = false;
        let mut terminate_mode = true;

        while let Some(tok) = queue.front().cloned() {
            match &tok.kind {
                TokenKind::Eof => {
                    queue.pop_front();
                    break;
                }
                TokenKind::Eol => {
                    queue.pop_front();
                }
                TokenKind::Punct(Punct::Hash) => {
                    self.do_directive(bus, &working_dir, &mut queue, &mut byte_mode, &mut terminate_mode)?;
                    discard_to_eol(&mut queue);
                }
                TokenKind::Punct(Punct::At) => {
                    self.do_function_def(&mut queue)?;
                    discard_to_eol(&mut queue);
                }
                TokenKind::Punct(Punct::Dollar) => {
                    self.do_variable(&mut queue)?;
                }
                TokenKind::Punct(Punct::FuncOpen) => {
                    queue.pop_front();
                    self.scopes.push_macro();
                }
                TokenKind::Punct(Punct::FuncClose) => {
                    queue.pop_front();
                    if self.scopes.pop_macro().is_none() {
                        return Err(err_tok(&tok, "unmatched `}@`"));
                    }
                }
                TokenKind::Punct(Punct::VarOpen) => {
                    queue.pop_front();
                    self.scopes.push_var();
                }
                TokenKind::Punct(Punct::VarClose) => {
                    queue.pop_front();
                    if self.scopes.pop_var().is_none() {
                        return Err(err_tok(&tok, "unmatched `}$`"));
                    }
                }
                TokenKind::Punct(Punct::LabelOpen) => {
                    queue.pop_front();
                    self.scopes.push_label();
                }
                TokenKind::Punct(Punct::LabelClose) => {
                    queue.pop_front();
                    if self.scopes.pop_label().is_none() {
                        return Err(err_tok(&tok, "unmatched `}:`"));
                    }
                }
                TokenKind::Punct(Punct::CondOpen) => {
                    queue.pop_front();
                    let forced = match queue.front().and_then(|t| t.text()) {
                        Some(name) => match Condition::from_name(name) {
                            Some(cond) => {
                                queue.pop_front();
                                Some(cond)
                            }
                            None => None,
                        },
                        None => None,
                    };
                    self.scopes.push_cond(forced);
                }
                TokenKind::Punct(Punct::CondClose) => {
                    queue.pop_front();
                    if self.scopes.pop_cond().is_none() {
                        return Err(err_tok(&tok, "unmatched `}?`"));
                    }
                }
                TokenKind::Text(name) => {
                    if queue.get(1).map(|t| t.punct()) == Some(Some(Punct::Colon)) {
                        self.do_label_def(bus, &mut queue)?;
                    } else if self.is_instruction_like(name) {
                        self.do_instruction(bus, &mut queue)?;
                    } else {
                        self.do_data_literal(bus, &mut queue, byte_mode)?;
                    }
                }
                TokenKind::Integer(_)
                | TokenKind::Float(_)
                | TokenKind::Punct(Punct::Minus)
                | TokenKind::Punct(Punct::Plus)
                | TokenKind::Punct(Punct::Tilde)
                | TokenKind::Punct(Punct::Dot)
                | TokenKind::Punct(Punct::LParen) => {
                    self.do_data_literal(bus, &mut queue, byte_mode)?;
                }
                TokenKind::Str(_) => {
                    self.do_string_literal(bus, &mut queue, terminate_mode)?;
                }
                TokenKind::Register(_) => {
                    return Err(err_tok(&tok, "a register cannot start a statement"));
                }
                _ => {
                    return Err(err_tok(&tok, "unexpected token"));
                }
            }
        }

        Ok(())
    }

    // ---- memory cursor -------------------------------------------------

    fn region(&self, bank: Bank) -> Option<&Region> {
        match bank {
            Bank::Ram => self.ram.as_ref(),
            Bank::Rom => self.rom.as_ref(),
        }
    }

    fn cursor(&self, bank: Bank) -> u32 {
        match bank {
            Bank::Ram => self.ram_cursor,
            Bank::Rom => self.rom_cursor,
        }
    }

    fn set_cursor(&mut self, bank: Bank, value: u32) {
        match bank {
            Bank::Ram => self.ram_cursor = value,
            Bank::Rom => self.rom_cursor = value,
        }
    }

    fn here(&self, tok: &Token) -> Result<u32, AssemblerError> {
        let bank = self.bank.ok_or_else(|| err_tok(tok, "no memory bank selected"))?;
        let region = self.region(bank).ok_or_else(|| err_tok(tok, "no memory bank selected"))?;
        Ok(region.base.wrapping_add(self.cursor(bank)))
    }

    fn region_size(&self, tok: &Token) -> Result<u32, AssemblerError> {
        let bank = self.bank.ok_or_else(|| err_tok(tok, "no memory bank selected"))?;
        Ok(self.region(bank).ok_or_else(|| err_tok(tok, "no memory bank selected"))?.size)
    }

    fn advance(&mut self, n: u32) {
        let bank = self.bank.expect("advance called with no bank selected");
        let c = self.cursor(bank);
        self.set_cursor(bank, c.wrapping_add(n));
    }

    fn ensure_endpoint(&mut self, addr: u32) {
        if self.cur_endpoint.is_none() {
            self.cur_endpoint = Some(Endpoint::Data);
            self.data_start = Some(addr);
            self.data_end = Some(addr);
        }
    }

    fn extend_endpoint(&mut self, end_addr: u32) {
        match self.cur_endpoint.unwrap_or(Endpoint::Data) {
            Endpoint::Program => {
                if self.program_end.is_none_or(|e| end_addr > e) {
                    self.program_end = Some(end_addr);
                }
            }
            Endpoint::Data => {
                if self.data_end.is_none_or(|e| end_addr > e) {
                    self.data_end = Some(end_addr);
                }
            }
        }
    }

    fn track_program(&mut self, addr: u32) {
        if self.program_start.is_none() {
            self.program_start = Some(addr);
        }
        let end = addr.wrapping_add(4);
        if self.program_end.is_none_or(|e| end > e) {
            self.program_end = Some(end);
        }
    }

    fn write_bytes(&mut self, bus: &mut Bus, start: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            bus.write_byte_forced(start.wrapping_add(i as u32), *b);
        }
    }

    // ---- variables -------------------------------------------------

    /// Splices every `$name` reference inside `toks` with that variable's
    /// stored token list, repeating until no `$` remains (a spliced
    /// definition may itself reference another variable).
    fn resolve_variables(&self, toks: &mut Vec<Token>) -> Result<(), AssemblerError> {
        let mut guard = 0;
        loop {
            let Some(i) = toks.iter().position(|t| t.punct() == Some(Punct::Dollar)) else {
                return Ok(());
            };
            guard += 1;
            if guard > 10_000 {
                return Err(err_tok(&toks[i], "variable substitution did not terminate"));
            }
            let name_tok = toks.get(i + 1).cloned().ok_or_else(|| err_tok(&toks[i], "expected a variable name"))?;
            let name = name_tok.text().ok_or_else(|| err_tok(&name_tok, "expected a variable name"))?;
            let replacement = self.scopes.lookup_var(name).ok_or_else(|| err_tok(&name_tok, "variable is undefined"))?.to_vec();
            toks.splice(i..=i + 1, replacement);
        }
    }

    fn do_variable(&mut self, queue: &mut VecDeque<Token>) -> Result<(), AssemblerError> {
        let dollar = queue.pop_front().unwrap();
        let name_tok = queue.pop_front().ok_or_else(|| err_tok(&dollar, "expected a variable name"))?;
        let name = name_tok.text().ok_or_else(|| err_tok(&name_tok, "expected a variable name"))?.to_string();

        if queue.front().and_then(|t| t.punct()) == Some(Punct::Eq) {
            queue.pop_front();
            let mut body = Vec::new();
            while let Some(t) = queue.front() {
                if t.is_eol() || t.is_eof() {
                    break;
                }
                body.push(queue.pop_front().unwrap());
            }
            self.resolve_variables(&mut body)?;
            self.scopes.define_var(name, body);
            return Ok(());
        }

        let replacement = self.scopes.lookup_var(&name).ok_or_else(|| err_tok(&name_tok, "variable is undefined"))?.to_vec();
        for t in replacement.into_iter().rev() {
            queue.push_front(t);
        }
        Ok(())
    }

    // ---- macro / function definitions -------------------------------

    fn do_function_def(&mut self, queue: &mut VecDeque<Token>) -> Result<(), AssemblerError> {
        let at = queue.pop_front().unwrap();
        let name_tok = queue.pop_front().ok_or_else(|| err_tok(&at, "expected a macro name"))?;
        let name = name_tok.text().ok_or_else(|| err_tok(&name_tok, "expected a macro name"))?.to_string();
        if name.chars().next().is_none_or(|c| !c.is_ascii_uppercase()) {
            return Err(err_tok(&name_tok, "macro name must be uppercase"));
        }
        if name.starts_with('N') {
            return Err(err_tok(&name_tok, "macro name cannot start with N"));
        }
        if name.ends_with('S') {
            return Err(err_tok(&name_tok, "macro name cannot end with S"));
        }

        let (arity, variadic) = if queue.front().and_then(|t| t.punct()) == Some(Punct::Lt) {
            queue.pop_front();
            let n_tok = queue.pop_front().ok_or_else(|| err_tok(&name_tok, "expected an arity after `<`"))?;
            let n = match n_tok.kind {
                TokenKind::Integer(v) => v as usize,
                _ => return Err(err_tok(&n_tok, "expected an integer arity")),
            };
            if queue.pop_front().and_then(|t| t.punct()) != Some(Punct::Gt) {
                return Err(err_tok(&n_tok, "expected `>` after arity"));
            }
            (n, false)
        } else {
            (0, true)
        };

        let newop_tok = queue.pop_front().ok_or_else(|| err_tok(&name_tok, "expected a replacement instruction"))?;
        let newop = newop_tok.text().ok_or_else(|| err_tok(&newop_tok, "expected a replacement instruction"))?;
        if newop == "N" || newop == "S" || newop == "NS" {
            return Err(err_tok(&newop_tok, "replacement instruction cannot be bare N/S/NS"));
        }

        let mut body = vec![newop_tok.clone()];
        while let Some(t) = queue.front() {
            if t.is_eol() || t.is_eof() {
                break;
            }
            body.push(queue.pop_front().unwrap());
        }

        {
            let mut probe = body.clone();
            let body_cond = parse::take_condition_suffix(&mut probe)?;
            if body_cond.is_some() && self.scopes.conds.last().unwrap().forced.is_some() {
                return Err(err_tok(&at, "function overwrites the scope condition"));
            }
        }

        for (i, t) in body.iter().enumerate() {
            if t.punct() == Some(Punct::At) {
                if let Some(TokenKind::Integer(n)) = body.get(i + 1).map(|t| t.kind.clone()) {
                    if variadic {
                        return Err(err_tok(t, "this macro is variadic; use `...` instead of `@N`"));
                    }
                    if n as usize >= arity {
                        return Err(err_tok(t, "macro parameter index is out of range"));
                    }
                }
            }
            if t.punct() == Some(Punct::Ellipsis) && !variadic {
                return Err(err_tok(t, "`...` is only valid in a variadic macro"));
            }
        }

        body.push(Token { kind: TokenKind::Eol, line: at.line, column: at.column, raw: String::new() });
        self.scopes.define_macro(name, MacroDef::user_defined(arity, variadic, body));
        Ok(())
    }

    // ---- labels -------------------------------------------------

    fn do_label_def(&mut self, bus: &mut Bus, queue: &mut VecDeque<Token>) -> Result<(), AssemblerError> {
        let name_tok = queue.pop_front().unwrap();
        queue.pop_front(); // the colon
        let name = name_tok.text().unwrap().to_string();
        if self.scopes.labels.last().unwrap().labels.contains_key(&name) {
            return Err(err_tok(&name_tok, format!("duplicate label `{name}`")));
        }
        let addr = self.here(&name_tok)?;
        self.scopes.define_label(name, addr);
        self.retry_all_pending(bus)?;
        Ok(())
    }

    /// Re-attempts every pending fixup in every live label-scope frame
    /// against the scope stack as it now stands. Run after every label
    /// definition (spec §4.4, "resolves every matching pending reference
    /// immediately").
    fn retry_all_pending(&mut self, bus: &mut Bus) -> Result<(), AssemblerError> {
        for i in 0..self.scopes.labels.len() {
            let pending = std::mem::take(&mut self.scopes.labels[i].pending);
            let mut still = Vec::new();
            for fixup in pending {
                if self.try_resolve(bus, &fixup)? {
                    continue;
                }
                still.push(fixup);
            }
            self.scopes.labels[i].pending = still;
        }
        Ok(())
    }

    fn try_resolve(&mut self, bus: &mut Bus, fixup: &PendingFixup) -> Result<bool, AssemblerError> {
        match fixup {
            PendingFixup::Instruction { address, parsed } => {
                match super::encode::encode_instruction(parsed, *address, &ScopeLookup(&self.scopes))? {
                    super::encode::Encoded::Word(w) => {
                        bus.write_word_forced(*address, w);
                        Ok(true)
                    }
                    super::encode::Encoded::Unresolved(_) => Ok(false),
                }
            }
            PendingFixup::Data { address, byte_mode, expr, line } => match expr.eval(*address, &ScopeLookup(&self.scopes)) {
                EvalResult::Value(v) => {
                    check_range(v, *byte_mode, *line)?;
                    write_value(bus, *address, v, *byte_mode);
                    Ok(true)
                }
                EvalResult::Unresolved(_) => Ok(false),
            },
        }
    }

    // ---- instructions -------------------------------------------------

    fn is_instruction_like(&self, raw: &str) -> bool {
        if raw.chars().next().is_none_or(|c| !c.is_ascii_uppercase()) {
            return false;
        }
        let (stripped, _, _) = parse::strip_flags(raw);
        isa::lookup(&stripped).is_some() || self.scopes.lookup_macro(raw).is_some() || self.scopes.lookup_macro(&stripped).is_some()
    }

    fn do_instruction(&mut self, bus: &mut Bus, queue: &mut VecDeque<Token>) -> Result<(), AssemblerError> {
        let call_site = queue.front().cloned().unwrap();
        let mut toks = Vec::new();
        while let Some(t) = queue.front() {
            if t.is_eol() || t.is_eof() {
                break;
            }
            toks.push(queue.pop_front().unwrap());
        }
        self.resolve_variables(&mut toks)?;

        let parsed = self.expand_and_parse(toks, &call_site)?;
        let here = self.here(&call_site)?;
        self.track_program(here);

        match super::encode::encode_instruction(&parsed, here, &ScopeLookup(&self.scopes))? {
            super::encode::Encoded::Word(w) => bus.write_word_forced(here, w),
            super::encode::Encoded::Unresolved(_) => {
                bus.write_word_forced(here, 0);
                self.scopes.add_pending(PendingFixup::Instruction { address: here, parsed });
            }
        }
        self.advance(4);
        Ok(())
    }

    /// Repeatedly matches the statement's mnemonic against the macro
    /// scope stack (exact-arity or variadic fallback), expanding until
    /// the mnemonic resolves to a real opcode or no macro matches at all.
    /// Tracks every macro name used in the chain to reject recursion, and
    /// merges each round's condition/shift suffix into a single pending
    /// value, erroring on a second explicit one (spec §4.4, "Function
    /// overwrites condition/rotation shift").
    fn expand_and_parse(&self, mut toks: Vec<Token>, call_site: &Token) -> Result<ParsedInstr, AssemblerError> {
        let mut pending_cond: Option<Condition> = None;
        let mut pending_shift: Option<u8> = None;
        let mut seen = HashSet::new();

        loop {
            if let Some(c) = parse::take_condition_suffix(&mut toks)? {
                if pending_cond.is_some() {
                    return Err(err_tok(call_site, "function overwrites condition"));
                }
                pending_cond = Some(c);
            }
            if let Some(s) = parse::take_shift_suffix(&mut toks)? {
                if pending_shift.is_some() {
                    return Err(err_tok(call_site, "function overwrites rotation shift"));
                }
                pending_shift = Some(s);
            }

            let head = toks.first().cloned().ok_or_else(|| err_tok(call_site, "expected an instruction"))?;
            let raw_name = head.text().ok_or_else(|| err_tok(&head, "expected an instruction mnemonic"))?.to_string();
            let arg_groups: Vec<Vec<Token>> =
                parse::split_top_level_commas(&toks[1..]).into_iter().map(|s| s.to_vec()).collect();

            if let Some(macro_def) = self.scopes.lookup_macro(&raw_name) {
                if macro_def.matches(arg_groups.len()) {
                    if !seen.insert(raw_name.clone()) {
                        return Err(err_tok(&head, "this function is recursive"));
                    }
                    let mut expanded = macro_def.expand(&arg_groups, &head)?;
                    expanded.retain(|t| !t.is_eol());
                    toks = expanded;
                    continue;
                }
            }

            let scope_cond = self.scopes.conds.last().unwrap().forced;
            if pending_cond.is_some() && scope_cond.is_some() {
                return Err(err_tok(&head, "instruction overwrites the scope condition"));
            }
            let final_cond = pending_cond.or(scope_cond);

            let mut parsed = parse::parse_instruction(toks, final_cond)?;
            if let Some(s) = pending_shift {
                parsed.shift = Some(s);
            }
            return Ok(parsed);
        }
    }

    // ---- data literals -------------------------------------------------

    fn do_data_literal(&mut self, bus: &mut Bus, queue: &mut VecDeque<Token>, byte_mode: bool) -> Result<(), AssemblerError> {
        let first = queue.front().cloned().unwrap();
        let mut toks = Vec::new();
        while let Some(t) = queue.front() {
            if t.is_eol() || t.is_eof() {
                break;
            }
            toks.push(queue.pop_front().unwrap());
        }
        self.resolve_variables(&mut toks)?;

        let (expr, consumed) = expr::parse(&toks)?;
        if consumed != toks.len() {
            return Err(err_tok(&toks[consumed], "unexpected token in data literal"));
        }

        let here = self.here(&first)?;
        if !byte_mode && here % 4 != 0 {
            return Err(err_tok(&first, "word data literal must be word-aligned"));
        }
        self.ensure_endpoint(here);
        let size = if byte_mode { 1 } else { 4 };

        match expr.eval(here, &ScopeLookup(&self.scopes)) {
            EvalResult::Value(v) => {
                check_range(v, byte_mode, first.line)?;
                write_value(bus, here, v, byte_mode);
            }
            EvalResult::Unresolved(_) => {
                self.scopes.add_pending(PendingFixup::Data { address: here, byte_mode, expr, line: first.line });
            }
        }
        self.advance(size);
        self.extend_endpoint(here.wrapping_add(size));
        Ok(())
    }

    fn do_string_literal(&mut self, bus: &mut Bus, queue: &mut VecDeque<Token>, terminate_mode: bool) -> Result<(), AssemblerError> {
        let tok = queue.pop_front().unwrap();
        let text = match &tok.kind {
            TokenKind::Str(s) => s.clone(),
            _ => unreachable!(),
        };
        let here = self.here(&tok)?;
        self.ensure_endpoint(here);

        let mut bytes = text.into_bytes();
        if terminate_mode {
            bytes.push(0);
        }
        self.write_bytes(bus, here, &bytes);
        let len = bytes.len() as u32;
        self.advance(len);
        self.extend_endpoint(here.wrapping_add(len));
        Ok(())
    }

    // ---- preprocessor directives -------------------------------------------------

    fn do_directive(
        &mut self,
        bus: &mut Bus,
        working_dir: &Path,
        queue: &mut VecDeque<Token>,
        byte_mode: &mut bool,
        terminate_mode: &mut bool,
    ) -> Result<(), AssemblerError> {
        let hash = queue.pop_front().unwrap();
        let name_tok = queue.pop_front().ok_or_else(|| err_tok(&hash, "expected a directive name"))?;
        let name = name_tok.text().ok_or_else(|| err_tok(&name_tok, "expected a directive name"))?;

        match name {
            "BYTE" => *byte_mode = true,
            "WORD" => *byte_mode = false,
            "ASCII" => *terminate_mode = false,
            "ASCIZ" => *terminate_mode = true,
            "ENTRY" => {
                if self.entry_point.is_some() {
                    return Err(err_tok(&name_tok, "duplicate #ENTRY"));
                }
                let addr = self.here(&name_tok)?;
                if addr % 4 != 0 {
                    return Err(err_tok(&name_tok, "#ENTRY address must be word-aligned"));
                }
                self.entry_point = Some(addr);
            }
            "PROGRAM" => {
                let addr = self.here(&name_tok)?;
                self.cur_endpoint = Some(Endpoint::Program);
                self.program_start = Some(addr);
                if self.program_end.is_none_or(|e| addr > e) {
                    self.program_end = Some(addr);
                }
            }
            "DATA" => {
                let addr = self.here(&name_tok)?;
                self.cur_endpoint = Some(Endpoint::Data);
                self.data_start = Some(addr);
                if self.data_end.is_none_or(|e| addr > e) {
                    self.data_end = Some(addr);
                }
            }
            "ALIGN" => {
                let n = expect_integer(queue, &name_tok)? as u32;
                if n == 0 {
                    return Err(err_tok(&name_tok, "alignment must be nonzero"));
                }
                let addr = self.here(&name_tok)?;
                let pad = (n - addr % n) % n;
                self.advance(pad);
            }
            "BLOCK" => {
                let n = expect_integer(queue, &name_tok)? as u32;
                if n == 0 {
                    return Err(err_tok(&name_tok, "block size must be nonzero"));
                }
                let addr = self.here(&name_tok)?;
                if n > self.region_size(&name_tok)? {
                    return Err(err_tok(&name_tok, "block is larger than the memory region"));
                }
                self.ensure_endpoint(addr);
                self.write_bytes(bus, addr, &vec![0u8; n as usize]);
                self.advance(n);
                self.extend_endpoint(addr.wrapping_add(n));
            }
            "RAM" | "ROM" => {
                let wants = if name == "RAM" { Bank::Ram } else { Bank::Rom };
                let forced = queue.front().and_then(|t| t.text()) == Some("FORCE");
                if forced {
                    queue.pop_front();
                }
                if self.region(wants).is_none() {
                    if forced {
                        return Err(err_tok(&name_tok, format!("{name} is not available on this system")));
                    }
                    return Ok(());
                }
                self.bank = Some(wants);
            }
            "ASSEMBLE" => {
                let rel = expect_string(queue, &name_tok)?;
                let full = lexically_normal(&working_dir.join(&rel));
                let source = std::fs::read_to_string(&full)
                    .map_err(|e| err_tok(&name_tok, format!("cannot read `{}`: {e}", full.display())))?;
                self.assemble(bus, &full, &source)?;
            }
            "FILE" => {
                let rel = expect_string(queue, &name_tok)?;
                let full = lexically_normal(&working_dir.join(&rel));
                let here = self.here(&name_tok)?;
                if here % 4 != 0 {
                    return Err(err_tok(&name_tok, "#FILE requires a word-aligned address"));
                }
                let bytes = std::fs::read(&full).map_err(|e| err_tok(&name_tok, format!("cannot read `{}`: {e}", full.display())))?;
                self.ensure_endpoint(here);
                bus.write_word_forced(here, bytes.len() as u32);
                self.write_bytes(bus, here.wrapping_add(4), &bytes);
                bus.write_byte_forced(here.wrapping_add(4).wrapping_add(bytes.len() as u32), 0);
                let total = 4 + bytes.len() as u32 + 1;
                self.advance(total);
                self.extend_endpoint(here.wrapping_add(total));
            }
            "LINES" => {
                let rel = expect_string(queue, &name_tok)?;
                let full = lexically_normal(&working_dir.join(&rel));
                let text = std::fs::read_to_string(&full).map_err(|e| err_tok(&name_tok, format!("cannot read `{}`: {e}", full.display())))?;
                let lines: Vec<&str> = text.lines().collect();
                let here = self.here(&name_tok)?;
                self.ensure_endpoint(here);

                let pointer_array_start = here.wrapping_add(4);
                let mut blob_addrs = Vec::with_capacity(lines.len());
                let mut cursor = pointer_array_start.wrapping_add(4 * lines.len() as u32);
                for line in &lines {
                    blob_addrs.push(cursor);
                    cursor = cursor.wrapping_add(line.len() as u32 + 1);
                }

                bus.write_word_forced(here, lines.len() as u32);
                for (i, addr) in blob_addrs.iter().enumerate() {
                    bus.write_word_forced(pointer_array_start.wrapping_add(4 * i as u32), *addr);
                }
                for (line, addr) in lines.iter().zip(blob_addrs.iter()) {
                    self.write_bytes(bus, *addr, line.as_bytes());
                    bus.write_byte_forced(addr.wrapping_add(line.len() as u32), 0);
                }

                let total = cursor.wrapping_sub(here);
                self.advance(total);
                self.extend_endpoint(here.wrapping_add(total));
            }
            "RANDOM" => {
                let n = expect_integer(queue, &name_tok)? as u32;
                let here = self.here(&name_tok)?;
                if n > self.region_size(&name_tok)? {
                    return Err(err_tok(&name_tok, "random fill is larger than the memory region"));
                }
                self.ensure_endpoint(here);
                let mut bytes = vec![0u8; n as usize];
                self.rng.fill_bytes(&mut bytes);
                self.write_bytes(bus, here, &bytes);
                self.advance(n);
                self.extend_endpoint(here.wrapping_add(n));
            }
            "SEED" => {
                if let Some(TokenKind::Integer(v)) = queue.front().map(|t| t.kind.clone()) {
                    queue.pop_front();
                    self.rng = StdRng::seed_from_u64(v);
                } else {
                    self.rng = StdRng::from_entropy();
                }
            }
            other => {
                return Err(err_tok(&name_tok, format!("unknown directive `#{other}`")));
            }
        }
        Ok(())
    }
}

fn discard_to_eol(queue: &mut VecDeque<Token>) {
    while let Some(t) = queue.front() {
        if t.is_eol() || t.is_eof() {
            return;
        }
        queue.pop_front();
    }
}

fn expect_integer(queue: &mut VecDeque<Token>, ctx: &Token) -> Result<u64, AssemblerError> {
    match queue.pop_front() {
        Some(Token { kind: TokenKind::Integer(v), .. }) => Ok(v),
        Some(t) => Err(err_tok(&t, "expected an integer")),
        None => Err(err_tok(ctx, "expected an integer")),
    }
}

fn expect_string(queue: &mut VecDeque<Token>, ctx: &Token) -> Result<String, AssemblerError> {
    match queue.pop_front() {
        Some(Token { kind: TokenKind::Str(s), .. }) => Ok(s),
        Some(t) => Err(err_tok(&t, "expected a quoted path")),
        None => Err(err_tok(ctx, "expected a quoted path")),
    }
}

fn check_range(value: i64, byte_mode: bool, line: usize) -> Result<(), AssemblerError> {
    let (lo, hi) = if byte_mode { (-255, 255) } else { (-4_294_967_295, 4_294_967_295) };
    if value < lo || value > hi {
        return Err(AssemblerError::new(line, 0, value.to_string(), "data literal is out of range"));
    }
    Ok(())
}

fn write_value(bus: &mut Bus, addr: u32, value: i64, byte_mode: bool) {
    if byte_mode {
        bus.write_byte_forced(addr, (value & 0xFF) as u8);
    } else {
        bus.write_word_forced(addr, value as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membus::Mapping;

    fn fresh_bus(len: u32) -> Bus {
        let mut bus = Bus::new();
        bus.register(Mapping::new(0, len), Box::new(crate::devices::Ram::new(len as usize)));
        bus
    }

    fn assemble_ok(src: &str) -> (Assembler, Bus) {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        asm.assemble(&mut bus, Path::new("test.s32"), src).expect("assembly failed");
        (asm, bus)
    }

    #[test]
    fn plain_instruction_encodes_in_place() {
        let (_asm, mut bus) = assemble_ok("ADD R0, R1, 1\n");
        assert_ne!(bus.read_word(0), 0);
    }

    #[test]
    fn forward_label_reference_resolves_on_definition() {
        let (_asm, mut bus) = assemble_ok("B target\nADD R0, R0, 0\ntarget:\nHALT\n");
        let first = bus.read_word(0);
        assert_ne!(first, 0);
    }

    #[test]
    fn macro_expansion_lowers_to_real_opcode() {
        let (_asm, mut bus) = assemble_ok("INC R0\n");
        let w = bus.read_word(0);
        // ADD is ALU class (bit26 set).
        assert_ne!(w & (1 << 26), 0);
    }

    #[test]
    fn data_word_literal_writes_immediately() {
        let (_asm, mut bus) = assemble_ok("#DATA\n42\n");
        assert_eq!(bus.read_word(0), 42);
    }

    #[test]
    fn byte_mode_switches_literal_granularity() {
        let (asm, mut bus) = assemble_ok("#DATA\n#BYTE\n1\n2\n3\n");
        assert_eq!(bus.read_byte(0), 1);
        assert_eq!(bus.read_byte(1), 2);
        assert_eq!(bus.read_byte(2), 3);
        assert_eq!(asm.data_bounds(), Some((0, 3)));
    }

    #[test]
    fn align_advances_cursor_without_writing() {
        let (asm, mut bus) = assemble_ok("#DATA\n#BYTE\n1\n#ALIGN 4\n#WORD\n99\n");
        assert_eq!(bus.read_byte(0), 1);
        assert_eq!(bus.read_word(4), 99);
        assert_eq!(asm.data_bounds(), Some((0, 8)));
    }

    #[test]
    fn unresolved_label_at_end_of_assembly_is_fatal() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "B missing\n");
        assert!(result.is_err());
    }

    #[test]
    fn condition_scope_applies_to_unconditioned_instructions() {
        let (_asm, mut bus) = assemble_ok("?{ EQ\nADD R0, R0, 1\n}?\n");
        let w = bus.read_word(0);
        assert_eq!((w >> 28) & 0xF, Condition::ZS.bits() as u32);
    }

    #[test]
    fn condition_scope_rejects_inner_explicit_condition() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "?{ EQ\nADD R0, R0, 1 ?NE\n}?\n");
        assert!(result.is_err());
    }

    #[test]
    fn ram_directive_is_noop_when_unavailable_and_not_forced() {
        let (_asm, _bus) = assemble_ok("#RAM\nADD R0, R0, 1\n");
    }

    #[test]
    fn forced_unavailable_bank_is_a_hard_error() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "#ROM FORCE\n");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_entry_is_an_error() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "#ENTRY\nHALT\n#ENTRY\n");
        assert!(result.is_err());
    }

    #[test]
    fn unaligned_entry_is_an_error() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "#DATA\n#BYTE\n1\n#ENTRY\n");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_label_in_same_scope_is_an_error() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "loop:\nHALT\nloop:\nHALT\n");
        assert!(result.is_err());
    }

    #[test]
    fn unaligned_word_data_literal_is_an_error() {
        let mut asm = Assembler::new(None, Some(Region::new(0, 256)));
        let mut bus = fresh_bus(256);
        let result = asm.assemble(&mut bus, Path::new("test.s32"), "#DATA\n#BYTE\n1\n#WORD\n99\n");
        assert!(result.is_err());
    }
}
