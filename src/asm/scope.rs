//! Scope stacks (spec §4.4, "variable / label / macro / condition scope
//! brackets"). Four independent LIFO stacks, one frame pushed per
//! `${ `/`@{ `/`:{ `/`?{ ` opener and popped at its matching closer.
//! Innermost frame wins on lookup; unresolved label references spill to
//! the enclosing frame when their frame closes, so a forward reference
//! inside a scope can still resolve against an outer label defined later.

use std::collections::HashMap;

use super::expr::Expr;
use super::macros::MacroDef;
use super::parse::ParsedInstr;
use crate::isa::Condition;

#[derive(Default)]
pub struct VarFrame {
    pub vars: HashMap<String, Vec<super::token::Token>>,
}

#[derive(Default)]
pub struct LabelFrame {
    pub labels: HashMap<String, u32>,
    /// References recorded while this frame was innermost, not yet
    /// resolved. Spilled to the parent frame when this frame pops.
    pub pending: Vec<PendingFixup>,
}

/// A forward reference the driver couldn't resolve yet. Retried, as a
/// whole, every time a new label is defined — re-running the encoder
/// (for an instruction) or the expression evaluator (for a data literal)
/// rather than patching a single bit-field, since either one may depend
/// on more than just the missing label's address (immediate-fit search,
/// sign normalization).
#[derive(Clone)]
pub enum PendingFixup {
    Instruction { address: u32, parsed: ParsedInstr },
    Data { address: u32, byte_mode: bool, expr: Expr, line: usize },
}

impl PendingFixup {
    pub fn line(&self) -> usize {
        match self {
            PendingFixup::Instruction { parsed, .. } => parsed.line,
            PendingFixup::Data { line, .. } => *line,
        }
    }
}

#[derive(Default)]
pub struct MacroFrame {
    pub macros: HashMap<String, MacroDef>,
}

#[derive(Default)]
pub struct CondFrame {
    pub forced: Option<Condition>,
}

pub struct ScopeStack {
    pub vars: Vec<VarFrame>,
    pub labels: Vec<LabelFrame>,
    pub macros: Vec<MacroFrame>,
    pub conds: Vec<CondFrame>,
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            vars: vec![VarFrame::default()],
            labels: vec![LabelFrame::default()],
            macros: vec![MacroFrame::default()],
            conds: vec![CondFrame::default()],
        }
    }

    pub fn reset(&mut self) {
        self.vars.truncate(1);
        self.vars[0] = VarFrame::default();
        self.labels.truncate(1);
        self.labels[0] = LabelFrame::default();
        // Macro frame 0 (the built-ins) is seeded by the caller and must
        // survive a flush; only drop inner scopes.
        self.macros.truncate(1);
        self.conds.truncate(1);
        self.conds[0] = CondFrame::default();
    }

    pub fn push_var(&mut self) {
        self.vars.push(VarFrame::default());
    }

    pub fn pop_var(&mut self) -> Option<VarFrame> {
        if self.vars.len() > 1 { self.vars.pop() } else { None }
    }

    pub fn push_label(&mut self) {
        self.labels.push(LabelFrame::default());
    }

    /// Pops the innermost label frame, spilling any still-unresolved
    /// references up to the new innermost frame.
    pub fn pop_label(&mut self) -> Option<LabelFrame> {
        if self.labels.len() <= 1 {
            return None;
        }
        let popped = self.labels.pop().unwrap();
        if let Some(parent) = self.labels.last_mut() {
            parent.pending.extend(popped.pending.iter().cloned());
        }
        Some(popped)
    }

    pub fn push_macro(&mut self) {
        self.macros.push(MacroFrame::default());
    }

    pub fn pop_macro(&mut self) -> Option<MacroFrame> {
        if self.macros.len() > 1 { self.macros.pop() } else { None }
    }

    pub fn push_cond(&mut self, forced: Option<Condition>) {
        self.conds.push(CondFrame { forced });
    }

    pub fn pop_cond(&mut self) -> Option<CondFrame> {
        if self.conds.len() > 1 { self.conds.pop() } else { None }
    }

    pub fn lookup_var(&self, name: &str) -> Option<&[super::token::Token]> {
        self.vars.iter().rev().find_map(|f| f.vars.get(name).map(|v| v.as_slice()))
    }

    pub fn define_var(&mut self, name: String, tokens: Vec<super::token::Token>) {
        self.vars.last_mut().unwrap().vars.insert(name, tokens);
    }

    pub fn lookup_label(&self, name: &str) -> Option<u32> {
        self.labels.iter().rev().find_map(|f| f.labels.get(name).copied())
    }

    pub fn define_label(&mut self, name: String, address: u32) {
        self.labels.last_mut().unwrap().labels.insert(name, address);
    }

    pub fn lookup_macro(&self, name: &str) -> Option<&MacroDef> {
        self.macros.iter().rev().find_map(|f| f.macros.get(name))
    }

    pub fn define_macro(&mut self, name: String, def: MacroDef) {
        self.macros.last_mut().unwrap().macros.insert(name, def);
    }

    pub fn active_condition(&self) -> Option<Condition> {
        self.conds.iter().rev().find_map(|f| f.forced)
    }

    pub fn add_pending(&mut self, fixup: PendingFixup) {
        self.labels.last_mut().unwrap().pending.push(fixup);
    }

    pub fn take_root_pending(&mut self) -> Vec<PendingFixup> {
        std::mem::take(&mut self.labels[0].pending)
    }

    /// Set the innermost label frame's pending fixups after a retry pass
    /// (whatever didn't resolve this round).
    pub fn set_innermost_pending(&mut self, pending: Vec<PendingFixup>) {
        self.labels.last_mut().unwrap().pending = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_var_frame_shadows_outer() {
        let mut s = ScopeStack::new();
        s.define_var("x".into(), vec![]);
        s.push_var();
        s.define_var("x".into(), vec![]);
        assert!(s.lookup_var("x").is_some());
        s.pop_var();
        assert!(s.lookup_var("x").is_some());
    }

    #[test]
    fn unresolved_labels_spill_to_parent_on_pop() {
        let mut s = ScopeStack::new();
        s.push_label();
        s.add_pending(PendingFixup::Data {
            address: 0x10,
            byte_mode: false,
            expr: Expr::Label("later".into()),
            line: 1,
        });
        s.pop_label();
        assert_eq!(s.labels[0].pending.len(), 1);
    }

    #[test]
    fn root_scope_cannot_be_popped() {
        let mut s = ScopeStack::new();
        assert!(s.pop_var().is_none());
        assert!(s.pop_label().is_none());
        assert!(s.pop_macro().is_none());
        assert!(s.pop_cond().is_none());
    }

    #[test]
    fn nested_condition_forces_innermost() {
        let mut s = ScopeStack::new();
        s.push_cond(Some(Condition::ZS));
        assert_eq!(s.active_condition(), Some(Condition::ZS));
        s.push_cond(Some(Condition::ZC));
        assert_eq!(s.active_condition(), Some(Condition::ZC));
        s.pop_cond();
        assert_eq!(s.active_condition(), Some(Condition::ZS));
    }
}
