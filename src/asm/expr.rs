//! Constant-expression AST, parser, and evaluator (spec §4.4, Pass B
//! argument expressions). Six binary-precedence levels (loosest to
//! tightest: `|`, `^`, `&`, `<< >>`, `+ -`, `* / %`), unary `- + ~`,
//! parens, and a leading `.` for PC-relative literals. `ROTL`/`ROTR` are
//! deliberately absent here — they're an instruction-trailing rotate
//! suffix (spec §4.2's flex-operand rotate), parsed separately in
//! `parse::take_shift_suffix`, not a constant-expression operator.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(i64),
    /// A bare identifier used where a value is expected: resolved against
    /// the label scope stack at evaluation time.
    Label(String),
    /// The address of the instruction/data literal this expression
    /// belongs to — the operand of a leading `.` (spec "PC-relative
    /// literal").
    Here,
    Neg(Box<Expr>),
    Not(Box<Expr>),
    PcRelative(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

/// Either a resolved value or the name of the label that's still missing,
/// so the caller can register (or re-check) a fixup.
pub enum EvalResult {
    Value(i64),
    Unresolved(String),
}

pub trait LabelLookup {
    fn lookup(&self, name: &str) -> Option<u32>;
}

impl Expr {
    pub fn eval(&self, here: u32, labels: &dyn LabelLookup) -> EvalResult {
        match self {
            Expr::Const(v) => EvalResult::Value(*v),
            Expr::Here => EvalResult::Value(here as i64),
            Expr::Label(name) => match labels.lookup(name) {
                Some(addr) => EvalResult::Value(addr as i64),
                None => EvalResult::Unresolved(name.clone()),
            },
            Expr::Neg(inner) => match inner.eval(here, labels) {
                EvalResult::Value(v) => EvalResult::Value(-v),
                other => other,
            },
            Expr::Not(inner) => match inner.eval(here, labels) {
                EvalResult::Value(v) => EvalResult::Value(!v),
                other => other,
            },
            Expr::PcRelative(inner) => match inner.eval(here, labels) {
                EvalResult::Value(v) => EvalResult::Value(v - here as i64),
                other => other,
            },
            Expr::Bin(op, lhs, rhs) => {
                let l = match lhs.eval(here, labels) {
                    EvalResult::Value(v) => v,
                    other => return other,
                };
                let r = match rhs.eval(here, labels) {
                    EvalResult::Value(v) => v,
                    other => return other,
                };
                EvalResult::Value(apply(*op, l, r))
            }
        }
    }

    /// True if this expression can never resolve without a label lookup
    /// (used to decide whether a data word needs a fixup at all).
    pub fn is_const(&self) -> bool {
        matches!(self.eval(0, &NoLabels), EvalResult::Value(_))
    }
}

struct NoLabels;
impl LabelLookup for NoLabels {
    fn lookup(&self, _name: &str) -> Option<u32> {
        None
    }
}

/// Recursive-descent expression parser over a token slice. `pos` is
/// advanced past whatever was consumed; callers stop at the first token
/// that isn't part of an expression (a comma, closing bracket, EOL, ...).
pub struct ExprParser<'a> {
    toks: &'a [super::token::Token],
    pos: usize,
}

impl<'a> ExprParser<'a> {
    pub fn new(toks: &'a [super::token::Token]) -> Self {
        ExprParser { toks, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<&super::token::Token> {
        self.toks.get(self.pos)
    }

    fn peek_punct(&self) -> Option<super::token::Punct> {
        self.peek().and_then(|t| t.punct())
    }

    fn bump(&mut self) -> Option<&super::token::Token> {
        let t = self.toks.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    pub fn parse(&mut self) -> Result<Expr, super::error::AssemblerError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let mut lhs = self.parse_xor()?;
        while self.peek_punct() == Some(super::token::Punct::Pipe) {
            self.bump();
            let rhs = self.parse_xor()?;
            lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_xor(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let mut lhs = self.parse_and()?;
        while self.peek_punct() == Some(super::token::Punct::Caret) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Bin(BinOp::Xor, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let mut lhs = self.parse_shift()?;
        while self.peek_punct() == Some(super::token::Punct::Amp) {
            self.bump();
            let rhs = self.parse_shift()?;
            lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match self.peek_punct() {
                Some(super::token::Punct::Shl) => BinOp::Shl,
                Some(super::token::Punct::Shr) => BinOp::Shr,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_add()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek_punct() {
                Some(super::token::Punct::Plus) => BinOp::Add,
                Some(super::token::Punct::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_punct() {
                Some(super::token::Punct::Star) => BinOp::Mul,
                Some(super::token::Punct::Slash) => BinOp::Div,
                Some(super::token::Punct::Percent) => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, super::error::AssemblerError> {
        match self.peek_punct() {
            Some(super::token::Punct::Minus) => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(super::token::Punct::Plus) => {
                self.bump();
                self.parse_unary()
            }
            Some(super::token::Punct::Tilde) => {
                self.bump();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(super::token::Punct::Dot) => {
                self.bump();
                Ok(Expr::PcRelative(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, super::error::AssemblerError> {
        let tok = self.peek().cloned().ok_or_else(|| {
            super::error::AssemblerError::new(0, 0, String::new(), "expected an expression")
        })?;

        match &tok.kind {
            super::token::TokenKind::Integer(v) => {
                self.bump();
                Ok(Expr::Const(*v as i64))
            }
            super::token::TokenKind::Text(name) => {
                self.bump();
                Ok(Expr::Label(name.clone()))
            }
            super::token::TokenKind::Punct(super::token::Punct::LParen) => {
                self.bump();
                let inner = self.parse_or()?;
                if self.peek_punct() != Some(super::token::Punct::RParen) {
                    return Err(super::error::AssemblerError::new(
                        tok.line,
                        tok.column,
                        tok.raw.clone(),
                        "unclosed parenthesis",
                    ));
                }
                self.bump();
                Ok(inner)
            }
            _ => Err(super::error::AssemblerError::new(
                tok.line,
                tok.column,
                tok.raw.clone(),
                "expected a number, label, or parenthesized expression",
            )),
        }
    }
}

/// Parse a full expression starting at `toks[0]`, returning the expression
/// and how many tokens it consumed.
pub fn parse(toks: &[super::token::Token]) -> Result<(Expr, usize), super::error::AssemblerError> {
    let mut p = ExprParser::new(toks);
    let expr = p.parse()?;
    Ok((expr, p.pos()))
}

fn apply(op: BinOp, l: i64, r: i64) -> i64 {
    match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div => if r == 0 { 0 } else { l.wrapping_div(r) },
        BinOp::Mod => if r == 0 { 0 } else { l.wrapping_rem(r) },
        BinOp::Shl => ((l as i32).wrapping_shl((r & 0x1F) as u32)) as i64,
        BinOp::Shr => ((l as u32).wrapping_shr((r & 0x1F) as u32)) as i64,
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Map(Vec<(&'static str, u32)>);
    impl LabelLookup for Map {
        fn lookup(&self, name: &str) -> Option<u32> {
            self.0.iter().find(|(n, _)| *n == name).map(|(_, a)| *a)
        }
    }

    #[test]
    fn constants_evaluate_without_labels() {
        let e = Expr::Bin(BinOp::Add, Box::new(Expr::Const(2)), Box::new(Expr::Const(3)));
        match e.eval(0, &Map(vec![])) {
            EvalResult::Value(v) => assert_eq!(v, 5),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn pc_relative_subtracts_here() {
        let e = Expr::PcRelative(Box::new(Expr::Label("loop".into())));
        match e.eval(100, &Map(vec![("loop", 40)])) {
            EvalResult::Value(v) => assert_eq!(v, 40 - 100),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn precedence_matches_c_style_ordering() {
        let toks = crate::asm::lexer::Lexer::tokenize("1 + 2 * 3\n").unwrap();
        let (expr, _) = parse(&toks).unwrap();
        match expr.eval(0, &Map(vec![])) {
            EvalResult::Value(v) => assert_eq!(v, 7),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn parenthesized_grouping_overrides_precedence() {
        let toks = crate::asm::lexer::Lexer::tokenize("(1 + 2) * 3\n").unwrap();
        let (expr, _) = parse(&toks).unwrap();
        match expr.eval(0, &Map(vec![])) {
            EvalResult::Value(v) => assert_eq!(v, 9),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn missing_label_reports_unresolved() {
        let e = Expr::Label("missing".into());
        match e.eval(0, &Map(vec![])) {
            EvalResult::Unresolved(name) => assert_eq!(name, "missing"),
            _ => panic!("expected unresolved"),
        }
    }
}
