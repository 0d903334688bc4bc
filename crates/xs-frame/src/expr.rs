//! String expressions over event columns.
//!
//! Selections, variables and weights in the template catalogue are written
//! as expressions: arithmetic (`+ - * /`), comparisons (`== != < <= > >=`),
//! boolean operators (`&& || !`), the literals `true`/`false`, and the
//! functions `abs sqrt log exp pow min max`. Booleans evaluate to `1.0` /
//! `0.0`; a value passes a selection when it is `> 0`.
//!
//! Evaluation is column-wise: each node produces either a constant or a full
//! column, so a constant sub-expression is computed once per batch.

use crate::error::{FrameError, Result};
use crate::frame::EventFrame;

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Column(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(Op, Box<Node>, Box<Node>),
    Call(Builtin, Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    /// Binding power; higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Op::Or => 1,
            Op::And => 2,
            Op::Eq | Op::Ne => 3,
            Op::Lt | Op::Le | Op::Gt | Op::Ge => 4,
            Op::Add | Op::Sub => 5,
            Op::Mul | Op::Div => 6,
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            Op::Or => truth(a > 0.0 || b > 0.0),
            Op::And => truth(a > 0.0 && b > 0.0),
            Op::Eq => truth(a == b),
            Op::Ne => truth(a != b),
            Op::Lt => truth(a < b),
            Op::Le => truth(a <= b),
            Op::Gt => truth(a > b),
            Op::Ge => truth(a >= b),
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" | "fabs" => Builtin::Abs,
            "sqrt" => Builtin::Sqrt,
            "log" => Builtin::Log,
            "exp" => Builtin::Exp,
            "pow" => Builtin::Pow,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Builtin::Abs | Builtin::Sqrt | Builtin::Log | Builtin::Exp => 1,
            Builtin::Pow | Builtin::Min | Builtin::Max => 2,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Builtin::Abs => args[0].abs(),
            Builtin::Sqrt => args[0].sqrt(),
            Builtin::Log => args[0].ln(),
            Builtin::Exp => args[0].exp(),
            Builtin::Pow => args[0].powf(args[1]),
            Builtin::Min => args[0].min(args[1]),
            Builtin::Max => args[0].max(args[1]),
        }
    }
}

// ── Compiled expression ────────────────────────────────────────

/// A parsed expression with its column references resolved to indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    root: Node,
    columns: Vec<String>,
}

impl CompiledExpr {
    /// Parse an expression string.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = lex(source)?;
        if tokens.is_empty() {
            return Err(FrameError::Expression("empty expression".into()));
        }
        let mut p = Parser { tokens: &tokens, pos: 0, columns: Vec::new() };
        let root = p.expression(0)?;
        if let Some(t) = p.tokens.get(p.pos) {
            return Err(FrameError::Expression(format!(
                "unexpected {t:?} after expression in '{source}'"
            )));
        }
        Ok(Self { source: source.to_string(), root, columns: p.columns })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Column names referenced, in order of first use.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether the expression references no column.
    pub fn is_constant(&self) -> bool {
        self.columns.is_empty()
    }

    /// Evaluate for a single event; `values` follows [`CompiledExpr::columns`].
    pub fn eval_row(&self, values: &[f64]) -> f64 {
        eval_row(&self.root, values)
    }

    /// Evaluate over every event of `frame`.
    pub fn eval_frame(&self, frame: &EventFrame) -> Result<Vec<f64>> {
        let cols: Vec<&[f64]> =
            self.columns.iter().map(|c| frame.require(c)).collect::<Result<_>>()?;
        let n = frame.n_rows();
        Ok(match eval_columns(&self.root, &cols) {
            Values::Const(v) => vec![v; n],
            Values::Column(v) => v,
        })
    }
}

// ── Evaluation ─────────────────────────────────────────────────

enum Values {
    Const(f64),
    Column(Vec<f64>),
}

impl Values {
    fn map(self, f: impl Fn(f64) -> f64) -> Values {
        match self {
            Values::Const(v) => Values::Const(f(v)),
            Values::Column(mut v) => {
                v.iter_mut().for_each(|x| *x = f(*x));
                Values::Column(v)
            }
        }
    }

    fn zip(self, other: Values, f: impl Fn(f64, f64) -> f64) -> Values {
        match (self, other) {
            (Values::Const(a), Values::Const(b)) => Values::Const(f(a, b)),
            (Values::Const(a), Values::Column(mut b)) => {
                b.iter_mut().for_each(|x| *x = f(a, *x));
                Values::Column(b)
            }
            (Values::Column(mut a), Values::Const(b)) => {
                a.iter_mut().for_each(|x| *x = f(*x, b));
                Values::Column(a)
            }
            (Values::Column(mut a), Values::Column(b)) => {
                a.iter_mut().zip(b).for_each(|(x, y)| *x = f(*x, y));
                Values::Column(a)
            }
        }
    }

    fn at(&self, i: usize) -> f64 {
        match self {
            Values::Const(v) => *v,
            Values::Column(v) => v[i],
        }
    }
}

fn eval_columns(node: &Node, cols: &[&[f64]]) -> Values {
    match node {
        Node::Const(v) => Values::Const(*v),
        Node::Column(i) => Values::Column(cols[*i].to_vec()),
        Node::Neg(a) => eval_columns(a, cols).map(|x| -x),
        Node::Not(a) => eval_columns(a, cols).map(|x| if x > 0.0 { 0.0 } else { 1.0 }),
        Node::Binary(op, a, b) => {
            let op = *op;
            eval_columns(a, cols).zip(eval_columns(b, cols), move |x, y| op.apply(x, y))
        }
        Node::Call(f, args) => {
            let vals: Vec<Values> = args.iter().map(|a| eval_columns(a, cols)).collect();
            let n = vals.iter().find_map(|v| match v {
                Values::Column(c) => Some(c.len()),
                Values::Const(_) => None,
            });
            let mut buf = vec![0.0; vals.len()];
            match n {
                None => {
                    for (slot, v) in buf.iter_mut().zip(&vals) {
                        *slot = v.at(0);
                    }
                    Values::Const(f.apply(&buf))
                }
                Some(n) => Values::Column(
                    (0..n)
                        .map(|i| {
                            for (slot, v) in buf.iter_mut().zip(&vals) {
                                *slot = v.at(i);
                            }
                            f.apply(&buf)
                        })
                        .collect(),
                ),
            }
        }
    }
}

fn eval_row(node: &Node, vals: &[f64]) -> f64 {
    match node {
        Node::Const(v) => *v,
        Node::Column(i) => vals[*i],
        Node::Neg(a) => -eval_row(a, vals),
        Node::Not(a) => {
            if eval_row(a, vals) > 0.0 {
                0.0
            } else {
                1.0
            }
        }
        Node::Binary(op, a, b) => op.apply(eval_row(a, vals), eval_row(b, vals)),
        Node::Call(f, args) => {
            let args: Vec<f64> = args.iter().map(|a| eval_row(a, vals)).collect();
            f.apply(&args)
        }
    }
}

// ── Lexer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Op(Op),
    Minus,
    Bang,
    LParen,
    RParen,
    Comma,
}

fn lex(src: &str) -> Result<Vec<Tok>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let next = bytes.get(i + 1).map(|&b| b as char);
        let two = match (c, next) {
            ('&', Some('&')) => Some(Tok::Op(Op::And)),
            ('|', Some('|')) => Some(Tok::Op(Op::Or)),
            ('=', Some('=')) => Some(Tok::Op(Op::Eq)),
            ('!', Some('=')) => Some(Tok::Op(Op::Ne)),
            ('<', Some('=')) => Some(Tok::Op(Op::Le)),
            ('>', Some('=')) => Some(Tok::Op(Op::Ge)),
            _ => None,
        };
        if let Some(t) = two {
            out.push(t);
            i += 2;
            continue;
        }
        let single = match c {
            '+' => Some(Tok::Op(Op::Add)),
            '-' => Some(Tok::Minus),
            '*' => Some(Tok::Op(Op::Mul)),
            '/' => Some(Tok::Op(Op::Div)),
            '<' => Some(Tok::Op(Op::Lt)),
            '>' => Some(Tok::Op(Op::Gt)),
            '!' => Some(Tok::Bang),
            '(' => Some(Tok::LParen),
            ')' => Some(Tok::RParen),
            ',' => Some(Tok::Comma),
            _ => None,
        };
        if let Some(t) = single {
            out.push(t);
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < bytes.len() {
                let d = bytes[i] as char;
                let exp_sign = (d == '+' || d == '-')
                    && i > start
                    && matches!(bytes[i - 1] as char, 'e' | 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text = &src[start..i];
            let v = text
                .parse::<f64>()
                .map_err(|_| FrameError::Expression(format!("invalid number '{text}'")))?;
            out.push(Tok::Num(v));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let d = bytes[i] as char;
                if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                    i += 1;
                } else {
                    break;
                }
            }
            out.push(Tok::Ident(src[start..i].to_string()));
            continue;
        }
        return Err(FrameError::Expression(format!(
            "unexpected character '{c}' at offset {i} in '{src}'"
        )));
    }
    Ok(out)
}

// ── Parser (precedence climbing) ───────────────────────────────

struct Parser<'a> {
    tokens: &'a [Tok],
    pos: usize,
    columns: Vec<String>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += usize::from(t.is_some());
        t
    }

    fn expect(&mut self, want: Tok) -> Result<()> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            got => Err(FrameError::Expression(format!("expected {want:?}, got {got:?}"))),
        }
    }

    fn peek_binary(&self) -> Option<Op> {
        match self.peek() {
            Some(Tok::Op(op)) => Some(*op),
            Some(Tok::Minus) => Some(Op::Sub),
            _ => None,
        }
    }

    /// Parse operators binding tighter than `min_prec` (all operators are left-associative).
    fn expression(&mut self, min_prec: u8) -> Result<Node> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek_binary() {
            if op.precedence() <= min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(op.precedence())?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Tok::Bang) => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.unary()?)))
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Node> {
        match self.bump() {
            Some(Tok::Num(v)) => Ok(Node::Const(v)),
            Some(Tok::LParen) => {
                let inner = self.expression(0)?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Ident(name)) if matches!(self.peek(), Some(Tok::LParen)) => {
                self.pos += 1;
                self.call(&name)
            }
            Some(Tok::Ident(name)) => Ok(match name.as_str() {
                "true" => Node::Const(1.0),
                "false" => Node::Const(0.0),
                _ => Node::Column(self.column_index(name)),
            }),
            got => Err(FrameError::Expression(format!(
                "expected number, column or '(', got {got:?}"
            ))),
        }
    }

    fn call(&mut self, name: &str) -> Result<Node> {
        let f = Builtin::lookup(name)
            .ok_or_else(|| FrameError::Expression(format!("unknown function '{name}'")))?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Some(Tok::RParen)) {
            args.push(self.expression(0)?);
            while matches!(self.peek(), Some(Tok::Comma)) {
                self.pos += 1;
                args.push(self.expression(0)?);
            }
        }
        self.expect(Tok::RParen)?;
        if args.len() != f.arity() {
            return Err(FrameError::Expression(format!(
                "function '{name}' takes {} argument(s), got {}",
                f.arity(),
                args.len()
            )));
        }
        Ok(Node::Call(f, args))
    }

    fn column_index(&mut self, name: String) -> usize {
        match self.columns.iter().position(|c| *c == name) {
            Some(i) => i,
            None => {
                self.columns.push(name);
                self.columns.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn row(src: &str, vals: &[f64]) -> f64 {
        CompiledExpr::compile(src).unwrap().eval_row(vals)
    }

    #[test]
    fn precedence_and_associativity() {
        assert_relative_eq!(row("2 + 3 * 4", &[]), 14.0);
        assert_relative_eq!(row("10 - 4 - 3", &[]), 3.0);
        assert_relative_eq!(row("8 / 4 / 2", &[]), 1.0);
        assert_relative_eq!(row("(1 + 2) * (3 + 4)", &[]), 21.0);
        assert_relative_eq!(row("-2 * -3", &[]), 6.0);
        assert_relative_eq!(row("1.5e2 + 3.0E-1", &[]), 150.3, epsilon = 1e-12);
    }

    #[test]
    fn columns_in_first_use_order() {
        let e = CompiledExpr::compile("weightSpline * weightTune * weightSpline").unwrap();
        assert_eq!(e.columns(), ["weightSpline", "weightTune"]);
        assert_relative_eq!(e.eval_row(&[2.0, 3.0]), 12.0);
        assert!(!e.is_constant());
    }

    #[test]
    fn selections() {
        let e = CompiledExpr::compile("nslice == 1 && reco_e > 0.2 || !contained").unwrap();
        assert_eq!(e.columns(), ["nslice", "reco_e", "contained"]);
        assert_eq!(e.eval_row(&[1.0, 0.5, 1.0]), 1.0);
        assert_eq!(e.eval_row(&[2.0, 0.5, 1.0]), 0.0);
        assert_eq!(e.eval_row(&[2.0, 0.5, 0.0]), 1.0);
        assert_eq!(row("true && !false", &[]), 1.0);
        assert_eq!(row("3 != 3", &[]), 0.0);
    }

    #[test]
    fn builtins_and_arity() {
        assert_relative_eq!(row("sqrt(x)", &[16.0]), 4.0);
        assert_relative_eq!(row("pow(x, 3)", &[2.0]), 8.0);
        assert_relative_eq!(row("max(a, min(b, 1))", &[0.5, 7.0]), 1.0);
        assert_relative_eq!(row("abs(-x)", &[2.5]), 2.5);
        assert!(CompiledExpr::compile("pow(x)").is_err());
        assert!(CompiledExpr::compile("hypot(x, y)").is_err());
    }

    #[test]
    fn parse_errors() {
        assert!(CompiledExpr::compile("").is_err());
        assert!(CompiledExpr::compile("x +").is_err());
        assert!(CompiledExpr::compile("(x").is_err());
        assert!(CompiledExpr::compile("x y").is_err());
        assert!(CompiledExpr::compile("x $ 2").is_err());
    }

    #[test]
    fn frame_evaluation_broadcasts_constants() {
        let frame = EventFrame::new()
            .with_column("a", vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_column("b", vec![10.0, 20.0, 30.0])
            .unwrap();
        let e = CompiledExpr::compile("a + b * 2").unwrap();
        assert_eq!(e.eval_frame(&frame).unwrap(), vec![21.0, 42.0, 63.0]);
        let c = CompiledExpr::compile("max(1, 2) * 0.5").unwrap();
        assert_eq!(c.eval_frame(&frame).unwrap(), vec![1.0, 1.0, 1.0]);
        let mixed = CompiledExpr::compile("min(a, 2)").unwrap();
        assert_eq!(mixed.eval_frame(&frame).unwrap(), vec![1.0, 2.0, 2.0]);
    }

    #[test]
    fn missing_column_is_reported() {
        let frame = EventFrame::new().with_column("a", vec![1.0]).unwrap();
        let e = CompiledExpr::compile("a * knobRPAup").unwrap();
        match e.eval_frame(&frame) {
            Err(FrameError::MissingColumn(c)) => assert_eq!(c, "knobRPAup"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
