//! A deliberately tiny expression language standing in for BraneScript in tests.
//!
//! ```text
//! program := stmt ((';' | newline) stmt)*
//! stmt    := IDENT '=' expr | expr
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | INT | STRING | IDENT | IDENT '(' args ')' | '(' expr ')'
//! ```
//!
//! Builtins: `print(..)`, `len(s)`, `str(x)` and `spin()`, which loops until interrupted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bscript_abi::{Diagnostic, Output};
use serde::{Deserialize, Serialize};

pub const BUILTINS: &[(&str, &str)] = &[
    ("len", "len(s) -> int\n\nNumber of characters in the string s."),
    ("print", "print(*values)\n\nWrite the values to stdout, separated by spaces."),
    ("spin", "spin()\n\nLoop until the kernel is interrupted."),
    ("str", "str(x) -> str\n\nString form of x."),
];

pub fn builtin_doc(name: &str) -> Option<&'static str> {
    BUILTINS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, doc)| *doc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Str(String),
    Var {
        name: String,
        pos: Pos,
    },
    Neg(Box<Expr>, Pos),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: Pos,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        pos: Pos,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stmt {
    Assign { name: String, value: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Unit,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Unit => "unit",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Unit => f.write_str("()"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Int(i64),
    Str(String),
    Ident(String),
    Op(char),
    Sep,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Int(n) => write!(f, "{n}"),
            Tok::Str(s) => write!(f, "{s:?}"),
            Tok::Ident(name) => f.write_str(name),
            Tok::Op(c) => write!(f, "{c}"),
            Tok::Sep => f.write_str("end of statement"),
            Tok::Eof => f.write_str("end of input"),
        }
    }
}

/// Why lexing stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LexError {
    UnterminatedString(Pos),
    Unexpected(char, Pos),
    BadInt(Pos),
}

impl LexError {
    fn diagnostic(&self) -> Diagnostic {
        let (message, pos) = match self {
            LexError::UnterminatedString(pos) => ("unterminated string literal".to_string(), pos),
            LexError::Unexpected(c, pos) => (format!("unexpected character '{c}'"), pos),
            LexError::BadInt(pos) => ("integer literal too large".to_string(), pos),
        };
        Diagnostic::new(message)
            .with_kind("SyntaxError")
            .at(pos.line, pos.column)
    }
}

fn lex(source: &str) -> Result<Vec<(Tok, Pos)>, LexError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let (mut line, mut column) = (1u32, 1u32);

    while let Some(&c) = chars.peek() {
        let pos = Pos { line, column };
        if c == '\n' || c == ';' {
            chars.next();
            tokens.push((Tok::Sep, pos));
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        } else if c.is_whitespace() {
            chars.next();
            column += 1;
        } else if c == '#' {
            while chars.peek().is_some_and(|&c| c != '\n') {
                chars.next();
            }
        } else if c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(d);
                chars.next();
                column += 1;
            }
            let n = digits.parse().map_err(|_| LexError::BadInt(pos))?;
            tokens.push((Tok::Int(n), pos));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_alphanumeric() || **d == '_')
            {
                ident.push(d);
                chars.next();
                column += 1;
            }
            tokens.push((Tok::Ident(ident), pos));
        } else if c == '"' {
            chars.next();
            column += 1;
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => {
                        column += 1;
                        break;
                    }
                    Some('\n') | None => return Err(LexError::UnterminatedString(pos)),
                    Some(ch) => {
                        text.push(ch);
                        column += 1;
                    }
                }
            }
            tokens.push((Tok::Str(text), pos));
        } else if "+-*/%=(),".contains(c) {
            chars.next();
            column += 1;
            tokens.push((Tok::Op(c), pos));
        } else {
            return Err(LexError::Unexpected(c, pos));
        }
    }
    tokens.push((Tok::Eof, Pos { line, column }));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Tok, Pos)>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.at].0
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.at + offset).min(last)].0
    }

    fn pos(&self) -> Pos {
        self.tokens[self.at].1
    }

    fn bump(&mut self) -> (Tok, Pos) {
        let token = self.tokens[self.at].clone();
        if self.at + 1 < self.tokens.len() {
            self.at += 1;
        }
        token
    }

    fn unexpected(&self) -> Diagnostic {
        let pos = self.pos();
        Diagnostic::new(format!("unexpected {}", self.peek()))
            .with_kind("SyntaxError")
            .at(pos.line, pos.column)
    }

    fn expect_op(&mut self, op: char) -> Result<(), Diagnostic> {
        if *self.peek() == Tok::Op(op) {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        let mut stmts = Vec::new();
        loop {
            while *self.peek() == Tok::Sep {
                self.bump();
            }
            if *self.peek() == Tok::Eof {
                return Ok(stmts);
            }
            stmts.push(self.stmt()?);
            match self.peek() {
                Tok::Sep | Tok::Eof => {}
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn stmt(&mut self) -> Result<Stmt, Diagnostic> {
        if let (Tok::Ident(name), Tok::Op('=')) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            self.bump();
            self.bump();
            return Ok(Stmt::Assign {
                name,
                value: self.expr()?,
            });
        }
        Ok(Stmt::Expr(self.expr()?))
    }

    fn expr(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.term()?;
        while let Tok::Op(c @ ('+' | '-')) = *self.peek() {
            let (_, pos) = self.bump();
            let op = if c == '+' { BinOp::Add } else { BinOp::Sub };
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, Diagnostic> {
        let mut lhs = self.unary()?;
        while let Tok::Op(c @ ('*' | '/' | '%')) = *self.peek() {
            let (_, pos) = self.bump();
            let op = match c {
                '*' => BinOp::Mul,
                '/' => BinOp::Div,
                _ => BinOp::Rem,
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, Diagnostic> {
        let pos = self.pos();
        match self.peek().clone() {
            Tok::Op('-') => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.unary()?), pos))
            }
            Tok::Int(n) => {
                self.bump();
                Ok(Expr::Int(n))
            }
            Tok::Str(s) => {
                self.bump();
                Ok(Expr::Str(s))
            }
            Tok::Ident(name) => {
                self.bump();
                if *self.peek() != Tok::Op('(') {
                    return Ok(Expr::Var { name, pos });
                }
                self.bump();
                let mut args = Vec::new();
                if *self.peek() != Tok::Op(')') {
                    args.push(self.expr()?);
                    while *self.peek() == Tok::Op(',') {
                        self.bump();
                        args.push(self.expr()?);
                    }
                }
                self.expect_op(')')?;
                Ok(Expr::Call { name, args, pos })
            }
            Tok::Op('(') => {
                self.bump();
                let inner = self.expr()?;
                self.expect_op(')')?;
                Ok(inner)
            }
            _ => Err(self.unexpected()),
        }
    }
}

pub fn parse(source: &str) -> Result<Vec<Stmt>, Diagnostic> {
    let tokens = lex(source).map_err(|err| err.diagnostic())?;
    Parser { tokens, at: 0 }.program()
}

/// Parses `source` and checks that every name is defined, either in `known`
/// or by an earlier assignment in the snippet.
pub fn check(source: &str, known: &BTreeSet<String>) -> Result<Vec<Stmt>, Diagnostic> {
    let program = parse(source)?;
    let mut defined = known.clone();
    for stmt in &program {
        match stmt {
            Stmt::Assign { name, value } => {
                check_expr(value, &defined)?;
                defined.insert(name.clone());
            }
            Stmt::Expr(expr) => check_expr(expr, &defined)?,
        }
    }
    Ok(program)
}

fn check_expr(expr: &Expr, defined: &BTreeSet<String>) -> Result<(), Diagnostic> {
    match expr {
        Expr::Int(_) | Expr::Str(_) => Ok(()),
        Expr::Var { name, pos } if !defined.contains(name) => Err(name_error(name, *pos)),
        Expr::Var { .. } => Ok(()),
        Expr::Neg(inner, _) => check_expr(inner, defined),
        Expr::Binary { lhs, rhs, .. } => {
            check_expr(lhs, defined)?;
            check_expr(rhs, defined)
        }
        Expr::Call { name, args, pos } => {
            if builtin_doc(name).is_none() {
                return Err(name_error(name, *pos));
            }
            args.iter().try_for_each(|arg| check_expr(arg, defined))
        }
    }
}

fn name_error(name: &str, pos: Pos) -> Diagnostic {
    Diagnostic::new(format!("name '{name}' is not defined"))
        .with_kind("NameError")
        .at(pos.line, pos.column)
}

/// Coarse completeness check used by `is_complete`.
pub fn completeness(source: &str) -> Completeness {
    let tokens = match lex(source) {
        Ok(tokens) => tokens,
        Err(LexError::UnterminatedString(_)) => return Completeness::Incomplete,
        Err(_) => return Completeness::Invalid,
    };
    let mut depth = 0i32;
    for (token, _) in &tokens {
        match token {
            Tok::Op('(') => depth += 1,
            Tok::Op(')') => depth -= 1,
            _ => {}
        }
    }
    if depth > 0 {
        return Completeness::Incomplete;
    }
    let last = tokens
        .iter()
        .rev()
        .map(|(token, _)| token)
        .find(|token| !matches!(token, Tok::Sep | Tok::Eof));
    if matches!(last, Some(Tok::Op(op)) if *op != ')') {
        return Completeness::Incomplete;
    }
    match parse(source) {
        Ok(_) => Completeness::Complete,
        Err(_) => Completeness::Invalid,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Incomplete,
    Invalid,
}

/// Failure while evaluating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    Diagnostic(Diagnostic),
    Interrupted,
}

/// Per-instance interpreter state: the variables defined so far.
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    pub vars: BTreeMap<String, Value>,
}

impl Interpreter {
    pub fn known_names(&self) -> BTreeSet<String> {
        self.vars.keys().cloned().collect()
    }

    /// Runs `program`; outputs produced before a failure are returned alongside it.
    pub fn run(
        &mut self,
        program: &[Stmt],
        interrupted: &dyn Fn() -> bool,
    ) -> (Vec<Output>, Option<EvalError>) {
        let mut outputs = Vec::new();
        let last = program.len().saturating_sub(1);
        for (index, stmt) in program.iter().enumerate() {
            let result = match stmt {
                Stmt::Assign { name, value } => self
                    .eval(value, &mut outputs, interrupted)
                    .map(|value| {
                        self.vars.insert(name.clone(), value);
                    }),
                Stmt::Expr(expr) => self.eval(expr, &mut outputs, interrupted).map(|value| {
                    if index == last && value != Value::Unit {
                        outputs.push(Output::value(value.to_string()));
                    }
                }),
            };
            if let Err(err) = result {
                return (outputs, Some(err));
            }
        }
        (outputs, None)
    }

    fn eval(
        &self,
        expr: &Expr,
        outputs: &mut Vec<Output>,
        interrupted: &dyn Fn() -> bool,
    ) -> Result<Value, EvalError> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var { name, pos } => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::Diagnostic(name_error(name, *pos))),
            Expr::Neg(inner, pos) => match self.eval(inner, outputs, interrupted)? {
                Value::Int(n) => n
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| runtime("OverflowError", "integer overflow", *pos)),
                other => Err(type_error(
                    &format!("bad operand type for unary -: '{}'", other.type_name()),
                    *pos,
                )),
            },
            Expr::Binary { op, lhs, rhs, pos } => {
                let lhs = self.eval(lhs, outputs, interrupted)?;
                let rhs = self.eval(rhs, outputs, interrupted)?;
                binary(*op, lhs, rhs, *pos)
            }
            Expr::Call { name, args, pos } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, outputs, interrupted)?);
                }
                self.call(name, values, *pos, outputs, interrupted)
            }
        }
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        pos: Pos,
        outputs: &mut Vec<Output>,
        interrupted: &dyn Fn() -> bool,
    ) -> Result<Value, EvalError> {
        match (name, args.as_slice()) {
            ("print", _) => {
                let line = args
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                outputs.push(Output::stdout(format!("{line}\n")));
                Ok(Value::Unit)
            }
            ("len", [Value::Str(s)]) => Ok(Value::Int(s.chars().count() as i64)),
            ("str", [value]) => Ok(Value::Str(value.to_string())),
            ("spin", []) => loop {
                if interrupted() {
                    return Err(EvalError::Interrupted);
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            },
            _ => Err(type_error(
                &format!("invalid arguments for {name}()"),
                pos,
            )),
        }
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value, pos: Pos) -> Result<Value, EvalError> {
    match (op, lhs, rhs) {
        (BinOp::Add, Value::Str(a), b) => Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, a, Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (op, Value::Int(a), Value::Int(b)) => {
            let result = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div | BinOp::Rem if b == 0 => {
                    return Err(runtime("ZeroDivisionError", "division by zero", pos));
                }
                BinOp::Div => a.checked_div(b),
                BinOp::Rem => a.checked_rem(b),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| runtime("OverflowError", "integer overflow", pos))
        }
        (op, a, b) => Err(type_error(
            &format!(
                "unsupported operand types for {op:?}: '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ),
            pos,
        )),
    }
}

fn runtime(kind: &str, message: &str, pos: Pos) -> EvalError {
    EvalError::Diagnostic(
        Diagnostic::new(message)
            .with_kind(kind)
            .at(pos.line, pos.column),
    )
}

fn type_error(message: &str, pos: Pos) -> EvalError {
    runtime("TypeError", message, pos)
}
