//! Allow-listed expression language for derived (callable) columns.
//!
//! The grammar is intentionally small: literals, scope variables, member and
//! index access, arithmetic, comparisons, boolean operators and a fixed table
//! of pure functions. Only variables bound in a [`Scope`] are visible.
//!
//! ```text
//! or      := and ("||" and)*
//! and     := eq ("&&" eq)*
//! eq      := cmp (("==" | "!=") cmp)*
//! cmp     := add (("<" | "<=" | ">" | ">=") add)*
//! add     := mul (("+" | "-") mul)*
//! mul     := unary (("*" | "/" | "%") unary)*
//! unary   := ("-" | "!") unary | postfix
//! postfix := primary ("." ident | "[" or "]")*
//! primary := literal | ident | ident "(" args ")" | "(" or ")"
//! ```

use crate::template::render_value;
use serde_json::{Number, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number literal: {0}")]
    InvalidNumber(String),
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("function {name} expects {expected} arguments, got {actual}")]
    Arity {
        name: String,
        expected: &'static str,
        actual: usize,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExprError::UnexpectedToken(format!("{token:?}"))),
    }
}

pub fn evaluate(source: &str, scope: &Scope) -> Result<Value, ExprError> {
    parse(source)?.evaluate(scope)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Symbol(Symbol),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                if chars[i] == '.' {
                    // `1.foo` is not a number continuation
                    if is_float || !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                        break;
                    }
                    is_float = true;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                text.parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?
            } else {
                text.parse::<i64>()
                    .map(Token::Int)
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?
            };
            tokens.push(token);
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(ExprError::UnterminatedString);
                };
                i += 1;
                match ch {
                    '\\' => {
                        let Some(&escaped) = chars.get(i) else {
                            return Err(ExprError::UnterminatedString);
                        };
                        i += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    ch if ch == quote => break,
                    ch => text.push(ch),
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }
        let next = chars.get(i + 1).copied();
        let (symbol, width) = match (c, next) {
            ('=', Some('=')) => (Symbol::EqEq, 2),
            ('!', Some('=')) => (Symbol::NotEq, 2),
            ('<', Some('=')) => (Symbol::Le, 2),
            ('>', Some('=')) => (Symbol::Ge, 2),
            ('&', Some('&')) => (Symbol::AndAnd, 2),
            ('|', Some('|')) => (Symbol::OrOr, 2),
            ('<', _) => (Symbol::Lt, 1),
            ('>', _) => (Symbol::Gt, 1),
            ('!', _) => (Symbol::Bang, 1),
            ('+', _) => (Symbol::Plus, 1),
            ('-', _) => (Symbol::Minus, 1),
            ('*', _) => (Symbol::Star, 1),
            ('/', _) => (Symbol::Slash, 1),
            ('%', _) => (Symbol::Percent, 1),
            ('(', _) => (Symbol::LParen, 1),
            (')', _) => (Symbol::RParen, 1),
            ('[', _) => (Symbol::LBracket, 1),
            (']', _) => (Symbol::RBracket, 1),
            (',', _) => (Symbol::Comma, 1),
            ('.', _) => (Symbol::Dot, 1),
            _ => return Err(ExprError::UnexpectedChar(c, i)),
        };
        tokens.push(Token::Symbol(symbol));
        i += width;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, symbol: Symbol) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, symbol: Symbol) -> Result<(), ExprError> {
        match self.next() {
            Some(Token::Symbol(found)) if found == symbol => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken(format!("{token:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(Symbol, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExprError>,
    ) -> Result<Expr, ExprError> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in ops {
                if self.eat(*symbol) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[(Symbol::OrOr, BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(&[(Symbol::AndAnd, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[(Symbol::EqEq, BinaryOp::Eq), (Symbol::NotEq, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[
                (Symbol::Le, BinaryOp::Le),
                (Symbol::Ge, BinaryOp::Ge),
                (Symbol::Lt, BinaryOp::Lt),
                (Symbol::Gt, BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[(Symbol::Plus, BinaryOp::Add), (Symbol::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        self.binary_level(
            &[
                (Symbol::Star, BinaryOp::Mul),
                (Symbol::Slash, BinaryOp::Div),
                (Symbol::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(Symbol::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat(Symbol::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(Symbol::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    Some(token) => return Err(ExprError::UnexpectedToken(format!("{token:?}"))),
                    None => return Err(ExprError::UnexpectedEnd),
                }
            } else if self.eat(Symbol::LBracket) {
                let index = self.or()?;
                self.expect(Symbol::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(float(f)?)),
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.eat(Symbol::LParen) => {
                    let mut args = Vec::new();
                    if !self.eat(Symbol::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.eat(Symbol::RParen) {
                                break;
                            }
                            self.expect(Symbol::Comma)?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Variable(name)),
            },
            Some(Token::Symbol(Symbol::LParen)) => {
                let expr = self.or()?;
                self.expect(Symbol::RParen)?;
                Ok(expr)
            }
            Some(token) => Err(ExprError::UnexpectedToken(format!("{token:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

impl Expr {
    pub fn evaluate(&self, scope: &Scope) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Variable(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Member(target, name) => match target.evaluate(scope)? {
                Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                other => Err(ExprError::Type(format!("cannot read .{name} of {other}"))),
            },
            Expr::Index(target, index) => {
                let target = target.evaluate(scope)?;
                let index = index.evaluate(scope)?;
                match (target, index) {
                    (Value::Object(map), Value::String(key)) => {
                        Ok(map.get(&key).cloned().unwrap_or(Value::Null))
                    }
                    (Value::Array(items), Value::Number(n)) => Ok(n
                        .as_u64()
                        .and_then(|i| items.get(i as usize).cloned())
                        .unwrap_or(Value::Null)),
                    (Value::Null, _) => Ok(Value::Null),
                    (target, index) => Err(ExprError::Type(format!(
                        "cannot index {target} with {index}"
                    ))),
                }
            }
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&inner.evaluate(scope)?))),
            Expr::Unary(UnaryOp::Neg, inner) => match inner.evaluate(scope)? {
                Value::Number(n) => match n.as_i64().and_then(i64::checked_neg) {
                    Some(i) => Ok(Value::from(i)),
                    None => float(-as_f64(&n)),
                },
                other => Err(ExprError::Type(format!("cannot negate {other}"))),
            },
            Expr::Binary(BinaryOp::And, left, right) => {
                let left = left.evaluate(scope)?;
                if !truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&right.evaluate(scope)?)))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                let left = left.evaluate(scope)?;
                if truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&right.evaluate(scope)?)))
            }
            Expr::Binary(op, left, right) => {
                binary(*op, left.evaluate(scope)?, right.evaluate(scope)?)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, args)
            }
        }
    }
}

fn float(f: f64) -> Result<Value, ExprError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type(format!("{f} is not a finite number")))
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => as_f64(n) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => as_f64(a).partial_cmp(&as_f64(b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| ExprError::Type(format!("cannot compare {left} and {right}")))?;
            return Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }));
        }
        _ => {}
    }
    if op == BinaryOp::Add && (left.is_string() || right.is_string()) {
        return Ok(Value::String(render_value(&left) + &render_value(&right)));
    }
    let (Value::Number(a), Value::Number(b)) = (&left, &right) else {
        return Err(ExprError::Type(format!(
            "arithmetic needs numbers, got {left} and {right}"
        )));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div if b == 0 => return Err(ExprError::DivisionByZero),
            BinaryOp::Rem if b == 0 => return Err(ExprError::DivisionByZero),
            BinaryOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinaryOp::Div => None,
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        if let Some(result) = result {
            return Ok(Value::from(result));
        }
    }
    let (a, b) = (as_f64(a), as_f64(b));
    match op {
        BinaryOp::Add => float(a + b),
        BinaryOp::Sub => float(a - b),
        BinaryOp::Mul => float(a * b),
        BinaryOp::Div if b == 0.0 => Err(ExprError::DivisionByZero),
        BinaryOp::Div => float(a / b),
        BinaryOp::Rem if b == 0.0 => Err(ExprError::DivisionByZero),
        BinaryOp::Rem => float(a % b),
        _ => Err(ExprError::Type(format!("unsupported operator {op:?}"))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => as_f64(a) == as_f64(b),
        _ => left == right,
    }
}

fn expect_args(name: &str, args: &[Value], expected: &'static str, ok: bool) -> Result<(), ExprError> {
    if ok {
        Ok(())
    } else {
        Err(ExprError::Arity {
            name: name.to_owned(),
            expected,
            actual: args.len(),
        })
    }
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, ExprError> {
    value
        .as_str()
        .ok_or_else(|| ExprError::Type(format!("{name} expects a string, got {value}")))
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    match name {
        "upper" | "lower" | "trim" => {
            expect_args(name, &args, "1", args.len() == 1)?;
            let text = string_arg(name, &args[0])?;
            Ok(Value::String(match name {
                "upper" => text.to_uppercase(),
                "lower" => text.to_lowercase(),
                _ => text.trim().to_owned(),
            }))
        }
        "len" => {
            expect_args(name, &args, "1", args.len() == 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(ExprError::Type(format!("len of {other}"))),
            };
            Ok(Value::from(len as u64))
        }
        "str" => {
            expect_args(name, &args, "1", args.len() == 1)?;
            Ok(Value::String(render_value(&args[0])))
        }
        "concat" => Ok(Value::String(args.iter().map(render_value).collect())),
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "default" => {
            expect_args(name, &args, "2", args.len() == 2)?;
            let mut args = args.into_iter();
            let value = args.next().unwrap_or(Value::Null);
            let fallback = args.next().unwrap_or(Value::Null);
            let empty = value.is_null() || value.as_str().is_some_and(str::is_empty);
            Ok(if empty { fallback } else { value })
        }
        "replace" => {
            expect_args(name, &args, "3", args.len() == 3)?;
            let text = string_arg(name, &args[0])?;
            let from = string_arg(name, &args[1])?;
            let to = string_arg(name, &args[2])?;
            Ok(Value::String(text.replace(from, to)))
        }
        "join" => {
            expect_args(name, &args, "2", args.len() == 2)?;
            let Value::Array(items) = &args[0] else {
                return Err(ExprError::Type(format!("join expects an array, got {}", args[0])));
            };
            let separator = string_arg(name, &args[1])?;
            Ok(Value::String(
                items.iter().map(render_value).collect::<Vec<_>>().join(separator),
            ))
        }
        _ => Err(ExprError::UnknownFunction(name.to_owned())),
    }
}
