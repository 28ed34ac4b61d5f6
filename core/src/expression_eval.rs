//! Predicate expressions for conditional transitions
//!
//! Conditional transitions and `expression` conditions carry a small
//! boolean expression such as `result.approved == true`. The string is
//! compiled once, when the workflow definition is loaded, into a
//! [`Predicate`] holding its AST; evaluating it afterwards never re-parses.
//!
//! # Supported Expressions
//!
//! - **Path Access**: `result.approved`, `data.editorResult.decision`, `items.0.id`
//! - **Comparisons**: `==`, `!=`, `===`, `!==`, `>`, `<`, `>=`, `<=`
//! - **Boolean Operators**: `&&`, `||`, `!`
//! - **Numeric Operations**: `+`, `-`, `*`, `/`
//! - **Literals**: single or double quoted strings, numbers, booleans, null
//!
//! Identifiers may contain `-` so hyphenated keys such as step names can be
//! addressed; write subtraction with surrounding spaces.
//!
//! A path that does not resolve evaluates to `null`, so
//! `result.approved == true` is simply false for a result without that
//! field.
//!
//! # Example
//!
//! ```rust
//! use quire_core::expression_eval::{EvalContext, Predicate};
//! use serde_json::json;
//!
//! let predicate = Predicate::compile("result.decision === 'approve'").unwrap();
//! let ctx = EvalContext::new().with_root("result", json!({"decision": "approve"}));
//! assert!(predicate.test(&ctx).unwrap());
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur while compiling or evaluating a predicate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Parse error at position {position}: {message}")]
    ParseError { position: usize, message: String },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Empty expression")]
    EmptyExpression,
}

pub type EvalResult<T> = Result<T, EvalError>;

// ============================================================================
// EVALUATION CONTEXT
// ============================================================================

/// Named JSON roots a predicate may reference (`result`, `data`, ...)
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    roots: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose only root is a step's `result`.
    pub fn for_result(result: &Value) -> Self {
        Self::new().with_root("result", result.clone())
    }

    pub fn with_root(mut self, name: &str, value: Value) -> Self {
        self.roots.insert(name.to_string(), value);
        self
    }

    /// Resolve a dotted path; the first segment selects the root.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let root = self.roots.get(parts.next()?)?;
        parts.try_fold(root, |value, part| match value {
            Value::Object(map) => map.get(part),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        })
    }
}

// ============================================================================
// AST TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),

    /// Dotted path reference, e.g. `result.approved`
    Path(String),

    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    Unary { op: UnaryOp, expr: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

// ============================================================================
// TOKENIZER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Op(BinaryOp),
    Not,
    Minus,
    LParen,
    RParen,
    Dot,
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
            pos: 0,
        }
    }

    fn error(&self, position: usize, message: impl Into<String>) -> EvalError {
        EvalError::ParseError {
            position,
            message: message.into(),
        }
    }

    /// Consume `c` if it is next.
    fn eat(&mut self, c: char) -> bool {
        if self.chars.peek().map(|(_, n)| *n) == Some(c) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> EvalResult<Token> {
        while self.chars.peek().map_or(false, |(_, c)| c.is_whitespace()) {
            self.chars.next();
        }

        let (pos, ch) = match self.chars.next() {
            Some(next) => next,
            None => return Ok(Token::Eof),
        };
        self.pos = pos;

        let token = match ch {
            '+' => Token::Op(BinaryOp::Add),
            '-' => Token::Minus,
            '*' => Token::Op(BinaryOp::Mul),
            '/' => Token::Op(BinaryOp::Div),
            '(' => Token::LParen,
            ')' => Token::RParen,
            '.' => Token::Dot,
            '=' => {
                if !self.eat('=') {
                    return Err(self.error(pos, "Expected '==' for equality comparison"));
                }
                // `===` is accepted as a synonym; there is no loose equality.
                self.eat('=');
                Token::Op(BinaryOp::Eq)
            }
            '!' => {
                if self.eat('=') {
                    self.eat('=');
                    Token::Op(BinaryOp::Ne)
                } else {
                    Token::Not
                }
            }
            '<' => Token::Op(if self.eat('=') { BinaryOp::Le } else { BinaryOp::Lt }),
            '>' => Token::Op(if self.eat('=') { BinaryOp::Ge } else { BinaryOp::Gt }),
            '&' => {
                if !self.eat('&') {
                    return Err(self.error(pos, "Expected '&&' for logical AND"));
                }
                Token::Op(BinaryOp::And)
            }
            '|' => {
                if !self.eat('|') {
                    return Err(self.error(pos, "Expected '||' for logical OR"));
                }
                Token::Op(BinaryOp::Or)
            }
            '"' | '\'' => self.read_string(ch)?,
            '0'..='9' => self.read_number(pos, ch)?,
            c if c.is_alphabetic() || c == '_' => self.read_identifier(ch),
            _ => return Err(self.error(pos, format!("Unexpected character: '{}'", ch))),
        };
        Ok(token)
    }

    fn read_string(&mut self, quote: char) -> EvalResult<Token> {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(Token::Str(s)),
                Some((pos, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, c)) if c == '\\' || c == '"' || c == '\'' => s.push(c),
                    Some((_, c)) => {
                        return Err(self.error(pos, format!("Unknown escape sequence: \\{}", c)))
                    }
                    None => return Err(self.error(self.src.len(), "Unterminated string")),
                },
                Some((_, c)) => s.push(c),
                None => return Err(self.error(self.src.len(), "Unterminated string")),
            }
        }
    }

    fn read_number(&mut self, start: usize, first: char) -> EvalResult<Token> {
        let mut s = first.to_string();
        while let Some(&(i, c)) = self.chars.peek() {
            // A dot only belongs to the number when a digit follows it.
            let fraction = c == '.'
                && self.src[i + 1..]
                    .chars()
                    .next()
                    .map_or(false, |d| d.is_ascii_digit());
            if c.is_ascii_digit() || fraction {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        s.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(start, format!("Invalid number: {}", s)))
    }

    fn read_identifier(&mut self, first: char) -> Token {
        let mut s = first.to_string();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        match s.as_str() {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            "null" | "undefined" => Token::Null,
            _ => Token::Ident(s),
        }
    }
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> EvalResult<Self> {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token()?;
        Ok(Self { lexer, current })
    }

    fn advance(&mut self) -> EvalResult<()> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn parse(mut self) -> EvalResult<Expr> {
        if self.current == Token::Eof {
            return Err(EvalError::EmptyExpression);
        }
        let expr = self.parse_expression(0)?;
        if self.current != Token::Eof {
            return Err(self.lexer.error(
                self.lexer.pos,
                format!("Unexpected trailing token: {:?}", self.current),
            ));
        }
        Ok(expr)
    }

    fn parse_expression(&mut self, min_precedence: u8) -> EvalResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current {
                Token::Op(op) => *op,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            if op.precedence() < min_precedence {
                break;
            }
            self.advance()?;
            let right = self.parse_expression(op.precedence() + 1)?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> EvalResult<Expr> {
        let op = match self.current {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };
        self.advance()?;
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_primary(&mut self) -> EvalResult<Expr> {
        let expr = match std::mem::replace(&mut self.current, Token::Eof) {
            Token::Number(n) => Expr::Literal(number_to_value(n)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Bool(b) => Expr::Literal(Value::Bool(b)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(mut path) => {
                self.advance()?;
                while self.current == Token::Dot {
                    self.advance()?;
                    match &self.current {
                        Token::Ident(next) => path.push_str(&format!(".{}", next)),
                        Token::Number(n) if n.fract() == 0.0 => {
                            path.push_str(&format!(".{}", *n as u64))
                        }
                        _ => {
                            return Err(self
                                .lexer
                                .error(self.lexer.pos, "Expected identifier after '.'"))
                        }
                    }
                    self.advance()?;
                }
                return Ok(Expr::Path(path));
            }
            Token::LParen => {
                self.advance()?;
                let expr = self.parse_expression(0)?;
                if self.current != Token::RParen {
                    return Err(self.lexer.error(self.lexer.pos, "Expected ')'"));
                }
                expr
            }
            other => {
                return Err(self
                    .lexer
                    .error(self.lexer.pos, format!("Unexpected token: {:?}", other)))
            }
        };
        self.advance()?;
        Ok(expr)
    }
}

// ============================================================================
// COMPILED PREDICATE
// ============================================================================

/// A parsed expression, compiled once and evaluated many times.
#[derive(Clone, PartialEq)]
pub struct Predicate {
    source: String,
    ast: Expr,
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({:?})", self.source)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Predicate {
    pub fn compile(source: &str) -> EvalResult<Self> {
        let ast = Parser::new(source)?.parse()?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, context: &EvalContext) -> EvalResult<Value> {
        eval_expr(&self.ast, context)
    }

    /// Evaluate and coerce to a boolean.
    pub fn test(&self, context: &EvalContext) -> EvalResult<bool> {
        Ok(is_truthy(&self.evaluate(context)?))
    }

    /// Evaluate against a step result bound as `result`.
    pub fn test_result(&self, result: &Value) -> EvalResult<bool> {
        self.test(&EvalContext::for_result(result))
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

fn eval_expr(expr: &Expr, context: &EvalContext) -> EvalResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(context.get(path).cloned().unwrap_or(Value::Null)),
        Expr::Unary { op, expr } => {
            let val = eval_expr(expr, context)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&val))),
                UnaryOp::Neg => Ok(number_to_value(-to_number(&val)?)),
            }
        }
        Expr::Binary { left, op, right } => {
            let left = eval_expr(left, context)?;
            match op {
                BinaryOp::And if !is_truthy(&left) => return Ok(Value::Bool(false)),
                BinaryOp::Or if is_truthy(&left) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let right = eval_expr(right, context)?;
            eval_binary(*op, &left, &right)
        }
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
    let value = match op {
        BinaryOp::Eq => Value::Bool(values_equal(left, right)),
        BinaryOp::Ne => Value::Bool(!values_equal(left, right)),
        BinaryOp::Lt => Value::Bool(compare(left, right).map_or(false, |o| o.is_lt())),
        BinaryOp::Le => Value::Bool(compare(left, right).map_or(false, |o| o.is_le())),
        BinaryOp::Gt => Value::Bool(compare(left, right).map_or(false, |o| o.is_gt())),
        BinaryOp::Ge => Value::Bool(compare(left, right).map_or(false, |o| o.is_ge())),
        BinaryOp::And | BinaryOp::Or => Value::Bool(is_truthy(right)),
        BinaryOp::Add => number_to_value(to_number(left)? + to_number(right)?),
        BinaryOp::Sub => number_to_value(to_number(left)? - to_number(right)?),
        BinaryOp::Mul => number_to_value(to_number(left)? * to_number(right)?),
        BinaryOp::Div => {
            let r = to_number(right)?;
            if r == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            number_to_value(to_number(left)? / r)
        }
    };
    Ok(value)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Ordering is only defined between two numbers or two strings.
fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn to_number(val: &Value) -> EvalResult<f64> {
    match val {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| EvalError::TypeError(format!("Cannot convert string '{}' to number", s))),
        _ => Err(EvalError::TypeError(format!(
            "Cannot convert {} to number",
            val
        ))),
    }
}

pub fn is_truthy(val: &Value) -> bool {
    match val {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ============================================================================
// TESTS
// ============================================================================
