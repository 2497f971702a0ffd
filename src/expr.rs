//! A small expression language evaluated against a JSON data document.
//!
//! Supports number/string/bool/null literals, variables (with dotted paths
//! into nested objects), unary `-` and `!`, arithmetic `+ - * / %`,
//! comparisons, `&&`, `||` and parentheses. `+` concatenates when either
//! operand is a string.

use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unexpected character {ch:?} at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unexpected {found} at offset {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("cannot apply {op} to {operands}")]
    TypeMismatch { op: &'static str, operands: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("data document must be a JSON object")]
    DataNotObject,

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }

    fn from_json(name: &str, json: &Json) -> Result<Self, EvalError> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| EvalError::UnknownVariable(name.to_string())),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(_) | Json::Object(_) => Err(EvalError::TypeMismatch {
                op: "variable lookup",
                operands: format!("{name} (array or object)"),
            }),
        }
    }
}

/// Integral numbers render without a fractional part.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Ident(s) => write!(f, "identifier {s:?}"),
            Token::Op(op) => write!(f, "operator {op:?}"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
        }
    }
}

const OPERATORS: [&str; 15] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", ".",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(&(pos, ch)) = chars.get(i) {
        if ch.is_whitespace() {
            i += 1;
        } else if ch.is_ascii_digit() {
            let start = i;
            while chars
                .get(i)
                .is_some_and(|(_, c)| c.is_ascii_digit() || *c == '.')
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| EvalError::UnexpectedToken { pos, found: text.clone() })?;
            tokens.push((pos, Token::Number(n)));
        } else if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while chars
                .get(i)
                .is_some_and(|(_, c)| c.is_alphanumeric() || *c == '_')
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push((pos, Token::Ident(text)));
        } else if ch == '"' || ch == '\'' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(EvalError::UnterminatedString(pos)),
                    Some((_, c)) if *c == ch => break,
                    Some((_, '\\')) => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or(EvalError::UnterminatedString(pos))?;
                        text.push(escaped.1);
                        i += 2;
                    }
                    Some((_, c)) => {
                        text.push(*c);
                        i += 1;
                    }
                }
            }
            i += 1;
            tokens.push((pos, Token::Str(text)));
        } else if ch == '(' {
            tokens.push((pos, Token::LParen));
            i += 1;
        } else if ch == ')' {
            tokens.push((pos, Token::RParen));
            i += 1;
        } else {
            let rest = &src[pos..];
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or(EvalError::UnexpectedChar { pos, ch })?;
            tokens.push((pos, Token::Op(*op)));
            i += op.chars().count();
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(Vec<String>),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

/// Binary operators by precedence level, loosest first.
const LEVELS: [&[&str]; 6] = [
    &["||"],
    &["&&"],
    &["==", "!="],
    &["<", "<=", ">", ">="],
    &["+", "-"],
    &["*", "/", "%"],
];

/// Deepest nesting accepted, counted both as parser recursion and as the
/// height of the resulting tree.
pub const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

fn check_depth(depth: usize) -> Result<(), EvalError> {
    if depth > MAX_DEPTH {
        Err(EvalError::TooDeep(MAX_DEPTH))
    } else {
        Ok(())
    }
}

/// Subtrees are returned with their height so evaluation stays bounded too.
type Parsed = (Expr, usize);

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Result<(usize, Token), EvalError> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(EvalError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn binary(&mut self, level: usize) -> Result<Parsed, EvalError> {
        let Some(ops) = LEVELS.get(level) else {
            return self.unary();
        };
        let (mut lhs, mut height) = self.binary(level + 1)?;
        while let Some(op) = self.eat_op(ops) {
            let (rhs, rhs_height) = self.binary(level + 1)?;
            height = height.max(rhs_height) + 1;
            check_depth(height)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, height))
    }

    fn unary(&mut self) -> Result<Parsed, EvalError> {
        self.depth += 1;
        check_depth(self.depth)?;
        let parsed = match self.eat_op(&["-", "!"]) {
            Some(op) => {
                let (inner, height) = self.unary()?;
                check_depth(height + 1)?;
                (Expr::Unary(op, Box::new(inner)), height + 1)
            }
            None => self.primary()?,
        };
        self.depth -= 1;
        Ok(parsed)
    }

    fn primary(&mut self) -> Result<Parsed, EvalError> {
        let (pos, tok) = self.next()?;
        match tok {
            Token::Number(n) => Ok((Expr::Literal(Value::Number(n)), 1)),
            Token::Str(s) => Ok((Expr::Literal(Value::String(s)), 1)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok((Expr::Literal(Value::Bool(true)), 1)),
                "false" => Ok((Expr::Literal(Value::Bool(false)), 1)),
                "null" => Ok((Expr::Literal(Value::Null), 1)),
                _ => {
                    let mut path = vec![name];
                    while self.eat_op(&["."]).is_some() {
                        match self.next()? {
                            (_, Token::Ident(field)) => path.push(field),
                            (pos, other) => {
                                return Err(EvalError::UnexpectedToken {
                                    pos,
                                    found: other.to_string(),
                                });
                            }
                        }
                    }
                    Ok((Expr::Variable(path), 1))
                }
            },
            Token::LParen => {
                let inner = self.binary(0)?;
                match self.next()? {
                    (_, Token::RParen) => Ok(inner),
                    (pos, other) => Err(EvalError::UnexpectedToken {
                        pos,
                        found: other.to_string(),
                    }),
                }
            }
            other => Err(EvalError::UnexpectedToken {
                pos,
                found: other.to_string(),
            }),
        }
    }
}

/// Parse `src` into an expression tree.
pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        depth: 0,
    };
    let (expr, _) = parser.binary(0)?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some((pos, tok)) => Err(EvalError::UnexpectedToken {
            pos: *pos,
            found: tok.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn lookup(data: &Json, path: &[String]) -> Result<Value, EvalError> {
    let name = path.join(".");
    let mut current = data;
    for field in path {
        current = current
            .get(field)
            .ok_or_else(|| EvalError::UnknownVariable(name.clone()))?;
    }
    Value::from_json(&name, current)
}

fn truthy(op: &'static str, v: &Value) -> Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::TypeMismatch {
            op,
            operands: other.type_name().to_string(),
        }),
    }
}

fn mismatch(op: &'static str, l: &Value, r: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op,
        operands: format!("{} and {}", l.type_name(), r.type_name()),
    }
}

fn apply(op: &'static str, l: Value, r: Value) -> Result<Value, EvalError> {
    use Value::{Bool, Number, String as Str};

    match (op, &l, &r) {
        ("==", _, _) => Ok(Bool(l == r)),
        ("!=", _, _) => Ok(Bool(l != r)),
        ("+", Number(a), Number(b)) => Ok(Number(a + b)),
        ("+", Str(_), _) | ("+", _, Str(_)) => Ok(Str(format!("{l}{r}"))),
        ("-", Number(a), Number(b)) => Ok(Number(a - b)),
        ("*", Number(a), Number(b)) => Ok(Number(a * b)),
        ("/" | "%", Number(_), Number(b)) if *b == 0.0 => Err(EvalError::DivisionByZero),
        ("/", Number(a), Number(b)) => Ok(Number(a / b)),
        ("%", Number(a), Number(b)) => Ok(Number(a % b)),
        ("<", Number(a), Number(b)) => Ok(Bool(a < b)),
        ("<=", Number(a), Number(b)) => Ok(Bool(a <= b)),
        (">", Number(a), Number(b)) => Ok(Bool(a > b)),
        (">=", Number(a), Number(b)) => Ok(Bool(a >= b)),
        ("<", Str(a), Str(b)) => Ok(Bool(a < b)),
        ("<=", Str(a), Str(b)) => Ok(Bool(a <= b)),
        (">", Str(a), Str(b)) => Ok(Bool(a > b)),
        (">=", Str(a), Str(b)) => Ok(Bool(a >= b)),
        _ => Err(mismatch(op, &l, &r)),
    }
}

impl Expr {
    /// Evaluate against a data object.
    pub fn eval(&self, data: &Json) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Variable(path) => lookup(data, path),
            Expr::Unary("-", inner) => match inner.eval(data)? {
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(EvalError::TypeMismatch {
                    op: "-",
                    operands: other.type_name().to_string(),
                }),
            },
            Expr::Unary(op, inner) => Ok(Value::Bool(!truthy(*op, &inner.eval(data)?)?)),
            // Short-circuit: the right side is only evaluated when needed.
            Expr::Binary("&&", l, r) => Ok(Value::Bool(
                truthy("&&", &l.eval(data)?)? && truthy("&&", &r.eval(data)?)?,
            )),
            Expr::Binary("||", l, r) => Ok(Value::Bool(
                truthy("||", &l.eval(data)?)? || truthy("||", &r.eval(data)?)?,
            )),
            Expr::Binary(op, l, r) => apply(*op, l.eval(data)?, r.eval(data)?),
        }
    }
}

/// Parse and evaluate `body` against `data`, which must be a JSON object.
pub fn evaluate(body: &str, data: &Json) -> Result<Value, EvalError> {
    if !data.is_object() {
        return Err(EvalError::DataNotObject);
    }
    parse(body)?.eval(data)
}
