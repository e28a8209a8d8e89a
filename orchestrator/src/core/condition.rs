//! Step condition expressions.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ( "==" | "!=" ) unary )?
//! unary   := "!" unary | atom
//! atom    := "(" or ")" | "${" name "}" | name | number | 'string' | "string"
//!            | true | false | null
//! ```
//!
//! Bare names and `${name}` both reference workflow parameters. Missing
//! parameters evaluate to `null`.

use serde_json::Value;

use crate::core::workflow::Params;

/// Parse failure for a condition expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid condition `{expr}`: {message}")]
pub struct ConditionError {
    pub expr: String,
    pub message: String,
}

/// Parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Param(String),
    Not(Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn value(&self, params: &Params) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Param(name) => params.get(name).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!inner.holds(params)),
            Expr::Eq(a, b) => Value::Bool(loosely_equal(&a.value(params), &b.value(params))),
            Expr::Ne(a, b) => Value::Bool(!loosely_equal(&a.value(params), &b.value(params))),
            Expr::And(a, b) => Value::Bool(a.holds(params) && b.holds(params)),
            Expr::Or(a, b) => Value::Bool(a.holds(params) || b.holds(params)),
        }
    }

    pub fn holds(&self, params: &Params) -> bool {
        truthy(&self.value(params))
    }
}

/// Parse and evaluate `source` against `params`.
pub fn evaluate(source: &str, params: &Params) -> Result<bool, ConditionError> {
    Ok(parse(source)?.holds(params))
}

pub fn parse(source: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(error(source, "empty expression"));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.or()?;
    if parser.pos != parser.tokens.len() {
        return Err(error(
            source,
            format!("unexpected token {:?}", parser.tokens[parser.pos]),
        ));
    }
    Ok(expr)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that tolerates `"3" == 3` and `'true' == true`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        _ => render(a) == render(b),
    }
}

/// Numbers, and strings that parse as numbers.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    EqEq,
    NotEq,
    Str(String),
    Num(f64),
    Ident(String),
    Param(String),
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|offset| start + offset)
                    .ok_or_else(|| error(source, "unterminated `${`"))?;
                let name: String = chars[start..end].iter().collect();
                if !is_param_name(&name) {
                    return Err(error(source, format!("invalid parameter name `{name}`")));
                }
                tokens.push(Token::Param(name));
                i = end + 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|offset| start + offset)
                    .ok_or_else(|| error(source, "unterminated string literal"))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| error(source, format!("invalid number `{text}`")))?;
                tokens.push(Token::Num(number));
            }
            c if is_name_char(c) => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(error(source, format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.unary()?;
        if self.eat(&Token::EqEq) {
            let rhs = self.unary()?;
            return Ok(Expr::Eq(Box::new(lhs), Box::new(rhs)));
        }
        if self.eat(&Token::NotEq) {
            let rhs = self.unary()?;
            return Ok(Expr::Ne(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, ConditionError> {
        let Some(token) = self.peek().cloned() else {
            return Err(error(self.source, "unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::LParen => {
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err(error(self.source, "missing `)`"));
                }
                Ok(inner)
            }
            Token::Param(name) => Ok(Expr::Param(name)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(number_literal(n))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Param(name),
            }),
            other => Err(error(self.source, format!("unexpected token {other:?}"))),
        }
    }
}

/// Integral literals stay integers so they render as `3`, not `3.0`.
fn number_literal(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub(crate) fn is_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn error(expr: &str, message: impl Into<String>) -> ConditionError {
    ConditionError {
        expr: expr.to_string(),
        message: message.into(),
    }
}
