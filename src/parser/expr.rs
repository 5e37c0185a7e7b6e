//! Constrained expression evaluator for `script` extract steps.
//!
//! The language is deliberately tiny: field paths into the input value,
//! numeric and string literals, arithmetic (`+ - * /`), comparisons and
//! parentheses. There are no function calls, no loops and no way to reach
//! outside the input, so a script step can transform data but nothing else.
//!
//! `value` is a reserved root identifier naming the whole input; any other
//! leading identifier reads a field of the input object. Paths continue with
//! `.field` and `[index]`.

use anyhow::{anyhow, bail, Result};
use serde_json::{Number, Value};

/// Evaluates `expression` against `input`.
pub fn eval(expression: &str, input: &Value) -> Result<Value> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        input,
    };
    let result = parser.comparison()?;
    if parser.pos != parser.tokens.len() {
        bail!("unexpected trailing input in expression");
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    bail!("expected '==' in expression");
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    bail!("expected '!=' in expression");
                }
                tokens.push(Token::Ne);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => bail!("unterminated string literal"),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let mut s = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_digit() || n == '.' {
                        // A digit must follow the dot, otherwise it's a path
                        // separator (e.g. `items[0].n` after an index).
                        if n == '.' {
                            let mut lookahead = chars.clone();
                            lookahead.next();
                            if !matches!(lookahead.peek(), Some(d) if d.is_ascii_digit()) {
                                break;
                            }
                        }
                        s.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num: f64 = s.parse().map_err(|_| anyhow!("invalid number: {s}"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        s.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => bail!("unexpected character '{other}' in expression"),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    input: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            other => bail!("expected {token:?}, found {other:?}"),
        }
    }

    fn comparison(&mut self) -> Result<Value> {
        let left = self.sum()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.sum()?;
        let result = match op {
            Token::Eq => left == right,
            Token::Ne => left != right,
            _ => {
                let (l, r) = numeric_pair(&left, &right)?;
                match op {
                    Token::Lt => l < r,
                    Token::Le => l <= r,
                    Token::Gt => l > r,
                    Token::Ge => l >= r,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn sum(&mut self) -> Result<Value> {
        let mut left = self.product()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                    let right = self.product()?;
                    left = add(&left, &right)?;
                }
                Some(Token::Minus) => {
                    self.advance();
                    let right = self.product()?;
                    let (l, r) = numeric_pair(&left, &right)?;
                    left = number(l - r)?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn product(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.advance();
                    let right = self.unary()?;
                    let (l, r) = numeric_pair(&left, &right)?;
                    left = number(l * r)?;
                }
                Some(Token::Slash) => {
                    self.advance();
                    let right = self.unary()?;
                    let (l, r) = numeric_pair(&left, &right)?;
                    if r == 0.0 {
                        bail!("division by zero");
                    }
                    left = number(l / r)?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            let value = self.unary()?;
            let n = as_number(&value)?;
            return number(-n);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Num(n)) => number(n),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::LParen) => {
                let inner = self.comparison()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.path(name),
            other => bail!("unexpected token {other:?} in expression"),
        }
    }

    fn path(&mut self, root: String) -> Result<Value> {
        let mut current = match root.as_str() {
            "null" => return Ok(Value::Null),
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "value" => self.input.clone(),
            field => self
                .input
                .get(field)
                .cloned()
                .ok_or_else(|| anyhow!("unknown field '{field}'"))?,
        };
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let field = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        other => bail!("expected field name after '.', found {other:?}"),
                    };
                    current = current
                        .get(&field)
                        .cloned()
                        .ok_or_else(|| anyhow!("unknown field '{field}'"))?;
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = match self.advance() {
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                        other => bail!("expected array index, found {other:?}"),
                    };
                    self.expect(Token::RBracket)?;
                    current = current
                        .get(index)
                        .cloned()
                        .ok_or_else(|| anyhow!("index {index} out of bounds"))?;
                }
                _ => return Ok(current),
            }
        }
    }
}

fn as_number(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| anyhow!("expected a number, found {value}"))
}

fn numeric_pair(left: &Value, right: &Value) -> Result<(f64, f64)> {
    Ok((as_number(left)?, as_number(right)?))
}

fn number(n: f64) -> Result<Value> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("non-finite arithmetic result"))
}

fn add(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{l}{r}"))),
        _ => {
            let (l, r) = numeric_pair(left, right)?;
            number(l + r)
        }
    }
}
