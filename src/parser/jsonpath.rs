//! Minimal JSONPath evaluator over `serde_json::Value`.
//!
//! Supported syntax: `$` root, `.name` / `['name']` / `["name"]` field
//! access, `[0]` array index, `[*]` / `.*` wildcard. Filters, slices and
//! recursive descent are not supported; expressions using them fail to parse.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// Evaluates `expression` against `root`, returning every matching value in
/// document order.
pub fn select<'a>(root: &'a Value, expression: &str) -> Result<Vec<&'a Value>> {
    let segments = parse(expression)?;
    let mut current = vec![root];
    for segment in &segments {
        let mut next = Vec::new();
        for value in current {
            match segment {
                Segment::Field(name) => {
                    if let Some(v) = value.get(name.as_str()) {
                        next.push(v);
                    }
                }
                Segment::Index(i) => {
                    if let Some(v) = value.get(i) {
                        next.push(v);
                    }
                }
                Segment::Wildcard => match value {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => {}
                },
            }
        }
        current = next;
    }
    Ok(current)
}

fn parse(expression: &str) -> Result<Vec<Segment>> {
    let rest = expression
        .strip_prefix('$')
        .ok_or_else(|| anyhow!("expression must start with '$'"))?;

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    segments.push(Segment::Wildcard);
                    continue;
                }
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n == '.' || n == '[' {
                        break;
                    }
                    name.push(n);
                    chars.next();
                }
                if name.is_empty() {
                    bail!("empty field name after '.'");
                }
                segments.push(Segment::Field(name));
            }
            '[' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => inner.push(ch),
                        None => bail!("unterminated '[' in expression"),
                    }
                }
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else if let Some(name) = quoted(inner, '\'').or_else(|| quoted(inner, '"')) {
                    segments.push(Segment::Field(name.to_string()));
                } else {
                    let index: usize = inner
                        .parse()
                        .map_err(|_| anyhow!("invalid bracket segment: [{inner}]"))?;
                    segments.push(Segment::Index(index));
                }
            }
            other => bail!("unexpected character '{other}' in expression"),
        }
    }
    Ok(segments)
}

fn quoted(s: &str, quote: char) -> Option<&str> {
    s.strip_prefix(quote)?.strip_suffix(quote)
}
