//! Extraction strategies for reducing raw payloads to named values.
//!
//! Every strategy takes `(input, expr)` and returns a value. Missing data is
//! never an error here: absence degrades to `Value::Null`, which becomes the
//! extract step's declared output. Malformed expressions are logged and also
//! degrade to null — an extract step cannot fail a run.

mod expr;
mod jsonpath;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// How an `extract` step interprets its expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractStrategy {
    /// Structured query over a JSON value (`$.data.used`, `$.items[*].name`).
    Jsonpath,
    /// CSS selector over an HTML document; `selector @attr` reads an
    /// attribute instead of the element text.
    Css,
    /// Regex capture: the first capture group if any, else the whole match.
    Regex,
    /// A constrained arithmetic/path expression over the input. No ambient
    /// I/O by construction.
    Script,
}

impl Default for ExtractStrategy {
    fn default() -> Self {
        ExtractStrategy::Jsonpath
    }
}

/// Applies a strategy to an input value.
pub fn extract(strategy: ExtractStrategy, input: &Value, expression: &str) -> Value {
    match strategy {
        ExtractStrategy::Jsonpath => extract_jsonpath(input, expression),
        ExtractStrategy::Css => extract_css(input, expression),
        ExtractStrategy::Regex => extract_regex(input, expression),
        ExtractStrategy::Script => match expr::eval(expression, input) {
            Ok(value) => value,
            Err(e) => {
                warn!(expr = %expression, error = %e, "script expression failed");
                Value::Null
            }
        },
    }
}

fn extract_jsonpath(input: &Value, expression: &str) -> Value {
    let matches = match jsonpath::select(input, expression) {
        Ok(matches) => matches,
        Err(e) => {
            warn!(expr = %expression, error = %e, "invalid JSONPath expression");
            return Value::Null;
        }
    };
    match matches.len() {
        0 => Value::Null,
        1 => matches[0].clone(),
        _ => Value::Array(matches.into_iter().cloned().collect()),
    }
}

fn extract_css(input: &Value, expression: &str) -> Value {
    let Some(html) = input.as_str() else {
        warn!("css extraction requires a string input");
        return Value::Null;
    };

    let (selector_str, attr) = match expression.rsplit_once(" @") {
        Some((sel, attr)) => (sel, Some(attr)),
        None => (expression, None),
    };

    let selector = match scraper::Selector::parse(selector_str) {
        Ok(selector) => selector,
        Err(e) => {
            warn!(expr = %selector_str, error = %e, "invalid CSS selector");
            return Value::Null;
        }
    };

    let document = scraper::Html::parse_document(html);
    let Some(element) = document.select(&selector).next() else {
        return Value::Null;
    };

    match attr {
        Some(attr) => element
            .value()
            .attr(attr)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),
        None => {
            let text: String = element.text().collect::<String>().trim().to_string();
            Value::String(text)
        }
    }
}

fn extract_regex(input: &Value, expression: &str) -> Value {
    let text = match input {
        Value::String(s) => s.clone(),
        Value::Null => return Value::Null,
        other => other.to_string(),
    };

    let pattern = match regex::Regex::new(expression) {
        Ok(pattern) => pattern,
        Err(e) => {
            warn!(expr = %expression, error = %e, "invalid regex");
            return Value::Null;
        }
    };

    match pattern.captures(&text) {
        Some(caps) => {
            let matched = caps.get(1).or_else(|| caps.get(0));
            matched
                .map(|m| Value::String(m.as_str().to_string()))
                .unwrap_or(Value::Null)
        }
        None => Value::Null,
    }
}
