//! Variable scopes and `{name}` template resolution.
//!
//! Three scopes are visible to a step's arguments, consulted in priority
//! order: published step outputs, then run context, then stored secrets.
//! A template that is exactly one reference (`"{limit}"`) resolves to the
//! referenced value with its type intact; references embedded in a larger
//! string are rendered into it. Unresolvable references are left verbatim so
//! a typo surfaces in the failing request instead of vanishing silently.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.]*)\}").unwrap())
}

/// The resolution environment for one run.
pub struct Scopes {
    /// Variables published by completed steps. Highest priority.
    pub outputs: Map<String, Value>,
    /// Source `vars` plus everything merged in as the run progresses.
    pub context: Map<String, Value>,
    /// Decrypted secrets for the source. Lowest priority.
    pub secrets: HashMap<String, String>,
}

impl Scopes {
    pub fn new(context: Map<String, Value>, secrets: HashMap<String, String>) -> Self {
        Scopes {
            outputs: Map::new(),
            context,
            secrets,
        }
    }

    /// Looks a name up across the three scopes in priority order.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.outputs.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.context.get(name) {
            return Some(v.clone());
        }
        self.secrets.get(name).map(|raw| secret_value(raw))
    }

    /// Publishes a completed step's outputs. The step-local `outputs` scope
    /// is replaced wholesale; the context accumulates, so earlier values stay
    /// reachable and survive a suspension snapshot.
    pub fn publish(&mut self, outputs: Map<String, Value>) {
        for (key, value) in &outputs {
            self.context.insert(key.clone(), value.clone());
        }
        self.outputs = outputs;
    }

    /// Resolves templates recursively through strings, arrays and objects.
    pub fn resolve(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolves every value of a step's argument map.
    pub fn resolve_args(&self, args: &Map<String, Value>) -> Map<String, Value> {
        args.iter()
            .map(|(k, v)| (k.clone(), self.resolve(v)))
            .collect()
    }

    fn resolve_str(&self, s: &str) -> Value {
        // A whole-string single reference keeps the referenced value's type.
        if let Some(caps) = template_re().captures(s) {
            if caps.get(0).map(|m| m.as_str()) == Some(s) {
                if let Some(value) = self.lookup(&caps[1]) {
                    return value;
                }
                return Value::String(s.to_string());
            }
        }

        let replaced = template_re().replace_all(s, |caps: &regex::Captures| {
            match self.lookup(&caps[1]) {
                Some(value) => render(&value),
                None => caps[0].to_string(),
            }
        });
        Value::String(replaced.into_owned())
    }
}

/// Secrets holding serialized structures (like a token bundle) surface as
/// structured values; everything else stays a plain string.
fn secret_value(raw: &str) -> Value {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    } else {
        Value::String(raw.to_string())
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scopes() -> Scopes {
        let mut context = Map::new();
        context.insert("region".to_string(), json!("eu-west"));
        context.insert("limit".to_string(), json!(500));
        let mut secrets = HashMap::new();
        secrets.insert("api_key".to_string(), "sk-123".to_string());
        Scopes::new(context, secrets)
    }

    #[test]
    fn test_embedded_reference_renders_into_string() {
        let s = scopes();
        assert_eq!(
            s.resolve(&json!("Bearer {api_key}")),
            json!("Bearer sk-123")
        );
        assert_eq!(
            s.resolve(&json!("https://api.example.com/{region}/usage")),
            json!("https://api.example.com/eu-west/usage")
        );
    }

    #[test]
    fn test_whole_string_reference_preserves_type() {
        let s = scopes();
        assert_eq!(s.resolve(&json!("{limit}")), json!(500));
    }

    #[test]
    fn test_embedded_non_string_renders_as_text() {
        let s = scopes();
        assert_eq!(s.resolve(&json!("max={limit}")), json!("max=500"));
    }

    #[test]
    fn test_unresolved_reference_left_verbatim() {
        let s = scopes();
        assert_eq!(s.resolve(&json!("{nope}")), json!("{nope}"));
        assert_eq!(s.resolve(&json!("x {nope} y")), json!("x {nope} y"));
    }

    #[test]
    fn test_outputs_shadow_context_and_secrets() {
        let mut s = scopes();
        let mut published = Map::new();
        published.insert("api_key".to_string(), json!("from-output"));
        published.insert("region".to_string(), json!("us-east"));
        s.publish(published);

        assert_eq!(s.resolve(&json!("{api_key}")), json!("from-output"));
        assert_eq!(s.resolve(&json!("{region}")), json!("us-east"));
    }

    #[test]
    fn test_context_shadows_secrets() {
        let mut s = scopes();
        s.context.insert("api_key".to_string(), json!("ctx-key"));
        assert_eq!(s.resolve(&json!("{api_key}")), json!("ctx-key"));
    }

    #[test]
    fn test_publish_replaces_outputs_but_context_accumulates() {
        let mut s = scopes();
        let mut first = Map::new();
        first.insert("a".to_string(), json!(1));
        s.publish(first);
        let mut second = Map::new();
        second.insert("b".to_string(), json!(2));
        s.publish(second);

        assert!(s.outputs.get("a").is_none());
        assert_eq!(s.context.get("a"), Some(&json!(1)));
        assert_eq!(s.lookup("a"), Some(json!(1)));
        assert_eq!(s.lookup("b"), Some(json!(2)));
    }

    #[test]
    fn test_publish_merges_into_context() {
        let mut s = scopes();
        let mut published = Map::new();
        published.insert("access_token".to_string(), json!("tok"));
        s.publish(published);
        assert_eq!(s.context.get("access_token"), Some(&json!("tok")));
    }

    #[test]
    fn test_recursive_resolution_through_structures() {
        let s = scopes();
        let resolved = s.resolve(&json!({
            "headers": {"Authorization": "Bearer {api_key}"},
            "limits": ["{limit}", "fixed"]
        }));
        assert_eq!(
            resolved,
            json!({
                "headers": {"Authorization": "Bearer sk-123"},
                "limits": [500, "fixed"]
            })
        );
    }

    #[test]
    fn test_json_secret_surfaces_structured() {
        let mut s = scopes();
        s.secrets.insert(
            "oauth_token".to_string(),
            r#"{"access_token":"at-1"}"#.to_string(),
        );
        assert_eq!(
            s.resolve(&json!("{oauth_token}")),
            json!({"access_token": "at-1"})
        );
    }

    #[test]
    fn test_numeric_looking_secret_stays_string() {
        let mut s = scopes();
        s.secrets.insert("pin".to_string(), "12345".to_string());
        assert_eq!(s.resolve(&json!("{pin}")), json!("12345"));
    }
}
