//! Sensitive key redaction
//!
//! Keys are compared after lowercasing and dropping `_`/`-`, so `apiKey`,
//! `api_key` and `API-KEY` are the same key. A key is sensitive when it
//! contains any configured name (`db_password` contains `password`).

use serde_json::{Map, Value};

/// Replacement for redacted values
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Default sensitive key names
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &["password", "token", "secret", "apiKey", "privateKey"];

#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_KEYS.iter().copied())
    }
}

impl Redactor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = keys
            .into_iter()
            .map(|k| normalize_key(k.as_ref()))
            .filter(|k| !k.is_empty())
            .collect();
        Self { keys }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = normalize_key(key);
        self.keys.iter().any(|k| key.contains(k.as_str()))
    }

    /// Redact in place, descending into nested objects and arrays
    pub fn redact_map(&self, map: &mut Map<String, Value>) {
        for (key, value) in map.iter_mut() {
            if self.is_sensitive(key) {
                *value = Value::String(REDACTION_MARKER.to_string());
            } else {
                self.redact_value(value);
            }
        }
    }

    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => self.redact_map(map),
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact_value(v)),
            _ => {}
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_keys_in_any_spelling() {
        let r = Redactor::default();
        for key in ["password", "apiKey", "api_key", "API-KEY", "privateKey", "github_token", "clientSecret"] {
            assert!(r.is_sensitive(key), "{} should be sensitive", key);
        }
        assert!(!r.is_sensitive("command"));
        assert!(!r.is_sensitive("path"));
    }

    #[test]
    fn test_nested_redaction() {
        let r = Redactor::default();
        let mut value = json!({
            "command": "deploy",
            "env": { "DB_PASSWORD": "hunter2", "HOME": "/root" },
            "steps": [ { "token": "abc" }, "plain" ]
        });
        r.redact_value(&mut value);

        assert_eq!(value["command"], "deploy");
        assert_eq!(value["env"]["DB_PASSWORD"], REDACTION_MARKER);
        assert_eq!(value["env"]["HOME"], "/root");
        assert_eq!(value["steps"][0]["token"], REDACTION_MARKER);
        assert_eq!(value["steps"][1], "plain");
    }

    #[test]
    fn test_sensitive_object_is_replaced_whole() {
        let r = Redactor::new(["credentials"]);
        let mut value = json!({ "credentials": { "user": "a", "pass": "b" } });
        r.redact_value(&mut value);
        assert_eq!(value["credentials"], REDACTION_MARKER);
    }
}
