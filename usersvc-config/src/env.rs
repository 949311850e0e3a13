// Environment variable loading

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::env;

/// Separator between nesting levels in variable names.
pub const NESTING_SEPARATOR: &str = "__";

/// Environment variable loader
///
/// With prefix `USERSVC`, `USERSVC_CONSUL__ADDRESS=10.0.0.1:8500` becomes
/// `{"consul": {"address": "10.0.0.1:8500"}}`. Names are lowercased and
/// values stay strings; see [`coerce_to`] for typing them.
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load the process environment as a nested tree.
    pub fn load(&self) -> Result<Value> {
        Ok(self.load_from(env::vars()))
    }

    /// Build a nested tree from `vars`, keeping only prefixed names.
    pub fn load_from<I>(&self, vars: I) -> Value
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = Map::new();

        for (key, value) in vars {
            let Some(name) = self.strip_prefix(&key) else {
                continue;
            };

            let path: Vec<String> = name
                .split(NESTING_SEPARATOR)
                .map(|segment| segment.to_lowercase())
                .collect();
            if path.iter().any(String::is_empty) {
                continue;
            }

            insert_path(&mut root, &path, Value::String(value));
        }

        Value::Object(root)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.prefix {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('_')),
            None => Some(key),
        }
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = if let Some(ref prefix) = self.prefix {
            format!("{}_{}", prefix, key.to_uppercase())
        } else {
            key.to_uppercase()
        };

        env::var(&full_key).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Convert string leaves of `value` to the number or bool found at the same
/// path in `schema`. Leaves with no typed counterpart, or that do not parse,
/// are left alone.
pub fn coerce_to(value: &mut Value, schema: &Value) {
    match schema {
        Value::Object(schema) => {
            if let Value::Object(map) = value {
                for (key, child) in map.iter_mut() {
                    if let Some(typed) = schema.get(key) {
                        coerce_to(child, typed);
                    }
                }
            }
        }
        Value::Number(_) => {
            let parsed = value
                .as_str()
                .and_then(|raw| serde_json::from_str::<serde_json::Number>(raw.trim()).ok());
            if let Some(number) = parsed {
                *value = Value::Number(number);
            }
        }
        Value::Bool(_) => {
            let parsed = value
                .as_str()
                .and_then(|raw| raw.trim().to_ascii_lowercase().parse::<bool>().ok());
            if let Some(flag) = parsed {
                *value = Value::Bool(flag);
            }
        }
        _ => {}
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };

    if rest.is_empty() {
        map.insert(head.clone(), value);
        return;
    }

    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child) = child {
        insert_path(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_nested_keys() {
        let loader = EnvLoader::new(Some("USERSVC".to_string()));
        let tree = loader.load_from(vars(&[
            ("USERSVC_CONSUL__ADDRESS", "10.0.0.1:8500"),
            ("USERSVC_CONSUL__SERVICE_PORT", "17191"),
            ("USERSVC_LOG__REPORT_CALLER", "false"),
            ("USERSVC_SERVER__APP", "tars"),
            ("PATH", "/usr/bin"),
            ("USERSVCX_IGNORED", "1"),
        ]));

        assert_eq!(tree["consul"]["address"], "10.0.0.1:8500");
        assert_eq!(tree["consul"]["service_port"], "17191");
        assert_eq!(tree["log"]["report_caller"], "false");
        assert_eq!(tree["server"]["app"], "tars");
        assert!(tree.get("path").is_none());
        assert!(tree.get("x_ignored").is_none());
    }

    #[test]
    fn test_coerce_follows_schema_types() {
        let schema = json!({
            "consul": {"service_port": 0, "token": null, "service_id": ""},
            "log": {"report_caller": true},
        });
        let mut tree = json!({
            "consul": {"service_port": "17191", "token": "123456", "service_id": "42"},
            "log": {"report_caller": "FALSE"},
            "extra": "7",
        });

        coerce_to(&mut tree, &schema);

        assert_eq!(tree["consul"]["service_port"], 17191);
        assert_eq!(tree["consul"]["token"], "123456");
        assert_eq!(tree["consul"]["service_id"], "42");
        assert_eq!(tree["log"]["report_caller"], false);
        assert_eq!(tree["extra"], "7");
    }

    #[test]
    fn test_coerce_leaves_unparseable_values() {
        let mut tree = json!({"port": "eighty", "verbose": "yes"});
        coerce_to(&mut tree, &json!({"port": 80, "verbose": false}));

        // left for deserialization to report
        assert_eq!(tree["port"], "eighty");
        assert_eq!(tree["verbose"], "yes");
    }

    #[test]
    fn test_empty_segments_skipped() {
        let loader = EnvLoader::new(Some("USERSVC".to_string()));
        let tree = loader.load_from(vars(&[("USERSVC_CONSUL____ADDRESS", "x")]));
        assert_eq!(tree, Value::Object(Map::new()));
    }

    #[test]
    fn test_env_loader_with_default() {
        let loader = EnvLoader::new(None);
        let value = loader.load_var_or("NONEXISTENT_VAR_12345", "default");

        assert_eq!(value, "default");
    }

    #[test]
    fn test_env_loader_missing_var() {
        let loader = EnvLoader::new(Some("USERSVC_TEST".to_string()));
        assert!(loader.load_var("MISSING_VAR_67890").is_err());
    }
}
