// Layered configuration for usersvc
//
// Sources are merged in load order, later ones winning per key:
// defaults, then a config file, then `.env`, then the process environment.

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::{EnvLoader, coerce_to};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Main configuration manager
///
/// Holds one merged JSON tree. Keys passed to [`get`](Self::get) and
/// [`set`](Self::set) are dotted paths (`consul.address`).
///
/// Environment values arrive as strings. They are converted to numbers or
/// bools where the merged tree, or the schema from
/// [`load_schema`](Self::load_schema), has one at the same path.
#[derive(Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Value>>,
    schema: Arc<RwLock<Value>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(Value::Object(Map::new()))),
            schema: Arc::new(RwLock::new(Value::Null)),
            env_prefix: None,
        }
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: Some(prefix.into()),
            ..Self::new()
        }
    }

    fn overlay(&self, layer: Value) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        merge_values(&mut config, layer);
    }

    /// Load a serializable value as the lowest layer
    pub fn load_defaults<T: Serialize>(&self, defaults: &T) -> Result<()> {
        let value = serde_json::to_value(defaults)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        self.overlay(value);
        Ok(())
    }

    /// Record the value types of `template` for typing environment values.
    ///
    /// Unlike [`load_defaults`](Self::load_defaults) this adds nothing to the
    /// tree, so sections that are `None` by default can still be typed.
    pub fn load_schema<T: Serialize>(&self, template: &T) -> Result<()> {
        let value = serde_json::to_value(template)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        *self.schema.write().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        let mut layer = loader.load()?;

        coerce_to(&mut layer, &self.config.read().unwrap_or_else(PoisonError::into_inner));
        coerce_to(&mut layer, &self.schema.read().unwrap_or_else(PoisonError::into_inner));

        self.overlay(layer);
        Ok(())
    }

    /// Load a `.env` file into the process environment, then the environment.
    ///
    /// Variables already set in the environment keep their values. Without a
    /// path, a missing `.env` in the working directory is ignored.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| {
                ConfigError::LoadError(format!("Failed to load {}: {}", path.display(), e))
            })?;
        } else {
            dotenvy::dotenv().ok();
        }
        self.load_env()
    }

    /// Load configuration from file, format from its extension
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let loader = ConfigLoader::auto(&path)?;
        self.overlay(loader.load_file(path)?);
        Ok(())
    }

    /// Load configuration from file with an explicit format
    pub fn load_file_as(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let loader = ConfigLoader::new(format);
        self.overlay(loader.load_file(path)?);
        Ok(())
    }

    /// Set a configuration value
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let mut layer = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        for segment in key.rsplit('.') {
            let mut map = Map::new();
            map.insert(segment.to_string(), layer);
            layer = Value::Object(map);
        }

        self.overlay(layer);
        Ok(())
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        key.split('.')
            .try_fold(&*config, |node, segment| node.get(segment))
            .cloned()
    }

    /// Get a configuration value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .lookup(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        serde_json::from_value(value)
            .map_err(|e| ConfigError::DeserializationError(format!("{}: {}", key, e)))
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Top-level configuration keys
    pub fn keys(&self) -> Vec<String> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        config
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Merge configuration from another manager
    pub fn merge(&self, other: &ConfigManager) -> Result<()> {
        let other = other
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.overlay(other);
        Ok(())
    }

    /// Deserialize the whole merged tree
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T> {
        let config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        serde_json::from_value(config).map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    /// Load and validate configuration
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let validated: T = self.extract()?;
        validated.validate()?;
        Ok(validated)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep-merge `overlay` into `base`. Objects merge per key; any other value
/// replaces what was there.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("test_key", "test_value").unwrap();

        let value: String = manager.get("test_key").unwrap();
        assert_eq!(value, "test_value");
    }

    #[test]
    fn test_dotted_keys() {
        let manager = ConfigManager::new();
        manager.set("consul.address", "10.0.0.1:8500").unwrap();
        manager.set("consul.timeout", "5s").unwrap();

        assert_eq!(manager.get::<String>("consul.address").unwrap(), "10.0.0.1:8500");
        assert_eq!(manager.keys(), vec!["consul".to_string()]);
        assert!(manager.has("consul.timeout"));
        assert!(!manager.has("consul.token"));
    }

    #[test]
    fn test_get_or_default() {
        let manager = ConfigManager::new();

        let value: String = manager.get_or("missing_key", "default_value".to_string());
        assert_eq!(value, "default_value");
        assert!(matches!(
            manager.get::<String>("missing_key"),
            Err(ConfigError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_merge_values_is_deep() {
        let mut base = json!({"consul": {"address": "a", "tags": ["x"]}, "log": {"level": "info"}});
        merge_values(
            &mut base,
            json!({"consul": {"address": "b", "tags": ["y", "z"]}}),
        );

        assert_eq!(base["consul"]["address"], "b");
        assert_eq!(base["consul"]["tags"], json!(["y", "z"]));
        assert_eq!(base["log"]["level"], "info");
    }

    #[test]
    fn test_merge_managers() {
        let a = ConfigManager::new();
        a.set("server.app", "tars").unwrap();
        let b = ConfigManager::new();
        b.set("server.server", "user").unwrap();

        a.merge(&b).unwrap();
        assert_eq!(a.get::<String>("server.app").unwrap(), "tars");
        assert_eq!(a.get::<String>("server.server").unwrap(), "user");
    }

    #[test]
    fn test_type_conversions() {
        let manager = ConfigManager::new();

        manager.set("int_key", 42i64).unwrap();
        manager.set("bool_key", true).unwrap();

        assert_eq!(manager.get::<i64>("int_key").unwrap(), 42);
        assert!(manager.get::<bool>("bool_key").unwrap());
        assert!(matches!(
            manager.get::<bool>("int_key"),
            Err(ConfigError::DeserializationError(_))
        ));
    }
}
