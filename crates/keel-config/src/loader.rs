//! Configuration loader with layered approach.
//!
//! This module provides the [`ConfigLoader`] for loading [`Options`] from
//! multiple sources: defaults, files, and environment variables.

use std::env;
use std::fs;
use std::path::Path;

use keel_core::Validate;
use serde_json::Value;

use crate::{ConfigError, Options};

/// Configuration loader with layered approach.
///
/// The loader applies configuration in layers, with later layers overriding
/// earlier ones:
/// 1. Default values (built into the code)
/// 2. Configuration file (TOML or JSON)
/// 3. Environment variables
///
/// # Example
///
/// ```no_run
/// use keel_config::ConfigLoader;
///
/// # fn main() -> Result<(), keel_config::ConfigError> {
/// let options = ConfigLoader::new()
///     .with_defaults()
///     .with_file("keel.toml")?
///     .with_env_prefix("KEEL")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    options: Options,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            env_prefix: None,
        }
    }

    /// Start with default option values.
    ///
    /// This is called automatically by `new()`, but can be chained for clarity.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.options = Options::default();
        self
    }

    /// Start from an explicit options value.
    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Load configuration from a file.
    ///
    /// Supports TOML (.toml) and JSON (.json) formats, chosen by extension.
    /// Sections missing from the file keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable, or does not
    /// parse.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        self.options = parse_file(&content, path)?;
        Ok(self)
    }

    /// Load configuration from an optional file.
    ///
    /// If the file exists, loads it. If not, silently continues.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration from a string in `format` ("toml" or "json").
    ///
    /// # Example
    ///
    /// ```
    /// use keel_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     enabled = ["timeout"]
    ///
    ///     [timeout]
    ///     timeout = "5s"
    /// "#;
    ///
    /// let options = ConfigLoader::new()
    ///     .with_string(toml, "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(options.timeout.timeout.to_string(), "5s");
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.options = parse_str(content, format)?;
        Ok(self)
    }

    /// Set environment variable prefix for overrides.
    ///
    /// Environment variables use the format `PREFIX__SECTION__FIELD`, with
    /// underscores in names standing for dashes:
    /// - `KEEL__TIMEOUT__TIMEOUT=5s`
    /// - `KEEL__CORS__ALLOW_ORIGINS=https://a.example,https://b.example`
    /// - `KEEL__ENABLED=recovery,logger`
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load a `.env` file into the process environment, if present.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(ConfigError::env_parse_error(".env", e.to_string())),
        }
    }

    /// Finalize, apply environment overrides, fill defaults and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an environment variable cannot be applied or
    /// an enabled record fails validation.
    pub fn load(self) -> Result<Options, ConfigError> {
        let options = self.load_unvalidated()?;
        let errors = options.validate();
        if errors.is_empty() {
            Ok(options)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Finalize without validation.
    pub fn load_unvalidated(mut self) -> Result<Options, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }
        Ok(self.options.complete())
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let marker = format!("{prefix}__");
        let mut vars: Vec<(String, String)> =
            env::vars().filter(|(k, _)| k.starts_with(&marker)).collect();
        vars.sort();

        for (key, value) in vars {
            self.apply_env_var(&key, &value, prefix)?;
        }

        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let path = key
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix("__"))
            .ok_or_else(|| ConfigError::env_parse_error(key, "invalid key format"))?;

        let mut tree = serde_json::to_value(&self.options)?;
        let segments: Vec<String> = path.split("__").map(env_segment).collect();

        let slot = segments
            .iter()
            .try_fold(&mut tree, |node, segment| node.get_mut(segment.as_str()))
            .ok_or_else(|| ConfigError::env_parse_error(key, "unknown configuration key"))?;
        *slot = coerce(slot, value).map_err(|reason| ConfigError::env_parse_error(key, reason))?;

        self.options = serde_json::from_value(tree)
            .map_err(|e| ConfigError::env_parse_error(key, e.to_string()))?;
        Ok(())
    }
}

fn parse_file(content: &str, path: &Path) -> Result<Options, ConfigError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);

    match extension.as_deref() {
        Some(format @ ("toml" | "json")) => parse_str(content, format),
        _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
    }
}

fn parse_str(content: &str, format: &str) -> Result<Options, ConfigError> {
    match format.to_lowercase().as_str() {
        "toml" => Ok(toml::from_str(content)?),
        "json" => Ok(serde_json::from_str(content)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// `ALLOW_ORIGINS` becomes `allow-origins`.
fn env_segment(segment: &str) -> String {
    segment.to_lowercase().replace('_', "-")
}

/// Converts `raw` to the JSON type already held at the target.
fn coerce(current: &Value, raw: &str) -> Result<Value, String> {
    match current {
        Value::Array(_) => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
        Value::Bool(_) => parse_bool(raw)
            .map(Value::Bool)
            .ok_or_else(|| "expected boolean".to_string()),
        Value::Number(n) if n.is_u64() => raw
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| "expected unsigned integer".to_string()),
        Value::Number(n) if n.is_i64() => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| "expected integer".to_string()),
        Value::Number(_) => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| "expected number".to_string()),
        Value::Object(_) => Err("cannot override a whole section".to_string()),
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
    }
}

/// Parse a boolean from a string.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigDuration, MiddlewareName};
    use std::io::Write;

    #[test]
    fn test_loader_new() {
        let options = ConfigLoader::new().load().unwrap();
        assert_eq!(options, Options::default().complete());
    }

    #[test]
    fn test_loader_with_string_toml() {
        let toml = r#"
            enabled = ["recovery", "cors"]

            [cors]
            allow-origins = ["https://example.com"]
            allow-credentials = true
        "#;

        let options = ConfigLoader::new()
            .with_string(toml, "toml")
            .unwrap()
            .load()
            .unwrap();

        assert!(options.is_enabled(MiddlewareName::Cors));
        assert!(options.cors.allow_credentials);
        assert_eq!(options.timeout.timeout, ConfigDuration::from_secs(30));
    }

    #[test]
    fn test_loader_rejects_invalid_enabled_record() {
        let json = r#"{"enabled": ["cors"], "cors": {"allow-origins": ["*"], "allow-credentials": true}}"#;
        let err = ConfigLoader::new()
            .with_string(json, "json")
            .unwrap()
            .load()
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("wildcard"));
        assert!(text.contains("credentials"));
    }

    #[test]
    fn test_loader_with_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"enabled": ["timeout"], "timeout": {{"timeout": 2500}}}}"#).unwrap();

        let options = ConfigLoader::new()
            .with_file(file.path())
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(options.timeout.timeout, ConfigDuration::from_millis(2500));
    }

    #[test]
    fn test_loader_with_file_not_found() {
        let result = ConfigLoader::new().with_file("/nonexistent/keel.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_loader_with_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let result = ConfigLoader::new().with_file(file.path());
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_loader_with_optional_file_not_found() {
        let options = ConfigLoader::new()
            .with_optional_file("/nonexistent/keel.toml")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(options.enabled_names().len(), 5);
    }

    #[test]
    fn test_apply_env_var_duration() {
        let mut loader = ConfigLoader::new();
        loader
            .apply_env_var("TEST__TIMEOUT__TIMEOUT", "5s", "TEST")
            .unwrap();
        assert_eq!(loader.options.timeout.timeout, ConfigDuration::from_secs(5));
    }

    #[test]
    fn test_apply_env_var_lists_and_bools() {
        let mut loader = ConfigLoader::new();
        loader
            .apply_env_var("TEST__ENABLED", "recovery, cors", "TEST")
            .unwrap();
        loader
            .apply_env_var(
                "TEST__CORS__ALLOW_ORIGINS",
                "https://a.example,https://b.example",
                "TEST",
            )
            .unwrap();
        loader
            .apply_env_var("TEST__CORS__ALLOW_CREDENTIALS", "yes", "TEST")
            .unwrap();
        loader
            .apply_env_var("TEST__RATE_LIMIT__LIMIT", "7", "TEST")
            .unwrap();

        let options = loader.load().unwrap();
        assert_eq!(options.enabled, vec!["recovery", "cors"]);
        assert_eq!(options.cors.allow_origins.len(), 2);
        assert!(options.cors.allow_credentials);
        assert_eq!(options.rate_limit.limit, 7);
    }

    #[test]
    fn test_apply_env_var_errors() {
        let mut loader = ConfigLoader::new();
        assert!(loader
            .apply_env_var("TEST__RATE_LIMIT__LIMIT", "many", "TEST")
            .is_err());
        assert!(loader
            .apply_env_var("TEST__NOPE__FIELD", "1", "TEST")
            .is_err());
        assert!(loader
            .apply_env_var("TEST__TIMEOUT__TIMEOUT", "soon", "TEST")
            .is_err());
        assert!(loader.apply_env_var("TEST__CORS", "x", "TEST").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
