//! Engine configuration.
//!
//! Settings come from a TOML file, then environment overrides.
//!
//! ## Environment Variables
//!
//! - `DOCQL_SCRIPT_POOL_SIZE` - number of Lua states in the script pool
//! - `DOCQL_SCRIPT_WAIT_POLL_MS` - cancellation check interval of callers
//!   blocked on the pool
//! - `DOCQL_MAX_RESPONSE_DOCUMENTS` - cap on documents in one stream response
//!
//! These can be set in a `.env` file in the working directory.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "docql.toml";

pub const ENV_SCRIPT_POOL_SIZE: &str = "DOCQL_SCRIPT_POOL_SIZE";
pub const ENV_SCRIPT_WAIT_POLL_MS: &str = "DOCQL_SCRIPT_WAIT_POLL_MS";
pub const ENV_MAX_RESPONSE_DOCUMENTS: &str = "DOCQL_MAX_RESPONSE_DOCUMENTS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to load .env file: {0}")]
    Env(#[from] dotenvy::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of sandboxed Lua states
    pub script_pool_size: usize,
    /// How often a caller blocked on the pool re-checks cancellation
    pub script_wait_poll_ms: u64,
    /// Cap on documents drained into one stream response
    pub max_response_documents: usize,
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2)
        .max(2)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_pool_size: default_pool_size(),
            script_wait_poll_ms: 10,
            max_response_documents: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, after loading `.env` if one is
    /// present.
    pub fn from_env() -> Result<Self, ConfigError> {
        ignore_missing(dotenvy::dotenv().map(|_| ()))?;
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load variables from the dotenv file at `path`. A missing file is not
    /// an error; a malformed one is.
    pub fn load_dotenv(path: &Path) -> Result<(), ConfigError> {
        ignore_missing(dotenvy::from_path(path))
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_SCRIPT_POOL_SIZE) {
            self.script_pool_size = parse_var(ENV_SCRIPT_POOL_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_SCRIPT_WAIT_POLL_MS) {
            self.script_wait_poll_ms = parse_var(ENV_SCRIPT_WAIT_POLL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_RESPONSE_DOCUMENTS) {
            self.max_response_documents = parse_var(ENV_MAX_RESPONSE_DOCUMENTS, &v)?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.script_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "script_pool_size".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn script_wait_poll(&self) -> Duration {
        Duration::from_millis(self.script_wait_poll_ms.max(1))
    }
}

fn ignore_missing(result: Result<(), dotenvy::Error>) -> Result<(), ConfigError> {
    match result {
        Err(e) if e.not_found() => Ok(()),
        other => other.map_err(ConfigError::from),
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.script_pool_size >= 2);
        assert_eq!(config.script_wait_poll_ms, 10);
        assert_eq!(config.max_response_documents, 100_000);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str("script_pool_size = 3\n").unwrap();
        assert_eq!(config.script_pool_size, 3);
        assert_eq!(config.max_response_documents, 100_000);

        assert!(matches!(
            EngineConfig::from_toml_str("script_pool_size = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("script_pool_size = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SCRIPT_POOL_SIZE, "6"),
            (ENV_MAX_RESPONSE_DOCUMENTS, " 50 "),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.script_pool_size, 6);
        assert_eq!(config.max_response_documents, 50);
        assert_eq!(config.script_wait_poll_ms, 10);
    }

    #[test]
    fn test_invalid_override() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|name| (name == ENV_SCRIPT_WAIT_POLL_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for DOCQL_SCRIPT_WAIT_POLL_MS: soon"
        );
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_response_documents = 7").unwrap();
        writeln!(file, "script_wait_poll_ms = 25").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_response_documents, 7);
        assert_eq!(config.script_wait_poll(), Duration::from_millis(25));

        assert!(matches!(
            EngineConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_dotenv_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineConfig::load_dotenv(&dir.path().join(".env")).is_ok());

        let path = dir.path().join(".env");
        std::fs::write(&path, "<><><>\n").unwrap();
        let err = EngineConfig::load_dotenv(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
        assert!(err.to_string().starts_with("Failed to load .env file"));
    }
}
