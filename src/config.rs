//! Server configuration.

use crate::s11n::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Limits and management values shared read-only by every connection.
///
/// ```toml
/// max_conns = 100
/// max_reqs = 50
/// multiplex = false
///
/// [value_map]
/// X_APP_NAME = "roles"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Simultaneous connections the server admits.
    pub max_conns: usize,
    /// Simultaneous requests per connection.
    pub max_reqs: usize,
    /// Whether one connection may carry several requests at once.
    pub multiplex: bool,
    /// Extra `FCGI_GET_VALUES` answers. Entries here override the built-in ones.
    pub value_map: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_conns: 2000,
            max_reqs: 2000,
            multiplex: true,
            value_map: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<ServerConfig, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        ServerConfig::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conns == 0 {
            return Err(ConfigError::Invalid("max_conns must be at least 1".to_owned()));
        }
        if self.max_conns > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(
                format!("max_conns must be at most {}", Semaphore::MAX_PERMITS)));
        }
        if self.max_reqs == 0 {
            return Err(ConfigError::Invalid("max_reqs must be at least 1".to_owned()));
        }
        Ok(())
    }

    /// The values a web server can query with `FCGI_GET_VALUES`.
    pub fn management_values(&self) -> HashMap<String, String> {
        let mut values = HashMap::new();
        values.insert(FCGI_MAX_CONNS.to_owned(), self.max_conns.to_string());
        values.insert(FCGI_MAX_REQS.to_owned(), self.max_reqs.to_string());
        values.insert(FCGI_MPXS_CONNS.to_owned(),
                      if self.multiplex { "1" } else { "0" }.to_owned());
        for (name, value) in self.value_map.iter() {
            values.insert(name.clone(), value.clone());
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(ServerConfig::from_toml_str("").unwrap(), ServerConfig::default());
    }

    #[test]
    fn partial_toml() {
        let config = ServerConfig::from_toml_str(r#"
            max_reqs = 1
            multiplex = false

            [value_map]
            X_APP_NAME = "roles"
        "#).unwrap();
        assert_eq!(config.max_conns, 2000);
        assert_eq!(config.max_reqs, 1);
        assert!(!config.multiplex);
        assert_eq!(config.value_map.get("X_APP_NAME").map(String::as_str), Some("roles"));
    }

    #[test]
    fn zero_limits_rejected() {
        assert!(matches!(ServerConfig::from_toml_str("max_conns = 0"),
                         Err(ConfigError::Invalid(_))));
        assert!(matches!(ServerConfig::from_toml_str("max_reqs = 0"),
                         Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn huge_max_conns_rejected() {
        let config = ServerConfig { max_conns: usize::MAX, ..ServerConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config = ServerConfig { max_conns: Semaphore::MAX_PERMITS, ..ServerConfig::default() };
        assert!(config.validate().is_ok());

        if cfg!(target_pointer_width = "64") {
            assert!(matches!(ServerConfig::from_toml_str("max_conns = 9223372036854775807"),
                             Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn bad_toml() {
        assert!(matches!(ServerConfig::from_toml_str("max_conns = \"many\""),
                         Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_missing_file() {
        assert!(matches!(ServerConfig::load("/nonexistent/fcgi.toml"), Err(ConfigError::Io(_))));
    }

    #[test]
    fn management_values_follow_config() {
        let mut config = ServerConfig { multiplex: false, ..ServerConfig::default() };
        config.value_map.insert("FCGI_MAX_REQS".to_owned(), "10".to_owned());
        config.value_map.insert("X_EXTRA".to_owned(), "yes".to_owned());
        let values = config.management_values();
        assert_eq!(values["FCGI_MAX_CONNS"], "2000");
        assert_eq!(values["FCGI_MAX_REQS"], "10");
        assert_eq!(values["FCGI_MPXS_CONNS"], "0");
        assert_eq!(values["X_EXTRA"], "yes");
    }
}
