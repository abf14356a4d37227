// SPDX-License-Identifier: Apache-2.0

//! Federation configuration
//!
//! Loaded from a JSON file; every field has a default so a partial (or
//! missing) file is valid.

use std::path::{Path, PathBuf};

use qore_core::{FederationError, FederationResult};
use qore_vtab::name::is_plain_identifier;
use qore_vtab::{BufferPolicy, DEFAULT_MODULE_NAME};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "QOREFED_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Name the module is registered under in the host.
    pub module_name: String,
    /// Policy for tables registered without an explicit one.
    pub buffer_policy: BufferPolicy,
    /// Drain member schema notifications before every statement.
    pub auto_process_member_events: bool,
    pub logging: LoggingConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            module_name: DEFAULT_MODULE_NAME.to_string(),
            buffer_policy: BufferPolicy::Buffered,
            auto_process_member_events: true,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
    /// Directory for daily rolling log files. Logs go to stderr when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "qorefed=info,qore_vtab=info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl FederationConfig {
    pub fn load(path: &Path) -> FederationResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FederationError::config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::from_json(&content)?;
        info!("Loaded federation configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_json(content: &str) -> FederationResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| FederationError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `QOREFED_CONFIG`, or the defaults.
    pub fn from_env() -> FederationResult<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                debug!("No {} set, using default configuration", CONFIG_ENV_VAR);
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> FederationResult<()> {
        if !is_plain_identifier(&self.module_name) {
            return Err(FederationError::config(format!(
                "Invalid module name '{}'",
                self.module_name
            )));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(FederationError::config("Log filter cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = FederationConfig::from_json(r#"{"buffer_policy": "pass_through"}"#).unwrap();
        assert_eq!(config.buffer_policy, BufferPolicy::PassThrough);
        assert_eq!(config.module_name, DEFAULT_MODULE_NAME);
        assert!(config.auto_process_member_events);
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_invalid_module_name() {
        let err = FederationConfig::from_json(r#"{"module_name": "bad name"}"#).unwrap_err();
        assert!(matches!(err, FederationError::Config { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"module_name": "fed", "logging": {{"json": true, "filter": "debug"}}}}"#
        )
        .unwrap();
        let config = FederationConfig::load(file.path()).unwrap();
        assert_eq!(config.module_name, "fed");
        assert!(config.logging.json);
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn test_missing_file() {
        let err = FederationConfig::load(Path::new("/nonexistent/qorefed.json")).unwrap_err();
        assert!(matches!(err, FederationError::Config { .. }));
    }
}
