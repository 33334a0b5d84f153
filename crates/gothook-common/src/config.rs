//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming a TOML file read by the process-wide engine
pub const CONFIG_ENV_VAR: &str = "GOTHOOK_CONFIG";

/// Hook engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Per-slot diagnostics
    #[serde(default)]
    pub debug: bool,
    /// Contain memory faults to the image being processed
    #[serde(default = "default_fault_protection")]
    pub fault_protection: bool,
    /// Upper bound on hook + ignore rules
    #[serde(default = "default_max_rules")]
    pub max_rules: usize,
    /// Mapping list to read images from
    #[serde(default = "default_maps_path")]
    pub maps_path: String,
    /// Name of the detached refresh thread
    #[serde(default = "default_async_thread_name")]
    pub async_thread_name: String,
    /// Logging settings applied when diagnostics are enabled
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_fault_protection() -> bool {
    true
}

fn default_max_rules() -> usize {
    4096
}

fn default_maps_path() -> String {
    "/proc/self/maps".to_string()
}

fn default_async_thread_name() -> String {
    "gothook-refresh".to_string()
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            debug: false,
            fault_protection: default_fault_protection(),
            max_rules: default_max_rules(),
            maps_path: default_maps_path(),
            async_thread_name: default_async_thread_name(),
            logging: LogConfig::default(),
        }
    }
}

impl HookConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HookConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `GOTHOOK_CONFIG` if set, defaults otherwise
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_rules == 0 {
            return Err(Error::Config("max_rules must be greater than zero".into()));
        }
        if self.maps_path.is_empty() {
            return Err(Error::Config("maps_path must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HookConfig::default();
        assert!(!config.debug);
        assert!(config.fault_protection);
        assert_eq!(config.max_rules, 4096);
        assert_eq!(config.maps_path, "/proc/self/maps");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HookConfig::from_toml_str("").unwrap();
        assert!(config.fault_protection);
        assert_eq!(config.async_thread_name, "gothook-refresh");
    }

    #[test]
    fn test_parse_overrides() {
        let config = HookConfig::from_toml_str(
            r#"
            debug = true
            fault_protection = false
            max_rules = 16

            [logging]
            level = "trace"
            "#,
        )
        .unwrap();
        assert!(config.debug);
        assert!(!config.fault_protection);
        assert_eq!(config.max_rules, 16);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_zero_max_rules_rejected() {
        let err = HookConfig::from_toml_str("max_rules = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = HookConfig::from_file("/nonexistent/gothook.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
