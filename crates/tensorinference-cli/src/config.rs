//! Configuration file support
//!
//! Supports loading configuration from .tensorinferencerc files in:
//! - Custom path via environment variable
//! - Current directory
//! - User home directory

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tensorinference::{ContractionOptions, EliminationStrategy};

use crate::cli::OutputFormat;
use crate::output::print_warning;

const FILE_NAME: &str = ".tensorinferencerc";
const ENV_VAR: &str = "TENSORINFERENCE_CONFIG";

/// Configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default output format
    pub output_format: OutputFormat,

    /// Log filter used when RUST_LOG is unset
    pub log_level: String,

    /// Enable colored output
    pub colored: bool,

    /// Elimination heuristic for contraction planning
    pub strategy: EliminationStrategy,

    /// Evaluator settings
    pub contraction: ContractionOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Text,
            log_level: "warn".to_string(),
            colored: true,
            strategy: EliminationStrategy::default(),
            contraction: ContractionOptions::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Find and load configuration file
    ///
    /// Search order:
    /// 1. TENSORINFERENCE_CONFIG environment variable
    /// 2. .tensorinferencerc in current directory
    /// 3. .tensorinferencerc in user home directory
    pub fn load_default() -> Self {
        for path in Self::candidates() {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return config,
                    Err(e) => print_warning(&format!("ignoring config file: {:#}", e)),
                }
            }
        }
        Self::default()
    }

    /// Get configuration file path (environment, current or home)
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(ENV_VAR) {
            return PathBuf::from(path);
        }

        let current = PathBuf::from(FILE_NAME);
        if current.exists() {
            return current;
        }

        match dirs::home_dir() {
            Some(home) => home.join(FILE_NAME),
            None => current,
        }
    }

    /// Create a default configuration file
    pub fn create_default() -> Result<PathBuf> {
        let path = Self::config_path();
        Self::default().save(&path)?;
        Ok(path)
    }

    fn candidates() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var(ENV_VAR) {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from(FILE_NAME));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(FILE_NAME));
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output_format, OutputFormat::Text);
        assert_eq!(config.strategy, EliminationStrategy::MinFill);
        assert!(config.contraction.parallel);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            "output_format = \"json\"\nstrategy = \"min-degree\"\n\n[contraction]\nparallel = false\n",
        )
        .unwrap();
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.strategy, EliminationStrategy::MinDegree);
        assert!(!config.contraction.parallel);
        assert_eq!(config.contraction.max_tensor_size, ContractionOptions::default().max_tensor_size);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_load_and_save() {
        let path = std::env::temp_dir().join(format!("tensorinferencerc_{}", std::process::id()));
        let mut config = Config::default();
        config.colored = false;
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
        fs::remove_file(&path).ok();

        assert!(Config::load(Path::new("/nonexistent/.tensorinferencerc")).is_err());
    }
}
