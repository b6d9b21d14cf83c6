// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Structs used to configure a reconstruction `Session` and the `filerecon` command line application.
//!
//! Typically instantiated using `serde_yaml`.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::constants::DEFAULT_REGISTRY_CAPACITY;

const DEFAULT_CONFIG_STR: &str = include_str!("../etc/example-config.yml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub reconstruction: ReconstructionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Knobs consumed by the assemblers while finalizing files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    pub output_directory: PathBuf,

    #[serde(default = "default_true")]
    pub decompress_gzip_streams: bool,

    /// When false, range fragments are only emitted once merged into a complete file.
    #[serde(default = "default_true")]
    pub extract_partial_downloads: bool,

    #[serde(default)]
    pub defang_executable_files: bool,

    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_registry_capacity() -> usize {
    DEFAULT_REGISTRY_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ReconstructionConfig {
    pub fn with_output_directory(output_directory: impl Into<PathBuf>) -> Self {
        Self {
            output_directory: output_directory.into(),
            decompress_gzip_streams: true,
            extract_partial_downloads: true,
            defang_executable_files: false,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml_str(&contents),
            Err(e) => {
                warn!("could not open config ({e}), using default config");
                Self::from_yaml_str(DEFAULT_CONFIG_STR)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconstruction.registry_capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry_capacity must be at least 1".into(),
            ));
        }
        if self.reconstruction.output_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("output_directory is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_default_config() {
        let res = Config::from_file("/nonexistent_file_path");

        match res {
            Ok(config) => {
                assert_eq!(config.reconstruction.registry_capacity, 100);
                assert!(config.reconstruction.decompress_gzip_streams);
                assert!(!config.reconstruction.defang_executable_files);
            }
            Err(e) => {
                eprintln!("{e}");
                panic!("could not parse default config")
            }
        };
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::from_yaml_str("reconstruction:\n  output_directory: /tmp/out\n")
            .expect("minimal config");
        assert!(config.reconstruction.extract_partial_downloads);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let res = Config::from_yaml_str(
            "reconstruction:\n  output_directory: /tmp/out\n  registry_capacity: 0\n",
        );
        assert!(res.is_err());
    }
}
