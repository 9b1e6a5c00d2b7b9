use crate::ensemble::ModelFormat;
use crate::explain::{DEFAULT_SUM_TOLERANCE, DEFAULT_TOP_K};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("top_k must be a positive number of features, got {0}.")]
    InvalidTopK(i64),
    #[error("sum_tolerance must be a positive finite number, got {0}.")]
    InvalidTolerance(f64),
    #[error("No {0} path was given on the command line or in the configuration file.")]
    MissingPath(&'static str),
}

/// Runtime settings. Every field may come from a TOML file and be overridden on the
/// command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub schema: Option<PathBuf>,
    pub model: Option<PathBuf>,
    #[serde(default)]
    pub model_format: ModelFormat,
    /// Signed so that non-positive values in a file are reported as such.
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_sum_tolerance")]
    pub sum_tolerance: f64,
}

fn default_top_k() -> i64 {
    DEFAULT_TOP_K as i64
}

fn default_sum_tolerance() -> f64 {
    DEFAULT_SUM_TOLERANCE
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            schema: None,
            model: None,
            model_format: ModelFormat::default(),
            top_k: default_top_k(),
            sum_tolerance: default_sum_tolerance(),
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.top_k()?;
        if !self.sum_tolerance.is_finite() || self.sum_tolerance <= 0.0 {
            return Err(ConfigError::InvalidTolerance(self.sum_tolerance));
        }
        Ok(())
    }

    pub fn top_k(&self) -> Result<usize, ConfigError> {
        match usize::try_from(self.top_k) {
            Ok(k) if k > 0 => Ok(k),
            _ => Err(ConfigError::InvalidTopK(self.top_k)),
        }
    }

    pub fn schema_path(&self) -> Result<&Path, ConfigError> {
        self.schema.as_deref().ok_or(ConfigError::MissingPath("schema"))
    }

    pub fn model_path(&self) -> Result<&Path, ConfigError> {
        self.model.as_deref().ok_or(ConfigError::MissingPath("model"))
    }
}
