//! Configuration with environment variable and file-based loading.
//!
//! Environment variables:
//! - `HOARD_PATH`: base path for the directory fallback tier
//! - `HOARD_BYTE_BUDGET`: cache-tier byte budget
//! - `HOARD_READONLY`: set to "true" for read-only mode
//!
//! Default path: `~/.hoard`

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tiered::DEFAULT_BYTE_BUDGET;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid {var} value: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Configuration for a tiered content-addressed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoardConfig {
    /// Base path for the directory fallback tier. Finalized objects land
    /// in `{base_path}/objects/`, in-progress writes in
    /// `{base_path}/staging/`.
    pub base_path: PathBuf,

    /// Cache-tier byte budget.
    #[serde(default = "default_byte_budget")]
    pub byte_budget: u64,

    /// Read-only mode - prevents any writes to the fallback tier.
    #[serde(default)]
    pub read_only: bool,
}

fn default_byte_budget() -> u64 {
    DEFAULT_BYTE_BUDGET
}

/// Get the default base path (~/.hoard).
fn default_base_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".hoard"))
        .unwrap_or_else(|| PathBuf::from(".hoard"))
}

impl Default for HoardConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            byte_budget: DEFAULT_BYTE_BUDGET,
            read_only: false,
        }
    }
}

impl HoardConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_path = env::var("HOARD_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_base_path());

        let byte_budget = match env::var("HOARD_BYTE_BUDGET") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "HOARD_BYTE_BUDGET",
                value,
            })?,
            Err(_) => DEFAULT_BYTE_BUDGET,
        };

        let read_only = env::var("HOARD_READONLY")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            base_path,
            byte_budget,
            read_only,
        })
    }

    /// Load configuration from a TOML file, falling back to environment.
    ///
    /// The file should contain a `[hoard]` section:
    /// ```toml
    /// [hoard]
    /// base_path = "/tank/hoard"
    /// byte_budget = 104857600
    /// read_only = false
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let table: toml::Table = contents.parse().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        match table.get("hoard") {
            Some(section) => {
                section
                    .clone()
                    .try_into()
                    .map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })
            }
            // No [hoard] section, fall back to env.
            None => Self::from_env(),
        }
    }

    /// Create a config with a specific base path.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            byte_budget: DEFAULT_BYTE_BUDGET,
            read_only: false,
        }
    }

    /// Override the cache-tier byte budget.
    pub fn with_byte_budget(mut self, byte_budget: u64) -> Self {
        self.byte_budget = byte_budget;
        self
    }

    /// Create a read-only config with a specific base path.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            byte_budget: DEFAULT_BYTE_BUDGET,
            read_only: true,
        }
    }
}
