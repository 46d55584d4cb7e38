//! Tree and tool configuration.
//!
//! [`TreeConfig`] carries the limits every tree is constructed with.
//! [`InspectConfig`] configures the inspection binary. Both load from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `CELLBTREE_MAX_KEY_SIZE`: largest stored key in bytes (default: `1024`)
//! - `CELLBTREE_MAX_PATH_LENGTH`: deepest allowed root-to-leaf path (default: `64`)
//! - `CELLBTREE_CURSOR_PREFETCH_SIZE`: largest cursor batch (default: `512`)
//! - `CELLBTREE_DATA_DIRECTORY`: directory holding the index files (default: `./data`)
//! - `CELLBTREE_INDEX_NAME`: name of the index to inspect (required by the binary)
//! - `CELLBTREE_KEY_SIZE`: number of components of the index key (default: `1`)
//!
//! # Invariants
//!
//! - a validated `TreeConfig` has `max_key_size <= MAX_KEY_SIZE_LIMIT`
//! - `max_path_length >= 2` and `cursor_prefetch_size >= 1`

use std::path::PathBuf;
use std::str::FromStr;

use crate::storage::btree::bucket::MAX_KEY_SIZE_LIMIT;

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Limits applied by a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Largest stored key (serialized, and encrypted if enabled) in bytes.
    pub max_key_size: usize,
    /// Deepest root-to-leaf path before the tree is considered corrupt.
    pub max_path_length: usize,
    /// Upper bound on the number of entries a cursor fetches at once.
    pub cursor_prefetch_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_key_size: Self::DEFAULT_MAX_KEY_SIZE,
            max_path_length: Self::DEFAULT_MAX_PATH_LENGTH,
            cursor_prefetch_size: Self::DEFAULT_CURSOR_PREFETCH_SIZE,
        }
    }
}

impl TreeConfig {
    pub const DEFAULT_MAX_KEY_SIZE: usize = 1024;
    pub const DEFAULT_MAX_PATH_LENGTH: usize = 64;
    pub const DEFAULT_CURSOR_PREFETCH_SIZE: usize = 512;

    const MAX_KEY_SIZE_VAR: &'static str = "CELLBTREE_MAX_KEY_SIZE";
    const MAX_PATH_LENGTH_VAR: &'static str = "CELLBTREE_MAX_PATH_LENGTH";
    const CURSOR_PREFETCH_SIZE_VAR: &'static str = "CELLBTREE_CURSOR_PREFETCH_SIZE";

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to something that is not a
    /// number, or the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            max_key_size: parse_var(&lookup, Self::MAX_KEY_SIZE_VAR, Self::DEFAULT_MAX_KEY_SIZE)?,
            max_path_length: parse_var(
                &lookup,
                Self::MAX_PATH_LENGTH_VAR,
                Self::DEFAULT_MAX_PATH_LENGTH,
            )?,
            cursor_prefetch_size: parse_var(
                &lookup,
                Self::CURSOR_PREFETCH_SIZE_VAR,
                Self::DEFAULT_CURSOR_PREFETCH_SIZE,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the limits against what the page layout supports.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE_LIMIT {
            return Err(ConfigError::InvalidValue {
                name: Self::MAX_KEY_SIZE_VAR.to_string(),
                message: format!(
                    "{} must be between 1 and {MAX_KEY_SIZE_LIMIT}",
                    self.max_key_size
                ),
            });
        }
        if self.max_path_length < 2 {
            return Err(ConfigError::InvalidValue {
                name: Self::MAX_PATH_LENGTH_VAR.to_string(),
                message: format!("{} must be at least 2", self.max_path_length),
            });
        }
        if self.cursor_prefetch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: Self::CURSOR_PREFETCH_SIZE_VAR.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration of the inspection binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectConfig {
    /// Directory holding the index files.
    pub data_directory: PathBuf,
    /// Name of the index to open.
    pub index_name: String,
    /// Number of components of the index key.
    pub key_size: usize,
    /// Limits the tree is opened with.
    pub tree: TreeConfig,
}

impl InspectConfig {
    /// Default data directory.
    pub const DEFAULT_DATA_DIRECTORY: &'static str = "./data";

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `CELLBTREE_INDEX_NAME` is not set or empty, or
    /// any numeric variable is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let index_name = lookup("CELLBTREE_INDEX_NAME")
            .ok_or_else(|| ConfigError::MissingEnvVar("CELLBTREE_INDEX_NAME".to_string()))?;
        if index_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "CELLBTREE_INDEX_NAME".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let data_directory = lookup("CELLBTREE_DATA_DIRECTORY")
            .map_or_else(|| PathBuf::from(Self::DEFAULT_DATA_DIRECTORY), PathBuf::from);

        let key_size = parse_var(&lookup, "CELLBTREE_KEY_SIZE", 1)?;
        if key_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CELLBTREE_KEY_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            data_directory,
            index_name,
            key_size,
            tree: TreeConfig::from_vars(lookup)?,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    lookup(name).map_or(Ok(default), |value| {
        value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid number"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = TreeConfig::from_vars(vars(&[])).expect("defaults");
        assert_eq!(config, TreeConfig::default());
        assert_eq!(config.max_key_size, 1024);
        assert_eq!(config.max_path_length, 64);
        assert_eq!(config.cursor_prefetch_size, 512);
    }

    #[test]
    fn test_overrides() {
        let config = TreeConfig::from_vars(vars(&[
            ("CELLBTREE_MAX_KEY_SIZE", "200"),
            ("CELLBTREE_MAX_PATH_LENGTH", "8"),
            ("CELLBTREE_CURSOR_PREFETCH_SIZE", " 16 "),
        ]))
        .expect("valid overrides");
        assert_eq!(config.max_key_size, 200);
        assert_eq!(config.max_path_length, 8);
        assert_eq!(config.cursor_prefetch_size, 16);
    }

    #[test]
    fn test_invalid_values() {
        let err = TreeConfig::from_vars(vars(&[("CELLBTREE_MAX_KEY_SIZE", "big")]))
            .expect_err("not a number");
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "CELLBTREE_MAX_KEY_SIZE"));

        let too_big = (MAX_KEY_SIZE_LIMIT + 1).to_string();
        assert!(TreeConfig::from_vars(vars(&[("CELLBTREE_MAX_KEY_SIZE", &too_big)])).is_err());
        assert!(TreeConfig::from_vars(vars(&[("CELLBTREE_MAX_PATH_LENGTH", "1")])).is_err());
        assert!(TreeConfig::from_vars(vars(&[("CELLBTREE_CURSOR_PREFETCH_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_inspect_config() {
        let err = InspectConfig::from_vars(vars(&[])).expect_err("index name required");
        assert_eq!(err, ConfigError::MissingEnvVar("CELLBTREE_INDEX_NAME".to_string()));

        let config = InspectConfig::from_vars(vars(&[
            ("CELLBTREE_INDEX_NAME", "people_by_age"),
            ("CELLBTREE_KEY_SIZE", "2"),
        ]))
        .expect("valid config");
        assert_eq!(config.index_name, "people_by_age");
        assert_eq!(config.key_size, 2);
        assert_eq!(config.data_directory, PathBuf::from("./data"));
        assert_eq!(config.tree, TreeConfig::default());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
        assert_eq!(
            ConfigError::MissingEnvVar("X".to_string()).to_string(),
            "missing required environment variable: X"
        );
    }
}
