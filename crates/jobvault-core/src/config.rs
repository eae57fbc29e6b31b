//! Store configuration.
//!
//! A [`StoreConfig`] is handed to `initialize`, persisted inside the store,
//! and recovered by `resume`. Callers usually build it with:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with `JOBVAULT_` prefix)
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::job::Requirements;

/// Store configuration persisted alongside the jobs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Requirements applied to jobs that do not specify their own.
    #[serde(default)]
    pub default_requirements: Requirements,

    /// Path to the server-side encryption key (32 bytes).
    #[serde(default)]
    pub sse_key: Option<PathBuf>,

    /// Path to the client-side encryption key (32 bytes).
    #[serde(default)]
    pub cse_key: Option<PathBuf>,

    /// Multipart part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Largest stored size kept inline in a metadata record.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: u64,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("default_requirements", &self.default_requirements)
            .field("sse_key", &self.sse_key.as_ref().map(|_| "[REDACTED]"))
            .field("cse_key", &self.cse_key.as_ref().map(|_| "[REDACTED]"))
            .field("part_size", &self.part_size)
            .field("inline_threshold", &self.inline_threshold)
            .finish()
    }
}

/// Default multipart part size (50 MiB).
pub const DEFAULT_PART_SIZE: u64 = 50 * 1024 * 1024;

/// Default inline threshold (2 KiB).
pub const DEFAULT_INLINE_THRESHOLD: u64 = 2 * 1024;

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_inline_threshold() -> u64 {
    DEFAULT_INLINE_THRESHOLD
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            default_requirements: Requirements::default(),
            sse_key: None,
            cse_key: None,
            part_size: default_part_size(),
            inline_threshold: default_inline_threshold(),
        }
    }
}

impl StoreConfig {
    /// Set the server-side key path.
    pub fn with_sse_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.sse_key = Some(path.into());
        self
    }

    /// Set the client-side key path.
    pub fn with_cse_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.cse_key = Some(path.into());
        self
    }

    /// Set the multipart part size.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set the inline threshold.
    pub fn with_inline_threshold(mut self, threshold: u64) -> Self {
        self.inline_threshold = threshold;
        self
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml_str(contents: &str) -> StoreResult<Self> {
        let config: StoreConfig =
            serde_yaml_ng::from_str(contents).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with the following precedence:
    /// 1. Load from file if provided
    /// 2. Apply environment variable overrides
    pub fn load(config_file: Option<&Path>) -> StoreResult<Self> {
        let config = match config_file {
            Some(path) => Self::from_yaml_file(path)?,
            None => StoreConfig::default(),
        };
        let config = config.merge_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Merge environment overrides looked up through `var`.
    ///
    /// Only variables that are set override the current values; unparseable
    /// numbers are ignored with a warning.
    pub fn merge_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %value, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        if let Some(v) = var("JOBVAULT_SSE_KEY") {
            self.sse_key = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("JOBVAULT_CSE_KEY") {
            self.cse_key = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = parsed("JOBVAULT_PART_SIZE", var("JOBVAULT_PART_SIZE")) {
            self.part_size = v;
        }
        if let Some(v) = parsed("JOBVAULT_INLINE_THRESHOLD", var("JOBVAULT_INLINE_THRESHOLD")) {
            self.inline_threshold = v;
        }
        if let Some(v) = parsed("JOBVAULT_DEFAULT_MEMORY", var("JOBVAULT_DEFAULT_MEMORY")) {
            self.default_requirements.memory = v;
        }
        if let Some(v) = parsed("JOBVAULT_DEFAULT_CORES", var("JOBVAULT_DEFAULT_CORES")) {
            self.default_requirements.cores = v;
        }
        if let Some(v) = parsed("JOBVAULT_DEFAULT_DISK", var("JOBVAULT_DEFAULT_DISK")) {
            self.default_requirements.disk = v;
        }
        if let Some(v) = parsed(
            "JOBVAULT_DEFAULT_PREEMPTABLE",
            var("JOBVAULT_DEFAULT_PREEMPTABLE"),
        ) {
            self.default_requirements.preemptable = v;
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> StoreResult<()> {
        if self.part_size == 0 {
            return Err(StoreError::Config("part_size must be positive".to_string()));
        }
        if self.inline_threshold >= self.part_size {
            return Err(StoreError::Config(format!(
                "inline_threshold ({}) must be smaller than part_size ({})",
                self.inline_threshold, self.part_size
            )));
        }
        let cores = self.default_requirements.cores;
        if !cores.is_finite() || cores < 0.0 {
            return Err(StoreError::Config(format!(
                "default cores must be a non-negative number, got {cores}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.sse_key.is_none());
        assert!(config.cse_key.is_none());
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
    }

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let yaml = r"
cse_key: /etc/jobvault/cse.key
part_size: 5242880
default_requirements:
  memory: 12
  cores: 34.0
  disk: 35
  preemptable: true
";
        let config = StoreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cse_key, Some(PathBuf::from("/etc/jobvault/cse.key")));
        assert_eq!(config.part_size, 5 * 1024 * 1024);
        assert_eq!(config.inline_threshold, DEFAULT_INLINE_THRESHOLD);
        assert!(config.default_requirements.preemptable);
    }

    #[test]
    fn test_env_overrides_only_set_values() {
        let env: HashMap<&str, &str> = [
            ("JOBVAULT_PART_SIZE", "65536"),
            ("JOBVAULT_SSE_KEY", "/keys/sse"),
            ("JOBVAULT_DEFAULT_CORES", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = StoreConfig::default()
            .with_cse_key("/keys/cse")
            .merge_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.part_size, 65536);
        assert_eq!(config.sse_key, Some(PathBuf::from("/keys/sse")));
        assert_eq!(config.cse_key, Some(PathBuf::from("/keys/cse")));
        assert_eq!(config.default_requirements.cores, 1.0);
    }

    #[test]
    fn test_validation_rejects_bad_sizes() {
        assert!(StoreConfig::default().with_part_size(0).validate().is_err());
        assert!(
            StoreConfig::default()
                .with_part_size(1024)
                .with_inline_threshold(1024)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validation_rejects_bad_cores() {
        for cores in [-1.0, f64::NAN, f64::INFINITY] {
            let mut config = StoreConfig::default();
            config.default_requirements.cores = cores;
            assert!(
                matches!(config.validate(), Err(StoreError::Config(_))),
                "{cores}"
            );
        }
        let mut config = StoreConfig::default();
        config.default_requirements.cores = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_key_paths() {
        let config = StoreConfig::default().with_sse_key("/secret/path");
        let debug = format!("{config:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("/secret/path"));
    }
}
