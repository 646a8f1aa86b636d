//! Engine configuration
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! configuration file (TOML, YAML or JSON, picked by extension) and
//! `CHAINFLOW__*` environment variables (e.g. `CHAINFLOW__MAX_WORKERS=8`).

use crate::error::{ChainFlowError, Result};
use crate::retry::{BackoffKind, BackoffPolicy, DEFAULT_BACKOFF, MAX_BACKOFF, MIN_BACKOFF};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "CHAINFLOW";

/// Tunables of a [`crate::engine::WorkEngine`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the worker pool
    pub max_workers: usize,
    /// Floor applied to every backoff base delay
    pub min_backoff_ms: u64,
    /// Ceiling applied to every backoff delay
    pub max_backoff_ms: u64,
    /// Backoff used by requests without a policy
    pub default_backoff_kind: BackoffKind,
    pub default_backoff_ms: u64,
    /// `None` retries until cancelled
    pub default_max_attempts: Option<u32>,
    /// Re-check interval while waiting on constraints
    pub constraint_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            min_backoff_ms: MIN_BACKOFF.as_millis() as u64,
            max_backoff_ms: MAX_BACKOFF.as_millis() as u64,
            default_backoff_kind: BackoffKind::Exponential,
            default_backoff_ms: DEFAULT_BACKOFF.as_millis() as u64,
            default_max_attempts: None,
            constraint_poll_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path` (if any) and the environment, then validate.
    ///
    /// # Errors
    ///
    /// * `ChainFlowError::Config` - If the file is missing or malformed
    /// * `ChainFlowError::Validation` - If a value is out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        debug!("Loaded engine configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ChainFlowError::Validation(
                "max_workers must be at least 1 to avoid deadlock".to_string(),
            ));
        }
        if self.max_workers > 256 {
            return Err(ChainFlowError::Validation(
                "max_workers must be at most 256 to prevent resource exhaustion".to_string(),
            ));
        }
        if self.min_backoff_ms == 0 {
            return Err(ChainFlowError::Validation(
                "min_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ChainFlowError::Validation(format!(
                "min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.min_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.constraint_poll_ms == 0 {
            return Err(ChainFlowError::Validation(
                "constraint_poll_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn constraint_poll_interval(&self) -> Duration {
        Duration::from_millis(self.constraint_poll_ms)
    }

    /// Policy applied to requests that set none
    pub fn default_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            kind: self.default_backoff_kind,
            base_delay: Duration::from_millis(self.default_backoff_ms),
            max_attempts: self.default_max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.min_backoff(), Duration::from_secs(10));
        assert_eq!(config.max_backoff(), Duration::from_secs(5 * 60 * 60));
        assert_eq!(config.default_backoff(), BackoffPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file() {
        let config = EngineConfig::load(None).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let file = write_config(
            ".yaml",
            "max_workers: 8\nmin_backoff_ms: 100\ndefault_backoff_kind: linear\ndefault_max_attempts: 3\n",
        );

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.min_backoff(), Duration::from_millis(100));
        assert_eq!(config.default_backoff_kind, BackoffKind::Linear);
        assert_eq!(config.default_max_attempts, Some(3));
        // Unset fields keep their defaults
        assert_eq!(config.constraint_poll_ms, 1_000);
    }

    #[test]
    fn test_load_toml_file() {
        let file = write_config(".toml", "max_workers = 2\nconstraint_poll_ms = 50\n");
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.constraint_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = write_config(".yaml", "max_workers: 0\n");
        assert!(matches!(
            EngineConfig::load(Some(file.path())),
            Err(ChainFlowError::Validation(_))
        ));

        let file = write_config(".yaml", "min_backoff_ms: 10\nmax_backoff_ms: 5\n");
        assert!(matches!(
            EngineConfig::load(Some(file.path())),
            Err(ChainFlowError::Validation(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            EngineConfig::load(Some(Path::new("/nonexistent/chainflow.yaml"))),
            Err(ChainFlowError::Config(_))
        ));
    }

    #[test]
    fn test_validate_limits() {
        let config = EngineConfig {
            max_workers: 257,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            constraint_poll_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // A zero floor would let unbounded retries spin without pause
        let config = EngineConfig {
            min_backoff_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ChainFlowError::Validation(msg)) if msg.contains("min_backoff_ms")
        ));

        let config = EngineConfig {
            min_backoff_ms: 1,
            max_backoff_ms: 1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
