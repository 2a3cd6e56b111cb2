use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LivenetError;

/// Architecture hyperparameters, fixed at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    /// Window length D (time steps per sample).
    pub dimension: usize,
    pub learning_rate: f64,
    /// Log the layer summary at build time and per-epoch progress at info level.
    pub verbose: bool,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            learning_rate: 1e-4,
            verbose: false,
        }
    }
}

impl ArchitectureConfig {
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }
}

/// Options for `Architecture::fit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Reshuffle sample order every epoch.
    pub shuffle: bool,
    pub seed: u64,
    /// Stop after this many epochs without improvement of the monitored loss
    /// (validation loss when validation data is given). 0 disables.
    pub early_stopping_patience: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            shuffle: true,
            seed: 42,
            early_stopping_patience: 0,
        }
    }
}

/// Top-level config file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub architecture: ArchitectureConfig,
    pub fit: FitConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, LivenetError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, LivenetError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LivenetError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), LivenetError> {
        self.architecture.validate()?;
        self.fit.validate()
    }
}

impl ArchitectureConfig {
    pub fn validate(&self) -> Result<(), LivenetError> {
        if self.dimension == 0 {
            return Err(LivenetError::InvalidConfig(
                "architecture.dimension must be > 0".into(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(LivenetError::InvalidConfig(format!(
                "architecture.learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<(), LivenetError> {
        if self.epochs == 0 {
            return Err(LivenetError::InvalidConfig("fit.epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(LivenetError::InvalidConfig(
                "fit.batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_follow_keras_conventions() {
        let cfg = Config::default();
        assert_eq!(cfg.architecture.learning_rate, 1e-4);
        assert!(!cfg.architecture.verbose);
        assert_eq!(cfg.fit.batch_size, 32);
        assert!(cfg.fit.shuffle);
        assert_eq!(cfg.fit.early_stopping_patience, 0);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [architecture]
            dimension = 300

            [fit]
            epochs = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.architecture.dimension, 300);
        assert_eq!(cfg.architecture.learning_rate, 1e-4);
        assert_eq!(cfg.fit.epochs, 3);
        assert_eq!(cfg.fit.batch_size, 32);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let err = Config::from_toml_str("[architecture]\ndimension = 0\n").unwrap_err();
        assert!(matches!(err, LivenetError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_non_positive_learning_rate() {
        let err =
            Config::from_toml_str("[architecture]\nlearning_rate = -0.5\n").unwrap_err();
        assert!(matches!(err, LivenetError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = Config::from_toml_str("[fit]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, LivenetError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = Config::from_toml_str("[fit\nepochs = ").unwrap_err();
        assert!(matches!(err, LivenetError::ConfigParse(_)));
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[architecture]\ndimension = 64\nverbose = true").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.architecture.dimension, 64);
        assert!(cfg.architecture.verbose);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, LivenetError::ConfigRead { .. }));
    }
}
