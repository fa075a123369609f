//! Root configuration for the expert-of-experts model.
//!
//! # TOML Structure
//!
//! ```toml
//! [model]
//! task_name = "RelationExtraction"
//! hidden_size = 768
//! class_per_task = 4
//! default_expert = "task"
//! query_mode = "mahalanobis"
//! max_expert = 3
//!
//! [regularizer]
//! number_description = 3
//! temperature = 0.8
//! weight = 0.5
//!
//! [descriptions]
//! file = "datasets/FewRel/relation_description_detail_10.txt"
//! ```
//!
//! Invalid configuration returns an error; nothing is silently defaulted
//! after parsing.

mod descriptions;
mod model;
mod regularizer;

pub use descriptions::DescriptionConfig;
pub use model::{DefaultExpert, ModelConfig, QueryMode, TaskKind};
pub use regularizer::RegularizerConfig;

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EoeError, EoeResult};

/// Root configuration.
///
/// # Example
///
/// ```
/// use eoe_core::EoeConfig;
///
/// let config = EoeConfig::default();
/// config.validate().expect("Defaults should be valid");
/// assert_eq!(config.regularizer.number_description, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EoeConfig {
    /// Routing, classifier and device settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Description-contrastive regularizer settings.
    #[serde(default)]
    pub regularizer: RegularizerConfig,

    /// Label description source.
    #[serde(default)]
    pub descriptions: DescriptionConfig,
}

impl EoeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `EoeError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> EoeResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| EoeError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        toml::from_str(&contents).map_err(|e| EoeError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Create configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> EoeResult<Self> {
        toml::from_str(toml).map_err(|e| EoeError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> EoeResult<String> {
        toml::to_string_pretty(self).map_err(|e| EoeError::ConfigError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Validate all sections, returning the first error found.
    pub fn validate(&self) -> EoeResult<()> {
        self.model.validate().map_err(|e| EoeError::ConfigError {
            message: format!("[model] {}", e),
        })?;

        self.regularizer
            .validate()
            .map_err(|e| EoeError::ConfigError {
                message: format!("[regularizer] {}", e),
            })?;

        self.descriptions
            .validate()
            .map_err(|e| EoeError::ConfigError {
                message: format!("[descriptions] {}", e),
            })?;

        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `EOE_`
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `EOE_CLASS_PER_TASK` | `model.class_per_task` | usize |
    /// | `EOE_DEFAULT_EXPERT` | `model.default_expert` | `bert` / `task` |
    /// | `EOE_QUERY_MODE` | `model.query_mode` | String |
    /// | `EOE_MAX_EXPERT` | `model.max_expert` | i64, `-1` = unlimited |
    /// | `EOE_USE_CUDA` | `model.use_cuda` | bool |
    /// | `EOE_NUMBER_DESCRIPTION` | `regularizer.number_description` | usize |
    /// | `EOE_DESCRIPTION_FILE` | `descriptions.file` | path |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("EOE_CLASS_PER_TASK") {
            if let Ok(n) = val.parse::<usize>() {
                self.model.class_per_task = n;
            }
        }
        if let Ok(val) = env::var("EOE_DEFAULT_EXPERT") {
            match val.to_lowercase().as_str() {
                "bert" => self.model.default_expert = DefaultExpert::Bert,
                "task" => self.model.default_expert = DefaultExpert::Task,
                _ => {}
            }
        }
        if let Ok(val) = env::var("EOE_QUERY_MODE") {
            self.model.query_mode = QueryMode::from(val);
        }
        if let Ok(val) = env::var("EOE_MAX_EXPERT") {
            if let Ok(n) = val.parse::<i64>() {
                self.model.max_expert = usize::try_from(n).ok();
            }
        }
        if let Ok(val) = env::var("EOE_USE_CUDA") {
            if let Ok(b) = val.parse::<bool>() {
                self.model.use_cuda = b;
            }
        }

        if let Ok(val) = env::var("EOE_NUMBER_DESCRIPTION") {
            if let Ok(n) = val.parse::<usize>() {
                self.regularizer.number_description = n;
            }
        }

        if let Ok(val) = env::var("EOE_DESCRIPTION_FILE") {
            self.descriptions.file = Some(PathBuf::from(val));
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EoeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.default_expert, DefaultExpert::Task);
        assert!(config.model.max_expert.is_none());
    }

    #[test]
    fn test_from_toml_str() {
        let toml = r#"
[model]
task_name = "TextClassification"
hidden_size = 32
class_per_task = 2
default_expert = "bert"
query_mode = "euclidean"
max_expert = 1

[regularizer]
number_description = 2
"#;
        let config = EoeConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.model.task_name, TaskKind::TextClassification);
        assert_eq!(config.model.query_size(), 32);
        assert_eq!(config.model.default_expert, DefaultExpert::Bert);
        assert_eq!(config.model.query_mode, QueryMode::Euclidean);
        assert_eq!(config.model.max_expert, Some(1));
        assert_eq!(config.regularizer.number_description, 2);
        assert_eq!(config.regularizer.temperature, 0.8);
    }

    #[test]
    fn test_unknown_query_mode_parses_but_fails_validation() {
        let config = EoeConfig::from_toml_str("[model]\nquery_mode = \"manhattan\"\n").unwrap();
        assert_eq!(
            config.model.query_mode,
            QueryMode::Unsupported("manhattan".to_string())
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[model]"));
    }

    #[test]
    fn test_zero_description_slots_fail_validation() {
        let config =
            EoeConfig::from_toml_str("[regularizer]\nnumber_description = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[regularizer]"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EoeConfig::default();
        config.model.query_mode = QueryMode::Cosine;
        config.model.max_expert = Some(2);
        config.descriptions.file = Some(PathBuf::from("labels.txt"));

        let text = config.to_toml_string().unwrap();
        let parsed = EoeConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.model.query_mode, QueryMode::Cosine);
        assert_eq!(parsed.model.max_expert, Some(2));
        assert_eq!(parsed.descriptions.file, Some(PathBuf::from("labels.txt")));
    }

    #[test]
    fn test_from_file_missing() {
        let err = EoeConfig::from_file("/nonexistent/eoe.toml").unwrap_err();
        assert!(matches!(err, EoeError::ConfigError { .. }));
    }
}
