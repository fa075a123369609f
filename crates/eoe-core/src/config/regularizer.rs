//! Description-contrastive regularizer configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EoeError, EoeResult};

/// Regularizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularizerConfig {
    /// Number of description slots per label (default: 3).
    #[serde(default = "default_number_description")]
    pub number_description: usize,

    /// Softmax temperature (default: 0.8).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Weight of the contrastive term added to cross-entropy (default: 0.5).
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_number_description() -> usize {
    3
}

fn default_temperature() -> f32 {
    0.8
}

fn default_weight() -> f32 {
    0.5
}

impl Default for RegularizerConfig {
    fn default() -> Self {
        Self {
            number_description: default_number_description(),
            temperature: default_temperature(),
            weight: default_weight(),
        }
    }
}

impl RegularizerConfig {
    /// Validate regularizer configuration.
    ///
    /// Zero description slots would divide the contrastive term by zero and is
    /// rejected before any training step runs.
    pub fn validate(&self) -> EoeResult<()> {
        if self.number_description == 0 {
            return Err(EoeError::ConfigError {
                message: "number_description must be > 0".to_string(),
            });
        }

        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(EoeError::ConfigError {
                message: format!("temperature must be finite and > 0, got {}", self.temperature),
            });
        }

        if !self.weight.is_finite() {
            return Err(EoeError::ConfigError {
                message: format!("weight must be finite, got {}", self.weight),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegularizerConfig::default();
        assert_eq!(config.number_description, 3);
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.weight, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_descriptions_rejected() {
        let config = RegularizerConfig {
            number_description: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_positive_temperature_rejected() {
        let config = RegularizerConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
