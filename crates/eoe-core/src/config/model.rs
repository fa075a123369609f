//! Model-level configuration: routing metric, expert policy and device.

use std::fmt;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{EoeError, EoeResult};

/// Kind of classification task; determines the embedding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskKind {
    /// Relation extraction: subject and object marker states are concatenated.
    #[default]
    RelationExtraction,
    /// Plain text classification over a single pooled state.
    TextClassification,
}

/// Which guess the selection policy falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultExpert {
    /// The origin backbone's task guess.
    Bert,
    /// The first task adapter's task guess.
    #[default]
    Task,
}

/// Distance metric used to score a query against class means.
///
/// Parsed from its string name. Names without an implementation are kept as
/// [`QueryMode::Unsupported`] so the router can reject them when invoked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueryMode {
    /// Negative cosine similarity.
    Cosine,
    /// Euclidean distance.
    Euclidean,
    /// Squared Mahalanobis distance with the expert's shared inverse covariance.
    #[default]
    Mahalanobis,
    /// Mahalanobis distance with a per-task query embedding.
    MahaFt,
    /// Unrecognised metric name.
    Unsupported(String),
}

impl QueryMode {
    /// Canonical configuration name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::Mahalanobis => "mahalanobis",
            Self::MahaFt => "maha_ft",
            Self::Unsupported(name) => name,
        }
    }

    /// Whether the metric needs one query embedding per stored task.
    pub fn needs_per_task_query(&self) -> bool {
        matches!(self, Self::MahaFt)
    }
}

impl From<String> for QueryMode {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "cosine" => Self::Cosine,
            "euclidean" => Self::Euclidean,
            "mahalanobis" => Self::Mahalanobis,
            "maha_ft" => Self::MahaFt,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<&str> for QueryMode {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<QueryMode> for String {
    fn from(value: QueryMode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model configuration.
///
/// # Example
///
/// ```
/// use eoe_core::config::{ModelConfig, QueryMode};
///
/// let config = ModelConfig::default();
/// assert_eq!(config.query_mode, QueryMode::Mahalanobis);
/// assert_eq!(config.query_size(), 1536);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Task kind (controls query/classifier width).
    #[serde(default)]
    pub task_name: TaskKind,

    /// Hidden size of the backbone encoder.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Fixed number of classes introduced by each task.
    #[serde(default = "default_class_per_task")]
    pub class_per_task: usize,

    /// Fallback guess of the selection policy.
    #[serde(default)]
    pub default_expert: DefaultExpert,

    /// Distance metric for routing.
    #[serde(default)]
    pub query_mode: QueryMode,

    /// Highest expert-axis index allowed to vote. `None` lets every expert vote.
    #[serde(default)]
    pub max_expert: Option<usize>,

    /// Run on CUDA instead of CPU.
    #[serde(default)]
    pub use_cuda: bool,

    /// CUDA device ordinal.
    #[serde(default)]
    pub cuda_ordinal: usize,
}

fn default_hidden_size() -> usize {
    768
}

fn default_class_per_task() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            task_name: TaskKind::default(),
            hidden_size: default_hidden_size(),
            class_per_task: default_class_per_task(),
            default_expert: DefaultExpert::default(),
            query_mode: QueryMode::default(),
            max_expert: None,
            use_cuda: false,
            cuda_ordinal: 0,
        }
    }
}

impl ModelConfig {
    /// Width of routing queries and classifier inputs.
    #[must_use]
    pub fn query_size(&self) -> usize {
        match self.task_name {
            TaskKind::RelationExtraction => 2 * self.hidden_size,
            TaskKind::TextClassification => self.hidden_size,
        }
    }

    /// Resolve the configured device.
    ///
    /// # Errors
    /// - `EoeError::ConfigError` if CUDA is requested but unavailable
    pub fn device(&self) -> EoeResult<Device> {
        if !self.use_cuda {
            return Ok(Device::Cpu);
        }
        Device::new_cuda(self.cuda_ordinal).map_err(|e| EoeError::ConfigError {
            message: format!("CUDA device {} unavailable: {}", self.cuda_ordinal, e),
        })
    }

    /// Validate model configuration.
    pub fn validate(&self) -> EoeResult<()> {
        if self.hidden_size == 0 {
            return Err(EoeError::ConfigError {
                message: "hidden_size must be > 0".to_string(),
            });
        }

        if self.class_per_task == 0 {
            return Err(EoeError::ConfigError {
                message: "class_per_task must be > 0".to_string(),
            });
        }

        if let QueryMode::Unsupported(name) = &self.query_mode {
            return Err(EoeError::ConfigError {
                message: format!(
                    "Unknown query_mode '{}'. Valid modes: cosine, euclidean, mahalanobis, maha_ft",
                    name
                ),
            });
        }

        Ok(())
    }
}
