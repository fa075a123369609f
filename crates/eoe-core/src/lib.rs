//! Expert-of-experts continual relation classification.
//!
//! One adapter expert and one linear head are added per task. At inference
//! every expert scores the input against the class-conditional Gaussian
//! statistics it recorded for each task, and a voting policy over those
//! scores picks the task whose head classifies the example. During training a
//! description-contrastive term keeps the embedding of each example close to
//! its own label's textual descriptions and away from those of older labels.
//!
//! # Architecture
//!
//! - **EoeModel**: Lifecycle controller (`new_task`, `new_statistic`, train and predict)
//! - **StatisticsStore**: Per-expert class means and covariance pseudo-inverse
//! - **ExpertRouter**: Distance metrics and task selection policy
//! - **ClassifierBank**: Per-task heads, frozen once superseded
//! - **DescriptionContrastiveLoss**: Training-time regularizer
//! - **FeatureExtractor**: Boundary to the encoder and its adapters
//!
//! # Example
//!
//! ```
//! use candle_core::Device;
//! use eoe_core::{EoeConfig, EoeModel, StubExtractor};
//!
//! let mut config = EoeConfig::default();
//! config.model.hidden_size = 16;
//! let extractor = StubExtractor::new(config.model.query_size(), &Device::Cpu);
//!
//! let mut model = EoeModel::new(config, extractor).unwrap();
//! assert_eq!(model.new_task(4).unwrap(), 0);
//! assert_eq!(model.classifiers().len(), 1);
//! ```

pub mod classifier;
pub mod config;
pub mod descriptions;
pub mod error;
pub mod expert;
pub mod extractor;
pub mod linalg;
pub mod model;
pub mod regularizer;
pub mod router;
pub mod samples;
pub mod statistics;

pub use classifier::{ClassifierBank, ClassifierHead};
pub use config::{DefaultExpert, EoeConfig, QueryMode, TaskKind};
pub use descriptions::{DescriptionFile, DescriptionStore, DescriptionTokenizer};
pub use error::{EoeError, EoeResult};
pub use expert::{ExpertId, ExtractMode};
pub use extractor::{ExtractRequest, FeatureExtractor, StubExtractor};
pub use model::{EoeModel, ExpertOutput, LossComponents, ModelState};
pub use regularizer::{DescriptionContrastiveLoss, MaskedSlot};
pub use router::{ExpertRouter, Query, RoutingDecision};
pub use samples::{build_training_examples, Batch, DescriptionSlot, LabelIndex, RawExample, TokenBatch, TrainingExample};
pub use statistics::{GaussianEstimate, StatisticsStore};
