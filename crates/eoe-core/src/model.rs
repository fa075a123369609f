//! Lifecycle controller for the expert-of-experts model.
//!
//! [`EoeModel`] owns every piece of continual-learning state: the classifier
//! bank, the statistics store, the label-description pools and the task and
//! label counters. It is the only place where tasks are created.
//!
//! # Task lifecycle
//!
//! ```text
//! new_task(n)        → adapter, head and statistics record for the next task
//! train_step(batch)  → cross-entropy + weighted description-contrastive term
//! observe_task(..)   → per-expert Gaussian statistics of the finished task
//! predict(batch)     → route every example to a task, classify with its head
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{safetensors, DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::ClassifierBank;
use crate::config::{EoeConfig, TaskKind};
use crate::descriptions::{DescriptionFile, DescriptionStore, DescriptionTokenizer};
use crate::error::{EoeError, EoeResult};
use crate::expert::{ExpertId, ExtractMode};
use crate::extractor::{ExtractRequest, FeatureExtractor};
use crate::regularizer::{DescriptionContrastiveLoss, MaskedSlot};
use crate::router::{ExpertRouter, Query};
use crate::samples::{Batch, DescriptionSlot};
use crate::statistics::{GaussianEstimate, StatisticsStore};

/// Lifecycle counters and layout file inside a checkpoint directory.
pub const MODEL_STATE_FILE: &str = "model_state.json";
/// Statistics tensors inside a checkpoint directory.
pub const STATISTICS_FILE: &str = "statistics.safetensors";
/// Prefix of encoder tensors in a backbone checkpoint.
pub const BACKBONE_PREFIX: &str = "model.";

/// Per-component loss values for logging.
#[derive(Debug, Clone, Default)]
pub struct LossComponents {
    /// Cross-entropy on task-local labels.
    pub cross_entropy: f32,
    /// Unweighted description-contrastive term.
    pub contrastive: f32,
    /// `cross_entropy + weight · contrastive`.
    pub total: f32,
}

/// Output of a training or prediction step.
#[derive(Debug, Clone, Default)]
pub struct ExpertOutput {
    /// Differentiable training loss.
    pub loss: Option<Tensor>,
    /// Loss components as plain values.
    pub components: Option<LossComponents>,
    /// Predicted global class ids.
    pub preds: Vec<usize>,
    /// Embeddings of the current expert (training only).
    pub hidden_states: Option<Tensor>,
    /// `batch × experts × tasks` routing scores (prediction only).
    pub task_scores: Option<Tensor>,
    /// Best class per example, expert and task (prediction only).
    pub class_indices: Option<Vec<Vec<Vec<usize>>>>,
    /// Task each example was resolved to.
    pub indices: Vec<usize>,
}

/// Statistics layout entry of one expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsLayout {
    /// Expert slot (`0` = origin).
    pub slot: usize,
    /// Number of stored class-mean matrices.
    pub num_means: usize,
    /// Number of applied statistics updates.
    pub updates: usize,
}

/// Serialized lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    /// Configuration the model was built with.
    pub config: EoeConfig,
    /// Index of the newest task.
    pub num_tasks: Option<usize>,
    /// Total labels over all tasks.
    pub num_labels: usize,
    /// Offset subtracted from global labels of the current task.
    pub num_old_labels: usize,
    /// Output size of each classifier head.
    pub head_sizes: Vec<usize>,
    /// Statistics layout per expert.
    pub statistics: Vec<StatisticsLayout>,
}

impl ModelState {
    /// Read `model_state.json` from a checkpoint directory.
    pub fn read(dir: &Path) -> EoeResult<Self> {
        let path = dir.join(MODEL_STATE_FILE);
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text).map_err(|e| EoeError::SerializationError {
            message: format!("Failed to parse '{}': {}", path.display(), e),
        })
    }
}

/// Expert-of-experts model over a feature extractor.
pub struct EoeModel<E: FeatureExtractor> {
    config: EoeConfig,
    device: Device,
    extractor: E,
    classifiers: ClassifierBank,
    statistics: StatisticsStore,
    router: ExpertRouter,
    regularizer: DescriptionContrastiveLoss,
    descriptions: DescriptionStore,
    num_tasks: Option<usize>,
    num_labels: usize,
    num_old_labels: usize,
}

impl<E: FeatureExtractor> EoeModel<E> {
    /// Create a model with no tasks.
    ///
    /// # Errors
    /// - `EoeError::ConfigError` if the configuration is invalid or the
    ///   extractor's embedding width differs from the configured query size
    pub fn new(config: EoeConfig, extractor: E) -> EoeResult<Self> {
        config.validate()?;

        let query_size = config.model.query_size();
        if extractor.query_size() != query_size {
            return Err(EoeError::ConfigError {
                message: format!(
                    "extractor produces {}-wide embeddings, configuration expects {}",
                    extractor.query_size(),
                    query_size
                ),
            });
        }

        let device = config.model.device()?;
        let class_per_task = config.model.class_per_task;

        info!(
            query_size = query_size,
            class_per_task = class_per_task,
            query_mode = %config.model.query_mode,
            default_expert = ?config.model.default_expert,
            "Created expert-of-experts model"
        );

        Ok(Self {
            classifiers: ClassifierBank::new(query_size, &device),
            statistics: StatisticsStore::new(class_per_task, query_size, &device)?,
            router: ExpertRouter::from_config(&config.model),
            regularizer: DescriptionContrastiveLoss::from_config(&config.regularizer),
            descriptions: DescriptionStore::new(config.regularizer.number_description),
            config,
            device,
            extractor,
            num_tasks: None,
            num_labels: 0,
            num_old_labels: 0,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &EoeConfig {
        &self.config
    }

    /// Device holding every tensor of the model.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Index of the newest task.
    pub fn num_tasks(&self) -> Option<usize> {
        self.num_tasks
    }

    /// Total labels over all tasks.
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Offset subtracted from global labels of the current task.
    pub fn num_old_labels(&self) -> usize {
        self.num_old_labels
    }

    /// Classifier heads.
    pub fn classifiers(&self) -> &ClassifierBank {
        &self.classifiers
    }

    /// Statistics of every expert.
    pub fn statistics(&self) -> &StatisticsStore {
        &self.statistics
    }

    /// Label-description pools.
    pub fn descriptions(&self) -> &DescriptionStore {
        &self.descriptions
    }

    /// Feature extractor.
    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Mutable feature extractor, for callers that train adapters.
    pub fn extractor_mut(&mut self) -> &mut E {
        &mut self.extractor
    }

    /// Variables of the current classifier head.
    pub fn trainable_vars(&self) -> Vec<&Var> {
        self.classifiers.trainable_vars()
    }

    /// Start a new task with `num_labels` classes.
    ///
    /// Freezes every existing head, appends a head for the new task, asks the
    /// extractor for a new adapter and registers an empty statistics record.
    ///
    /// # Errors
    /// - `EoeError::InvalidNumLabels` if `num_labels == 0`
    ///
    /// On any error the model is left unchanged.
    pub fn new_task(&mut self, num_labels: usize) -> EoeResult<usize> {
        if num_labels == 0 {
            return Err(EoeError::InvalidNumLabels { num_labels });
        }

        let task = self.num_tasks.map_or(0, |n| n + 1);
        // Allocate everything fallible before the extractor grows an adapter.
        let head = self.classifiers.new_head(num_labels)?;
        let record = self.statistics.prepare_task(task)?;
        self.extractor.add_adapter(task)?;
        self.classifiers.push_head(head);
        self.statistics.commit_task(record);

        self.num_tasks = Some(task);
        self.num_labels += num_labels;
        if task > 0 {
            self.num_old_labels += self.config.model.class_per_task;
        }

        info!(
            task = task,
            num_labels = num_labels,
            total_labels = self.num_labels,
            num_old_labels = self.num_old_labels,
            "Started new task"
        );
        Ok(task)
    }

    /// Add one task's class means and covariance to an expert's statistics.
    pub fn new_statistic(&mut self, mean: &Tensor, cov: &Tensor, expert: ExpertId) -> EoeResult<()> {
        self.statistics.new_statistic(mean, cov, expert)?;
        info!(expert = %expert, "Updated expert statistics");
        Ok(())
    }

    /// Estimate and record statistics from one expert's embeddings of a task.
    ///
    /// `local_labels` are task-local class indices (`< class_per_task`).
    pub fn observe_task(&mut self, expert: ExpertId, embeddings: &Tensor, local_labels: &[usize]) -> EoeResult<()> {
        let estimate = GaussianEstimate::from_embeddings(
            embeddings,
            local_labels,
            self.config.model.class_per_task,
        )?;
        self.new_statistic(&estimate.mean, &estimate.cov, expert)
    }

    /// Embeddings of a batch under one expert.
    ///
    /// # Errors
    /// - `EoeError::UnregisteredExpert` if the expert's task does not exist
    pub fn hidden_states(&self, batch: &Batch, expert: ExpertId) -> EoeResult<Tensor> {
        self.ensure_registered(expert)?;
        self.embed(batch, expert)
    }

    /// Training forward pass on the current task.
    ///
    /// Returns the differentiable loss (cross-entropy on task-local labels plus
    /// the weighted description-contrastive term), its components, the
    /// predictions and the embeddings.
    ///
    /// # Errors
    /// - `EoeError::InvariantViolation` if no task exists
    /// - `EoeError::InvalidInput` if a label does not belong to the current task
    /// - `EoeError::ConfigError` if the batch carries no positive description slot
    pub fn train_step(&self, batch: &Batch) -> EoeResult<ExpertOutput> {
        let task = self.current_task()?;
        let expert = ExpertId::Task(task);

        let hidden = self.embed(batch, expert)?;
        let head = self.classifiers.get(task)?;
        let logits = head.forward(&hidden)?;

        let local: Vec<u32> = batch
            .labels
            .iter()
            .map(|&label| {
                label
                    .checked_sub(self.num_old_labels)
                    .filter(|l| *l < head.num_labels())
                    .map(|l| l as u32)
                    .ok_or_else(|| EoeError::InvalidInput {
                        message: format!(
                            "label {} is outside task {} (offset {}, {} labels)",
                            label,
                            task,
                            self.num_old_labels,
                            head.num_labels()
                        ),
                    })
            })
            .collect::<EoeResult<_>>()?;
        let targets = Tensor::from_vec(local, (batch.len(),), &self.device).map_err(map_candle)?;
        let cross_entropy = candle_nn::loss::cross_entropy(&logits, &targets).map_err(map_candle)?;

        let contrastive = if batch.descriptions.is_empty() {
            warn!(task = task, "No label descriptions in batch; contrastive term is zero");
            Tensor::zeros((), DType::F32, &self.device).map_err(map_candle)?
        } else {
            let positives = self.embed_descriptions(&batch.descriptions, expert)?;
            let negatives = self.embed_descriptions(&batch.old_descriptions, expert)?;
            self.regularizer.compute_masked(&hidden, &positives, &negatives)?
        };
        let loss = self.regularizer.combine(&cross_entropy, &contrastive)?;

        let components = LossComponents {
            cross_entropy: scalar(&cross_entropy)?,
            contrastive: scalar(&contrastive)?,
            total: scalar(&loss)?,
        };
        info!(
            task = task,
            loss_cross_entropy = components.cross_entropy,
            cr_loss = components.contrastive,
            total_loss = components.total,
            "Training step"
        );

        let preds = self
            .local_argmax(&logits)?
            .into_iter()
            .map(|c| c + self.config.model.class_per_task * task)
            .collect();

        Ok(ExpertOutput {
            loss: Some(loss),
            components: Some(components),
            preds,
            hidden_states: Some(hidden),
            indices: vec![task; batch.len()],
            ..Default::default()
        })
    }

    /// Route every example to a task and classify it with that task's head.
    ///
    /// With `oracle = Some(t)` every example is classified by task `t`.
    ///
    /// # Errors
    /// - `EoeError::InvariantViolation` if no task exists
    /// - errors of [`ExpertRouter::route`]
    pub fn predict(&self, batch: &Batch, oracle: Option<usize>) -> EoeResult<ExpertOutput> {
        let task = self.current_task()?;

        let embeddings = ExpertId::all(task + 1)
            .map(|expert| self.embed(batch, expert))
            .collect::<EoeResult<Vec<_>>>()?;

        let logits = (0..=task)
            .map(|t| {
                let head = self.classifiers.get(t)?;
                let out = head.forward(&embeddings[t + 1])?;
                self.local_logits(&out)
            })
            .collect::<EoeResult<Vec<_>>>()?;

        self.classify(&embeddings, &logits, oracle)
    }

    /// Route precomputed per-expert embeddings.
    ///
    /// `embeddings[k]` belongs to the expert at axis position `k` (origin first).
    pub fn predict_from_embeddings(&self, embeddings: &[Tensor], oracle: Option<usize>) -> EoeResult<ExpertOutput> {
        let task = self.current_task()?;
        if embeddings.len() != task + 2 {
            return Err(EoeError::InvalidInput {
                message: format!("expected {} expert embeddings, got {}", task + 2, embeddings.len()),
            });
        }

        let logits = (0..=task)
            .map(|t| {
                let out = self.classifiers.get(t)?.forward(&embeddings[t + 1])?;
                self.local_logits(&out)
            })
            .collect::<EoeResult<Vec<_>>>()?;

        self.classify(embeddings, &logits, oracle)
    }

    /// Build the label-description pool of one label.
    pub fn load_label_descriptions<T>(
        &mut self,
        label: &str,
        index: usize,
        file: &DescriptionFile,
        tokenizer: &T,
    ) -> EoeResult<()>
    where
        T: DescriptionTokenizer + ?Sized,
    {
        self.descriptions.load_label(label, index, file, tokenizer)
    }

    /// Save one classifier head to `dir/classifier-{idx}.safetensors`.
    pub fn save_classifier(&self, idx: usize, dir: &Path) -> EoeResult<()> {
        self.classifiers.save_head(idx, dir).map(|_| ())
    }

    /// Load one classifier head from `dir/classifier-{idx}.safetensors`.
    pub fn load_classifier(&self, idx: usize, dir: &Path) -> EoeResult<()> {
        self.classifiers.load_head(idx, dir)
    }

    /// Load a backbone checkpoint.
    ///
    /// `model.*` tensors go to the extractor with the prefix stripped; the
    /// `linear.*` tensors initialise the first classifier head.
    ///
    /// # Errors
    /// - `EoeError::CheckpointError` if the file cannot be read or lacks the
    ///   linear layer, or no head exists yet
    pub fn load_expert_model(&mut self, path: &Path) -> EoeResult<()> {
        let tensors = safetensors::load(path, &self.device).map_err(|e| EoeError::CheckpointError {
            message: format!("Failed to load backbone checkpoint '{}': {}", path.display(), e),
        })?;

        let backbone: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(BACKBONE_PREFIX).map(|k| (k.to_string(), v.clone())))
            .collect();
        debug!(tensors = backbone.len(), "Handing backbone tensors to extractor");
        self.extractor.load_backbone(&backbone)?;

        if self.classifiers.is_empty() {
            return Err(EoeError::CheckpointError {
                message: "backbone checkpoint loaded before the first task; no head to initialise".to_string(),
            });
        }
        self.classifiers.bootstrap_first(&tensors)?;

        info!(path = %path.display(), "Loaded backbone checkpoint");
        Ok(())
    }

    /// Write heads, statistics and lifecycle counters to `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> EoeResult<()> {
        fs::create_dir_all(dir)?;

        for idx in 0..self.classifiers.len() {
            self.classifiers.save_head(idx, dir)?;
        }

        let stats_path = dir.join(STATISTICS_FILE);
        safetensors::save(&self.statistics.to_named_tensors(), &stats_path).map_err(|e| {
            EoeError::CheckpointError {
                message: format!("Failed to save statistics to '{}': {}", stats_path.display(), e),
            }
        })?;

        let state = ModelState {
            config: self.config.clone(),
            num_tasks: self.num_tasks,
            num_labels: self.num_labels,
            num_old_labels: self.num_old_labels,
            head_sizes: self.classifiers.iter().map(|h| h.num_labels()).collect(),
            statistics: self
                .statistics
                .update_counts()
                .into_iter()
                .map(|(slot, num_means, updates)| StatisticsLayout {
                    slot,
                    num_means,
                    updates,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&state).map_err(|e| EoeError::SerializationError {
            message: format!("Failed to serialize model state: {}", e),
        })?;
        fs::write(dir.join(MODEL_STATE_FILE), json)?;

        info!(
            dir = %dir.display(),
            heads = self.classifiers.len(),
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Rebuild a model from a checkpoint written by [`EoeModel::save_checkpoint`].
    ///
    /// Tasks are replayed through [`EoeModel::new_task`] so the extractor
    /// allocates its adapters; head weights and statistics are then loaded.
    pub fn restore(dir: &Path, extractor: E) -> EoeResult<Self> {
        let state = ModelState::read(dir)?;
        let mut model = Self::new(state.config.clone(), extractor)?;

        for size in &state.head_sizes {
            model.new_task(*size)?;
        }
        if model.num_tasks != state.num_tasks
            || model.num_labels != state.num_labels
            || model.num_old_labels != state.num_old_labels
        {
            return Err(EoeError::CheckpointError {
                message: format!(
                    "replayed counters (tasks {:?}, labels {}, old labels {}) differ from checkpoint (tasks {:?}, labels {}, old labels {})",
                    model.num_tasks,
                    model.num_labels,
                    model.num_old_labels,
                    state.num_tasks,
                    state.num_labels,
                    state.num_old_labels
                ),
            });
        }

        for idx in 0..state.head_sizes.len() {
            model.classifiers.load_head(idx, dir)?;
        }

        let stats_path = dir.join(STATISTICS_FILE);
        let tensors = safetensors::load(&stats_path, &model.device).map_err(|e| EoeError::CheckpointError {
            message: format!("Failed to load statistics from '{}': {}", stats_path.display(), e),
        })?;
        let layout: Vec<(usize, usize, usize)> = state
            .statistics
            .iter()
            .map(|l| (l.slot, l.num_means, l.updates))
            .collect();
        model.statistics = StatisticsStore::from_named_tensors(
            &tensors,
            &layout,
            model.config.model.class_per_task,
            model.config.model.query_size(),
            &model.device,
        )?;

        info!(dir = %dir.display(), tasks = state.head_sizes.len(), "Restored checkpoint");
        Ok(model)
    }

    /// Route and pick each example's class from its task's head.
    ///
    /// Under `maha_ft` every expert, the origin included, scores task `t`
    /// with the embedding of the `Task(t)` adapter, so each task's means are
    /// compared against the query from the adapter trained on that task.
    fn classify(&self, embeddings: &[Tensor], logits: &[Vec<Vec<f32>>], oracle: Option<usize>) -> EoeResult<ExpertOutput> {
        let queries: Vec<Query> = if self.config.model.query_mode.needs_per_task_query() {
            let per_task = Query::PerTask(embeddings[1..].to_vec());
            vec![per_task; embeddings.len()]
        } else {
            embeddings.iter().cloned().map(Query::Shared).collect()
        };

        let decision = self.router.route(&self.statistics, &queries, oracle)?;
        let class_per_task = self.config.model.class_per_task;

        let preds = decision
            .indices
            .iter()
            .enumerate()
            .map(|(b, &t)| {
                let row = logits
                    .get(t)
                    .and_then(|rows| rows.get(b))
                    .ok_or_else(|| EoeError::InvalidInput {
                        message: format!("no classifier logits for task {} (example {})", t, b),
                    })?;
                Ok(argmax(row) + class_per_task * t)
            })
            .collect::<EoeResult<Vec<_>>>()?;

        Ok(ExpertOutput {
            preds,
            task_scores: Some(decision.task_scores),
            class_indices: Some(decision.class_indices),
            indices: decision.indices,
            ..Default::default()
        })
    }

    fn current_task(&self) -> EoeResult<usize> {
        self.num_tasks.ok_or_else(|| EoeError::InvariantViolation {
            message: "no task has been created; call new_task first".to_string(),
        })
    }

    fn ensure_registered(&self, expert: ExpertId) -> EoeResult<()> {
        self.statistics.get(expert).map(|_| ())
    }

    fn extract_mode(&self) -> ExtractMode {
        match self.config.model.task_name {
            TaskKind::RelationExtraction => ExtractMode::Entity,
            TaskKind::TextClassification => ExtractMode::Cls,
        }
    }

    fn embed(&self, batch: &Batch, expert: ExpertId) -> EoeResult<Tensor> {
        let (inputs, positions) = match expert {
            ExpertId::Origin => (&batch.inputs_without_marker, &batch.entity_positions),
            ExpertId::Task(_) => (&batch.inputs, &batch.marker_positions),
        };
        let mode = self.extract_mode();
        let request = ExtractRequest {
            input_ids: &inputs.ids,
            attention_mask: &inputs.mask,
            expert,
            mode,
            entity_positions: (mode == ExtractMode::Entity).then_some(positions),
        };
        self.checked_extract(&request, batch.len())
    }

    fn embed_descriptions(&self, slots: &[DescriptionSlot], expert: ExpertId) -> EoeResult<Vec<MaskedSlot>> {
        slots
            .iter()
            .map(|slot| {
                let request = ExtractRequest {
                    input_ids: &slot.tokens.ids,
                    attention_mask: &slot.tokens.mask,
                    expert,
                    mode: ExtractMode::Cls,
                    entity_positions: None,
                };
                let rows = slot.tokens.ids.dim(0).map_err(map_candle)?;
                Ok(MaskedSlot {
                    embeddings: self.checked_extract(&request, rows)?,
                    present: slot.present.clone(),
                })
            })
            .collect()
    }

    fn checked_extract(&self, request: &ExtractRequest<'_>, rows: usize) -> EoeResult<Tensor> {
        let out = self.extractor.extract(request)?;
        let expected = [rows, self.config.model.query_size()];
        if out.dims() != expected {
            return Err(EoeError::dims(
                format!("{} embeddings", request.expert),
                &expected,
                out.dims(),
            ));
        }
        out.to_dtype(DType::F32).map_err(map_candle)
    }

    /// First `class_per_task` columns of head logits, on the host.
    fn local_logits(&self, logits: &Tensor) -> EoeResult<Vec<Vec<f32>>> {
        let cols = logits.dim(1).map_err(map_candle)?;
        let keep = cols.min(self.config.model.class_per_task);
        logits
            .narrow(1, 0, keep)
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(map_candle)
    }

    fn local_argmax(&self, logits: &Tensor) -> EoeResult<Vec<usize>> {
        Ok(self.local_logits(logits)?.iter().map(|row| argmax(row)).collect())
    }
}

/// Index of the first maximum.
fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best, best_v)
            }
        })
        .0
}

fn scalar(t: &Tensor) -> EoeResult<f32> {
    t.to_dtype(DType::F32)
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Model error: {}", e),
    }
}
