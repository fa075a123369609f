//! Per-expert class-conditional Gaussian statistics.
//!
//! Every expert owns one [`ExpertStatistics`] record holding the class means
//! observed for each task, a running sum of per-task covariance estimates and
//! the pseudo-inverse of their average. Records are keyed by [`ExpertId`]; the
//! origin record exists from construction, task records are registered by the
//! lifecycle controller as tasks arrive.
//!
//! # Observation count
//!
//! The averaged covariance divides `accumulate_cov` by the number of task-level
//! contributions the expert has seen:
//!
//! | Expert | Count |
//! |--------|-------|
//! | `Origin`, `Task(0)` | `num_tasks + 1` |
//! | `Task(e)` | `num_tasks - slot + 2` |
//!
//! where `num_tasks` is the index of the newest registered task and `slot` is
//! [`ExpertId::slot`]. A zero count is an invariant violation.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use crate::error::{EoeError, EoeResult};
use crate::expert::ExpertId;
use crate::linalg::pinv_hermitian;

/// Gaussian statistics tracked for one expert.
#[derive(Debug, Clone)]
pub struct ExpertStatistics {
    class_mean: Vec<Tensor>,
    accumulate_cov: Tensor,
    cov_inv: Tensor,
    updates: usize,
}

impl ExpertStatistics {
    fn empty(placeholders: usize, rows: usize, query_size: usize, device: &Device) -> EoeResult<Self> {
        let class_mean = (0..placeholders)
            .map(|_| Tensor::zeros((rows, query_size), DType::F32, device))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_candle)?;

        Ok(Self {
            class_mean,
            accumulate_cov: Tensor::zeros((query_size, query_size), DType::F32, device)
                .map_err(map_candle)?,
            cov_inv: Tensor::ones((query_size, query_size), DType::F32, device)
                .map_err(map_candle)?,
            updates: 0,
        })
    }

    /// Per-task class mean matrices, oldest task first.
    pub fn class_mean(&self) -> &[Tensor] {
        &self.class_mean
    }

    /// Running sum of covariance estimates.
    pub fn accumulate_cov(&self) -> &Tensor {
        &self.accumulate_cov
    }

    /// Pseudo-inverse of the averaged covariance.
    pub fn cov_inv(&self) -> &Tensor {
        &self.cov_inv
    }

    /// Number of `new_statistic` calls applied to this record.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Number of tasks with a mean matrix (placeholders included).
    pub fn num_tasks(&self) -> usize {
        self.class_mean.len()
    }
}

/// Allocated record of the next task, not yet part of the store.
#[derive(Debug)]
pub struct PendingRecord {
    task: usize,
    record: ExpertStatistics,
}

impl PendingRecord {
    /// Task the record belongs to.
    pub fn task(&self) -> usize {
        self.task
    }
}

/// Statistics for every expert of a model.
#[derive(Debug, Clone)]
pub struct StatisticsStore {
    records: BTreeMap<ExpertId, ExpertStatistics>,
    num_tasks: Option<usize>,
    class_per_task: usize,
    query_size: usize,
    device: Device,
}

impl StatisticsStore {
    /// Create a store holding only the origin record.
    pub fn new(class_per_task: usize, query_size: usize, device: &Device) -> EoeResult<Self> {
        if query_size == 0 {
            return Err(EoeError::InvalidInput {
                message: "query_size must be > 0".to_string(),
            });
        }

        let mut records = BTreeMap::new();
        records.insert(
            ExpertId::Origin,
            ExpertStatistics::empty(0, class_per_task, query_size, device)?,
        );

        Ok(Self {
            records,
            num_tasks: None,
            class_per_task,
            query_size,
            device: device.clone(),
        })
    }

    /// Register the record for the next task.
    ///
    /// The record starts with one zero placeholder mean per earlier task.
    ///
    /// # Errors
    /// - `EoeError::InvariantViolation` if `task` is not the next task index
    pub fn register_task(&mut self, task: usize) -> EoeResult<()> {
        let pending = self.prepare_task(task)?;
        self.commit_task(pending);
        Ok(())
    }

    /// Validate and allocate the record of the next task without inserting it.
    pub fn prepare_task(&self, task: usize) -> EoeResult<PendingRecord> {
        let expected = self.num_tasks.map_or(0, |n| n + 1);
        if task != expected {
            return Err(EoeError::InvariantViolation {
                message: format!(
                    "tasks must be registered in order: expected task {}, got {}",
                    expected, task
                ),
            });
        }

        let record = ExpertStatistics::empty(task, self.class_per_task, self.query_size, &self.device)?;
        Ok(PendingRecord { task, record })
    }

    /// Insert a record produced by [`StatisticsStore::prepare_task`].
    pub fn commit_task(&mut self, pending: PendingRecord) {
        let PendingRecord { task, record } = pending;
        self.records.insert(ExpertId::Task(task), record);
        self.num_tasks = Some(task);
        debug!(task = task, "Registered statistics record");
    }

    /// Index of the newest registered task.
    pub fn num_tasks(&self) -> Option<usize> {
        self.num_tasks
    }

    /// Number of expert records (origin included).
    pub fn num_experts(&self) -> usize {
        self.records.len()
    }

    /// Embedding width.
    pub fn query_size(&self) -> usize {
        self.query_size
    }

    /// Device holding the statistics.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Record for an expert.
    ///
    /// # Errors
    /// - `EoeError::UnregisteredExpert` if the expert's task was never registered
    pub fn get(&self, expert: ExpertId) -> EoeResult<&ExpertStatistics> {
        self.records
            .get(&expert)
            .ok_or_else(|| self.unregistered(expert))
    }

    /// Iterate over records, origin first.
    pub fn iter(&self) -> impl Iterator<Item = (ExpertId, &ExpertStatistics)> {
        self.records.iter().map(|(id, rec)| (*id, rec))
    }

    /// Averaging count for the expert's accumulated covariance.
    ///
    /// # Errors
    /// - `EoeError::UnregisteredExpert` if the expert is not registered
    /// - `EoeError::InvariantViolation` if the count would be zero or negative
    pub fn observation_count(&self, expert: ExpertId) -> EoeResult<usize> {
        if !self.records.contains_key(&expert) {
            return Err(self.unregistered(expert));
        }

        let num_tasks = self.num_tasks.map_or(-1i64, |n| n as i64);
        let slot = expert.slot() as i64;
        let count = if slot <= 1 {
            num_tasks + 1
        } else {
            num_tasks - slot + 2
        };

        if count <= 0 {
            return Err(EoeError::InvariantViolation {
                message: format!(
                    "observation count for {} is {} (num_tasks = {}); new_statistic called before new_task",
                    expert, count, num_tasks
                ),
            });
        }

        Ok(count as usize)
    }

    /// Add one task's statistics to an expert.
    ///
    /// Appends `mean` (`rows × query_size`), adds `cov` (`query_size × query_size`)
    /// into the accumulated covariance and recomputes the pseudo-inverse of the
    /// averaged covariance. Either everything is applied or nothing is.
    ///
    /// # Errors
    /// - `EoeError::UnregisteredExpert` if the expert's task was never registered
    /// - `EoeError::DimensionMismatch` on shape errors
    /// - `EoeError::InvariantViolation` if the observation count is zero
    pub fn new_statistic(&mut self, mean: &Tensor, cov: &Tensor, expert: ExpertId) -> EoeResult<()> {
        let count = self.observation_count(expert)?;
        let record = self.get(expert)?;

        let (rows, width) = mean.dims2().map_err(map_candle)?;
        if rows == 0 || width != self.query_size {
            return Err(EoeError::dims(
                "new_statistic mean",
                &[self.class_per_task, self.query_size],
                &[rows, width],
            ));
        }
        let cov_dims = cov.dims();
        if cov_dims != [self.query_size, self.query_size] {
            return Err(EoeError::dims(
                "new_statistic cov",
                &[self.query_size, self.query_size],
                cov_dims,
            ));
        }

        if record.updates + 1 != count {
            warn!(
                expert = %expert,
                updates = record.updates + 1,
                observation_count = count,
                "Statistics update count differs from observation count; averaged covariance is biased"
            );
        }

        let mean = mean
            .to_dtype(DType::F32)
            .and_then(|m| m.to_device(&self.device))
            .map_err(map_candle)?;
        let cov = cov
            .to_dtype(DType::F32)
            .and_then(|c| c.to_device(&self.device))
            .map_err(map_candle)?;

        let accumulate_cov = record.accumulate_cov.add(&cov).map_err(map_candle)?;
        let avg_cov = accumulate_cov
            .affine(1.0 / count as f64, 0.0)
            .map_err(map_candle)?;
        let cov_inv = pinv_hermitian(&avg_cov)?;

        let record = self
            .records
            .get_mut(&expert)
            .ok_or_else(|| EoeError::InvariantViolation {
                message: format!("record for {} vanished during update", expert),
            })?;
        record.class_mean.push(mean);
        record.accumulate_cov = accumulate_cov;
        record.cov_inv = cov_inv;
        record.updates += 1;

        debug!(
            expert = %expert,
            tasks = record.class_mean.len(),
            observation_count = count,
            "Applied statistics update"
        );
        Ok(())
    }

    /// Flatten the store into named tensors for checkpointing.
    ///
    /// Keys: `expert.{slot}.class_mean.{i}`, `expert.{slot}.accumulate_cov`,
    /// `expert.{slot}.cov_inv`.
    pub fn to_named_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::new();
        for (id, rec) in &self.records {
            let slot = id.slot();
            for (i, mean) in rec.class_mean.iter().enumerate() {
                out.insert(format!("expert.{}.class_mean.{}", slot, i), mean.clone());
            }
            out.insert(format!("expert.{}.accumulate_cov", slot), rec.accumulate_cov.clone());
            out.insert(format!("expert.{}.cov_inv", slot), rec.cov_inv.clone());
        }
        out
    }

    /// Number of statistics updates per expert slot, for checkpoint metadata.
    pub fn update_counts(&self) -> Vec<(usize, usize, usize)> {
        self.records
            .iter()
            .map(|(id, rec)| (id.slot(), rec.class_mean.len(), rec.updates))
            .collect()
    }

    /// Rebuild a store from checkpointed tensors.
    ///
    /// `layout` lists `(slot, num_means, updates)` per expert, as produced by
    /// [`StatisticsStore::update_counts`].
    ///
    /// # Errors
    /// - `EoeError::CheckpointError` if a tensor is missing or has the wrong shape
    pub fn from_named_tensors(
        tensors: &HashMap<String, Tensor>,
        layout: &[(usize, usize, usize)],
        class_per_task: usize,
        query_size: usize,
        device: &Device,
    ) -> EoeResult<Self> {
        let fetch = |key: String| -> EoeResult<Tensor> {
            tensors
                .get(&key)
                .ok_or_else(|| EoeError::CheckpointError {
                    message: format!("statistics tensor '{}' not found", key),
                })?
                .to_device(device)
                .map_err(map_candle)
        };

        let mut records = BTreeMap::new();
        let mut num_tasks = None;
        for &(slot, num_means, updates) in layout {
            let class_mean = (0..num_means)
                .map(|i| fetch(format!("expert.{}.class_mean.{}", slot, i)))
                .collect::<EoeResult<Vec<_>>>()?;
            let accumulate_cov = fetch(format!("expert.{}.accumulate_cov", slot))?;
            let cov_inv = fetch(format!("expert.{}.cov_inv", slot))?;

            for (name, t) in [("accumulate_cov", &accumulate_cov), ("cov_inv", &cov_inv)] {
                if t.dims() != [query_size, query_size] {
                    return Err(EoeError::CheckpointError {
                        message: format!(
                            "expert.{}.{} has shape {:?}, expected [{}, {}]",
                            slot,
                            name,
                            t.dims(),
                            query_size,
                            query_size
                        ),
                    });
                }
            }

            let id = ExpertId::from_slot(slot);
            if let ExpertId::Task(t) = id {
                num_tasks = Some(num_tasks.map_or(t, |n: usize| n.max(t)));
            }
            records.insert(
                id,
                ExpertStatistics {
                    class_mean,
                    accumulate_cov,
                    cov_inv,
                    updates,
                },
            );
        }

        if !records.contains_key(&ExpertId::Origin) {
            return Err(EoeError::CheckpointError {
                message: "statistics checkpoint has no origin record".to_string(),
            });
        }
        if let Some(n) = num_tasks {
            if (0..=n).any(|t| !records.contains_key(&ExpertId::Task(t))) {
                return Err(EoeError::CheckpointError {
                    message: format!("statistics checkpoint is missing a record for tasks 0..={}", n),
                });
            }
        }

        Ok(Self {
            records,
            num_tasks,
            class_per_task,
            query_size,
            device: device.clone(),
        })
    }

    fn unregistered(&self, expert: ExpertId) -> EoeError {
        EoeError::UnregisteredExpert {
            expert,
            registered: self.num_tasks.map_or(0, |n| n + 1),
        }
    }
}

/// Class means and pooled covariance estimated from one task's embeddings.
#[derive(Debug, Clone)]
pub struct GaussianEstimate {
    /// Class means, `num_classes × query_size`.
    pub mean: Tensor,
    /// Pooled within-class covariance, `query_size × query_size`.
    pub cov: Tensor,
}

impl GaussianEstimate {
    /// Estimate per-class means and the shared covariance.
    ///
    /// Each embedding is centred on its class mean; the covariance of the
    /// centred embeddings uses a correction of one (`N - 1` denominator).
    /// Classes without samples keep a zero mean.
    ///
    /// # Arguments
    /// * `embeddings` - `N × query_size`
    /// * `labels` - task-local class index per row, each `< num_classes`
    /// * `num_classes` - rows of the resulting mean matrix
    pub fn from_embeddings(embeddings: &Tensor, labels: &[usize], num_classes: usize) -> EoeResult<Self> {
        let (n, _) = embeddings.dims2().map_err(map_candle)?;
        if n == 0 {
            return Err(EoeError::InvalidInput {
                message: "cannot estimate statistics from zero embeddings".to_string(),
            });
        }
        if labels.len() != n {
            return Err(EoeError::dims("gaussian labels", &[n], &[labels.len()]));
        }
        if let Some(bad) = labels.iter().find(|l| **l >= num_classes) {
            return Err(EoeError::InvalidInput {
                message: format!("label {} out of range for {} classes", bad, num_classes),
            });
        }

        let device = embeddings.device();
        let x = embeddings.to_dtype(DType::F32).map_err(map_candle)?;

        let mut one_hot = vec![0.0f32; n * num_classes];
        let mut counts = vec![0.0f32; num_classes];
        for (row, &label) in labels.iter().enumerate() {
            one_hot[row * num_classes + label] = 1.0;
            counts[label] += 1.0;
        }
        let inv_counts: Vec<f32> = counts
            .iter()
            .map(|&c| if c > 0.0 { 1.0 / c } else { 0.0 })
            .collect();
        let one_hot = Tensor::from_vec(one_hot, (n, num_classes), device).map_err(map_candle)?;
        let inv_counts = Tensor::from_vec(inv_counts, (num_classes, 1), device).map_err(map_candle)?;

        // means = diag(1 / counts) · onehotᵀ · X
        let mean = one_hot
            .t()
            .and_then(|t| t.contiguous())
            .and_then(|t| t.matmul(&x))
            .and_then(|t| t.broadcast_mul(&inv_counts))
            .map_err(map_candle)?;

        let centred = one_hot
            .matmul(&mean)
            .and_then(|own_mean| x.sub(&own_mean))
            .map_err(map_candle)?;
        let denom = n.saturating_sub(1).max(1) as f64;
        let cov = centred
            .t()
            .and_then(|t| t.contiguous())
            .and_then(|t| t.matmul(&centred))
            .and_then(|t| t.affine(1.0 / denom, 0.0))
            .map_err(map_candle)?;

        Ok(Self { mean, cov })
    }
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Statistics error: {}", e),
    }
}
