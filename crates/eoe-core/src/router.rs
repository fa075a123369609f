//! Distance-based expert routing.
//!
//! Every expert scores a query against the class means it has recorded for
//! each task. A task's score is the minimum over its classes. The per-expert
//! task rankings are then combined into one task choice per example:
//!
//! 1. `bert` is the origin expert's best task, `task` is `Task(0)`'s best task.
//! 2. When they agree, or the smaller of the two is task 0, the configured
//!    default guess wins.
//! 3. Otherwise experts `0..=min + 1` (capped by `max_expert`) each vote for
//!    their best task not older than `min`. The majority replaces the default
//!    only if it has strictly more votes than the default answer.

use std::cmp::Ordering;

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::config::{DefaultExpert, ModelConfig, QueryMode};
use crate::error::{EoeError, EoeResult};
use crate::expert::ExpertId;
use crate::statistics::{ExpertStatistics, StatisticsStore};

/// Query embedding handed to one expert.
#[derive(Debug, Clone)]
pub enum Query {
    /// One `batch × query_size` embedding scored against every task.
    Shared(Tensor),
    /// One `batch × query_size` embedding per stored task (`maha_ft`).
    PerTask(Vec<Tensor>),
}

impl Query {
    fn for_task(&self, task: usize, mode: &QueryMode) -> EoeResult<&Tensor> {
        match (self, mode.needs_per_task_query()) {
            (Self::Shared(t), false) => Ok(t),
            (Self::PerTask(ts), true) => ts.get(task).ok_or_else(|| EoeError::InvalidInput {
                message: format!("per-task query has {} embeddings, task {} requested", ts.len(), task),
            }),
            (Self::Shared(_), true) => Err(EoeError::InvalidInput {
                message: format!("query mode '{}' needs one query per task", mode),
            }),
            (Self::PerTask(_), false) => Err(EoeError::InvalidInput {
                message: format!("query mode '{}' takes a single shared query", mode),
            }),
        }
    }

    fn batch_size(&self) -> EoeResult<usize> {
        let first = match self {
            Self::Shared(t) => Some(t),
            Self::PerTask(ts) => ts.first(),
        };
        match first {
            Some(t) => t.dim(0).map_err(map_candle),
            None => Ok(0),
        }
    }
}

/// Scores of one expert over every stored task.
#[derive(Debug, Clone)]
pub struct ExpertScore {
    /// `batch × num_tasks`; masked tasks are `+∞`.
    pub task_scores: Tensor,
    /// Best class per example and task, as a global row index (`task × rows + class`).
    pub class_indices: Vec<Vec<usize>>,
}

/// Result of routing one batch.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Chosen task per example.
    pub indices: Vec<usize>,
    /// `batch × num_experts × num_tasks`, origin first on the expert axis.
    pub task_scores: Tensor,
    /// Best class per example, expert and task (`[batch][expert][task]`).
    pub class_indices: Vec<Vec<Vec<usize>>>,
}

/// Expert router configured with a metric and a selection policy.
#[derive(Debug, Clone)]
pub struct ExpertRouter {
    query_mode: QueryMode,
    default_expert: DefaultExpert,
    max_expert: Option<usize>,
}

impl ExpertRouter {
    /// Create a router.
    pub fn new(query_mode: QueryMode, default_expert: DefaultExpert, max_expert: Option<usize>) -> Self {
        Self {
            query_mode,
            default_expert,
            max_expert,
        }
    }

    /// Create a router from model configuration.
    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.query_mode.clone(), config.default_expert, config.max_expert)
    }

    /// Configured metric.
    pub fn query_mode(&self) -> &QueryMode {
        &self.query_mode
    }

    /// Score a query against one expert's statistics.
    ///
    /// # Errors
    /// - `EoeError::Unimplemented` for an unsupported metric
    /// - `EoeError::InvalidInput` if the record holds no class means or the
    ///   query form does not match the metric
    /// - `EoeError::DimensionMismatch` on width mismatch
    pub fn score_expert(
        &self,
        record: &ExpertStatistics,
        expert: ExpertId,
        query: &Query,
    ) -> EoeResult<ExpertScore> {
        self.ensure_supported()?;

        let means = record.class_mean();
        if means.is_empty() {
            return Err(EoeError::InvalidInput {
                message: format!("{} has no recorded class means", expert),
            });
        }

        let mut per_task = Vec::with_capacity(means.len());
        let mut argmins = Vec::with_capacity(means.len());
        for (idx, mean) in means.iter().enumerate() {
            let x = query.for_task(idx, &self.query_mode)?;
            let rows = mean.dim(0).map_err(map_candle)?;

            let scores = class_scores(&self.query_mode, x, mean, record.cov_inv())?;
            per_task.push(scores.min(1).map_err(map_candle)?);

            let best: Vec<u32> = scores
                .argmin(1)
                .and_then(|t| t.to_vec1::<u32>())
                .map_err(map_candle)?;
            argmins.push(
                best.into_iter()
                    .map(|c| c as usize + idx * rows)
                    .collect::<Vec<_>>(),
            );
        }

        let mut task_scores = Tensor::stack(&per_task, 1).map_err(map_candle)?;
        let num_tasks = per_task.len();
        if let ExpertId::Task(e) = expert {
            if e > 0 {
                let mask: Vec<f32> = (0..num_tasks)
                    .map(|t| if t < e { f32::INFINITY } else { 0.0 })
                    .collect();
                let mask = Tensor::from_vec(mask, (1, num_tasks), task_scores.device())
                    .map_err(map_candle)?;
                task_scores = task_scores.broadcast_add(&mask).map_err(map_candle)?;
            }
        }

        let batch = task_scores.dim(0).map_err(map_candle)?;
        let class_indices = (0..batch)
            .map(|b| argmins.iter().map(|task| task[b]).collect())
            .collect();

        Ok(ExpertScore {
            task_scores,
            class_indices,
        })
    }

    /// Route a batch.
    ///
    /// `queries[k]` is the query of the expert at axis position `k`: position 0
    /// is the origin, position `n + 1` is `Task(n)`. `oracle` forces the
    /// selected task for every example.
    ///
    /// # Errors
    /// - `EoeError::Unimplemented` for an unsupported metric
    /// - `EoeError::InvalidInput` if fewer than two experts are given, the
    ///   query count differs from the store's expert count, or the oracle
    ///   task is out of range
    pub fn route(
        &self,
        store: &StatisticsStore,
        queries: &[Query],
        oracle: Option<usize>,
    ) -> EoeResult<RoutingDecision> {
        self.ensure_supported()?;

        if queries.len() < 2 {
            return Err(EoeError::InvalidInput {
                message: format!("routing needs the origin and at least one task expert, got {} queries", queries.len()),
            });
        }
        if queries.len() != store.num_experts() {
            return Err(EoeError::InvalidInput {
                message: format!(
                    "{} queries for {} registered experts",
                    queries.len(),
                    store.num_experts()
                ),
            });
        }

        let mut scores = Vec::with_capacity(queries.len());
        for (position, query) in queries.iter().enumerate() {
            let expert = ExpertId::from_slot(position);
            let record = store.get(expert)?;
            scores.push(self.score_expert(record, expert, query)?);
        }

        let expected = scores[0].task_scores.dims().to_vec();
        if let Some(bad) = scores.iter().find(|s| s.task_scores.dims() != expected.as_slice()) {
            return Err(EoeError::dims("expert task scores", &expected, bad.task_scores.dims()));
        }

        let stacked: Vec<Tensor> = scores.iter().map(|s| s.task_scores.clone()).collect();
        let task_scores = Tensor::stack(&stacked, 1).map_err(map_candle)?;
        let host = task_scores
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec3::<f32>())
            .map_err(map_candle)?;

        let batch = queries[0].batch_size()?;
        let num_tasks = expected.get(1).copied().unwrap_or(0);

        let indices = match oracle {
            Some(task) => {
                if task >= num_tasks {
                    return Err(EoeError::InvalidInput {
                        message: format!("oracle task {} out of range for {} tasks", task, num_tasks),
                    });
                }
                vec![task; batch]
            }
            None => host
                .iter()
                .map(|per_expert| {
                    let ranked: Vec<Vec<usize>> =
                        per_expert.iter().map(|row| rank_ascending(row)).collect();
                    select_task(&ranked, self.default_expert, self.max_expert)
                })
                .collect::<EoeResult<Vec<_>>>()?,
        };

        let class_indices = (0..batch)
            .map(|b| scores.iter().map(|s| s.class_indices[b].clone()).collect())
            .collect();

        debug!(
            batch = batch,
            experts = queries.len(),
            tasks = num_tasks,
            oracle = ?oracle,
            indices = ?indices,
            "Routed batch"
        );

        Ok(RoutingDecision {
            indices,
            task_scores,
            class_indices,
        })
    }

    fn ensure_supported(&self) -> EoeResult<()> {
        if let QueryMode::Unsupported(name) = &self.query_mode {
            return Err(EoeError::Unimplemented {
                message: format!("query mode '{}'", name),
            });
        }
        Ok(())
    }
}

/// Task ids ordered by ascending score; ties keep the lower id first and NaN sorts last.
pub fn rank_ascending(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| match (scores[a].is_nan(), scores[b].is_nan()) {
        (false, false) => scores[a].partial_cmp(&scores[b]).unwrap_or(Ordering::Equal),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
    });
    order
}

/// Pick the task for one example from per-expert task rankings.
///
/// `ranked[k]` is the ascending task ranking of the expert at axis position
/// `k` (origin first).
///
/// # Errors
/// - `EoeError::InvalidInput` if fewer than two non-empty rankings are given
pub fn select_task(
    ranked: &[Vec<usize>],
    default_expert: DefaultExpert,
    max_expert: Option<usize>,
) -> EoeResult<usize> {
    let best = |k: usize| ranked.get(k).and_then(|r| r.first().copied());
    let (bert, task) = match (best(0), best(1)) {
        (Some(b), Some(t)) => (b, t),
        _ => {
            return Err(EoeError::InvalidInput {
                message: "task selection needs rankings from the origin and the first task expert".to_string(),
            })
        }
    };

    let default = match default_expert {
        DefaultExpert::Bert => bert,
        DefaultExpert::Task => task,
    };

    let min_task = bert.min(task);
    let voters = min_task + 1;
    if bert == task || voters <= 1 {
        return Ok(default);
    }

    let votes: Vec<usize> = (0..=voters)
        .filter(|j| max_expert.map_or(true, |m| *j <= m))
        .filter_map(|j| ranked.get(j))
        .filter_map(|r| r.iter().copied().find(|k| *k >= min_task))
        .collect();

    // Counts in first-vote order so equal counts resolve to the earliest voter.
    let mut tally: Vec<(usize, usize)> = Vec::new();
    for v in &votes {
        match tally.iter_mut().find(|(value, _)| value == v) {
            Some((_, count)) => *count += 1,
            None => tally.push((*v, 1)),
        }
    }
    let Some((top, top_count)) = tally.iter().fold(None, |acc: Option<(usize, usize)>, &(v, c)| match acc {
        Some((_, best)) if best >= c => acc,
        _ => Some((v, c)),
    }) else {
        return Ok(default);
    };

    let default_count = votes.iter().filter(|v| **v == default).count();
    if top_count == default_count {
        Ok(default)
    } else {
        Ok(top)
    }
}

/// Per-class scores, `batch × rows`. Lower is closer.
fn class_scores(mode: &QueryMode, x: &Tensor, means: &Tensor, cov_inv: &Tensor) -> EoeResult<Tensor> {
    let (_, width) = x.dims2().map_err(map_candle)?;
    let (_, mean_width) = means.dims2().map_err(map_candle)?;
    if width != mean_width {
        return Err(EoeError::dims("routing query", &[mean_width], &[width]));
    }

    let x = x.to_dtype(DType::F32).map_err(map_candle)?;
    let means = means.to_dtype(DType::F32).map_err(map_candle)?;

    match mode {
        QueryMode::Cosine => negative_cosine(&x, &means),
        QueryMode::Euclidean => {
            let diff = pairwise_diff(&x, &means)?;
            diff.sqr()
                .and_then(|t| t.sum(2))
                .and_then(|t| t.sqrt())
                .map_err(map_candle)
        }
        QueryMode::Mahalanobis | QueryMode::MahaFt => {
            let cov_inv = cov_inv.to_dtype(DType::F32).map_err(map_candle)?;
            squared_mahalanobis(&x, &means, &cov_inv)
        }
        QueryMode::Unsupported(name) => Err(EoeError::Unimplemented {
            message: format!("query mode '{}'", name),
        }),
    }
}

/// `x[b] - means[c]` for every pair, `batch × rows × width`.
fn pairwise_diff(x: &Tensor, means: &Tensor) -> EoeResult<Tensor> {
    let lhs = x.unsqueeze(1).map_err(map_candle)?;
    let rhs = means.unsqueeze(0).map_err(map_candle)?;
    lhs.broadcast_sub(&rhs).map_err(map_candle)
}

fn negative_cosine(x: &Tensor, means: &Tensor) -> EoeResult<Tensor> {
    let dot = x
        .matmul(&means.t().map_err(map_candle)?)
        .map_err(map_candle)?;

    let norm_x = x
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.sqrt())
        .map_err(map_candle)?;
    let norm_m = means
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.sqrt())
        .and_then(|t| t.t())
        .map_err(map_candle)?;

    let denom = norm_x.broadcast_mul(&norm_m).map_err(map_candle)?;
    let eps = Tensor::ones_like(&denom)
        .and_then(|t| t.affine(1e-8, 0.0))
        .map_err(map_candle)?;
    let safe_denom = denom.add(&eps).map_err(map_candle)?;

    dot.div(&safe_denom)
        .and_then(|t| t.neg())
        .map_err(map_candle)
}

/// `Σ((x - μ) Σ⁻¹ ⊙ (x - μ))` per example and class.
fn squared_mahalanobis(x: &Tensor, means: &Tensor, cov_inv: &Tensor) -> EoeResult<Tensor> {
    let diff = pairwise_diff(x, means)?;
    let (batch, rows, width) = diff.dims3().map_err(map_candle)?;
    if cov_inv.dims() != [width, width] {
        return Err(EoeError::dims("cov_inv", &[width, width], cov_inv.dims()));
    }

    let flat = diff.reshape((batch * rows, width)).map_err(map_candle)?;
    flat.matmul(cov_inv)
        .and_then(|t| t.mul(&flat))
        .and_then(|t| t.sum(1))
        .and_then(|t| t.reshape((batch, rows)))
        .map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Routing error: {}", e),
    }
}
