//! End-to-end routing through the model.
//!
//! Statistics and head weights are set explicitly so the expected task and
//! class of every query can be worked out by hand.

mod common;

use common::{batch, config, identity, matrix, vector, FixedExtractor};
use eoe_core::{DefaultExpert, EoeModel, ExpertId};

/// Two tasks with two classes each.
///
/// Task 0 means: (0, 0), (1, 0). Task 1 means: (10, 10), (11, 10).
/// Token 1 embeds to (10, 10), token 2 to (0.9, 0), token 3 to (11, 10).
fn two_task_model(mode: &str, default_expert: DefaultExpert) -> EoeModel<FixedExtractor> {
    let mut cfg = config(2, 2, mode);
    cfg.model.default_expert = default_expert;
    let extractor = FixedExtractor::new(
        2,
        &[(1, &[10.0, 10.0]), (2, &[0.9, 0.0]), (3, &[11.0, 10.0])],
    );
    let mut model = EoeModel::new(cfg, extractor).unwrap();

    let task0 = matrix(&[0.0, 0.0, 1.0, 0.0], 2, 2);
    let task1 = matrix(&[10.0, 10.0, 11.0, 10.0], 2, 2);

    model.new_task(2).unwrap();
    for expert in ExpertId::all(1) {
        model.new_statistic(&task0, &identity(2), expert).unwrap();
    }
    model.new_task(2).unwrap();
    for expert in ExpertId::all(2) {
        model.new_statistic(&task1, &identity(2), expert).unwrap();
    }

    // Head 0: class 1 for positive x. Head 1: class 1 when x exceeds y by more than 0.25.
    model
        .classifiers()
        .get(0)
        .unwrap()
        .set_parameters(&matrix(&[-1.0, 0.0, 1.0, 0.0], 2, 2), &vector(&[0.0, 0.0]))
        .unwrap();
    model
        .classifiers()
        .get(1)
        .unwrap()
        .set_parameters(&matrix(&[-1.0, 1.0, 1.0, -1.0], 2, 2), &vector(&[0.5, 0.0]))
        .unwrap();
    model
}

#[test]
fn test_query_near_task_one_class_zero() {
    let model = two_task_model("euclidean", DefaultExpert::Task);
    let out = model.predict(&batch(&[1]), None).unwrap();
    assert_eq!(out.indices, vec![1]);
    assert_eq!(out.preds, vec![2]);
}

#[test]
fn test_mixed_batch() {
    let model = two_task_model("euclidean", DefaultExpert::Task);
    let out = model.predict(&batch(&[1, 2, 3]), None).unwrap();
    assert_eq!(out.indices, vec![1, 0, 1]);
    assert_eq!(out.preds, vec![2, 1, 3]);

    let scores = out.task_scores.unwrap();
    assert_eq!(scores.dims(), &[3, 3, 2]);
    let class_indices = out.class_indices.unwrap();
    // token 3 is closest to the second class of task 1 under the origin expert
    assert_eq!(class_indices[2][0][1], 3);
}

#[test]
fn test_oracle_forces_task_for_every_metric() {
    for mode in ["cosine", "euclidean", "mahalanobis", "maha_ft"] {
        let model = two_task_model(mode, DefaultExpert::Task);
        let out = model.predict(&batch(&[1, 2, 3]), Some(0)).unwrap();
        assert_eq!(out.indices, vec![0, 0, 0], "mode {}", mode);
        assert_eq!(out.preds, vec![1, 1, 1], "mode {}", mode);
    }
}

#[test]
fn test_mahalanobis_modes_route_like_euclidean_here() {
    for mode in ["mahalanobis", "maha_ft"] {
        let model = two_task_model(mode, DefaultExpert::Bert);
        let out = model.predict(&batch(&[1, 2]), None).unwrap();
        assert_eq!(out.indices, vec![1, 0], "mode {}", mode);
    }
}

#[test]
fn test_oracle_out_of_range() {
    let model = two_task_model("euclidean", DefaultExpert::Task);
    assert!(model.predict(&batch(&[1]), Some(2)).is_err());
}

/// Three single-class tasks with means 0, 10 and 20 on a one-dimensional axis.
fn three_task_model(mode: &str, default_expert: DefaultExpert, max_expert: Option<usize>) -> EoeModel<FixedExtractor> {
    let mut cfg = config(1, 1, mode);
    cfg.model.default_expert = default_expert;
    cfg.model.max_expert = max_expert;
    let mut model = EoeModel::new(cfg, FixedExtractor::new(1, &[])).unwrap();

    for task in 0..3usize {
        model.new_task(1).unwrap();
        let mean = matrix(&[10.0 * task as f32], 1, 1);
        for expert in ExpertId::all(task + 1) {
            model.new_statistic(&mean, &identity(1), expert).unwrap();
        }
    }
    model
}

fn disagreeing_queries() -> Vec<candle_core::Tensor> {
    // origin sees 20 (task 2), Task(0) sees 10 (task 1), Task(1) and Task(2) see 20
    [20.0f32, 10.0, 20.0, 20.0]
        .iter()
        .map(|v| matrix(&[*v], 1, 1))
        .collect()
}

#[test]
fn test_majority_vote_through_model() {
    let model = three_task_model("euclidean", DefaultExpert::Task, None);
    let out = model.predict_from_embeddings(&disagreeing_queries(), None).unwrap();
    // votes: origin 2, Task(0) 1, Task(1) 2
    assert_eq!(out.indices, vec![2]);
    assert_eq!(out.preds, vec![2]);
}

#[test]
fn test_capped_vote_ties_back_to_default() {
    let model = three_task_model("euclidean", DefaultExpert::Task, Some(1));
    let out = model.predict_from_embeddings(&disagreeing_queries(), None).unwrap();
    assert_eq!(out.indices, vec![1]);

    let model = three_task_model("euclidean", DefaultExpert::Bert, Some(1));
    let out = model.predict_from_embeddings(&disagreeing_queries(), None).unwrap();
    assert_eq!(out.indices, vec![2]);
}

#[test]
fn test_wrong_embedding_count() {
    let model = three_task_model("euclidean", DefaultExpert::Task, None);
    let queries = disagreeing_queries();
    assert!(model.predict_from_embeddings(&queries[..3], None).is_err());
}

#[test]
fn test_maha_ft_scores_each_task_with_its_adapter_query() {
    // origin sees 0, Task(0) sees 10, Task(1) and Task(2) see 20
    let queries: Vec<candle_core::Tensor> = [0.0f32, 10.0, 20.0, 20.0]
        .iter()
        .map(|v| matrix(&[*v], 1, 1))
        .collect();

    // Shared queries: origin picks task 0, Task(0) picks task 1, the default wins.
    let model = three_task_model("mahalanobis", DefaultExpert::Task, None);
    let out = model.predict_from_embeddings(&queries, None).unwrap();
    assert_eq!(out.indices, vec![1]);

    // Per-task queries (10, 20, 20) replace the origin's own embedding, so
    // both guesses land on task 2.
    let model = three_task_model("maha_ft", DefaultExpert::Task, None);
    let out = model.predict_from_embeddings(&queries, None).unwrap();
    assert_eq!(out.indices, vec![2]);
}
