//! Checkpoint save / restore and backbone bootstrap.

mod common;

use std::collections::HashMap;

use candle_core::{safetensors, Device, Tensor};
use common::{batch, config, matrix, vector, FixedExtractor};
use eoe_core::{EoeError, EoeModel, ExpertId, ModelState, StubExtractor};

fn trained_model() -> EoeModel<StubExtractor> {
    let mut model = EoeModel::new(config(4, 2, "mahalanobis"), StubExtractor::new(4, &Device::Cpu)).unwrap();
    let data = batch(&[3, 4, 5, 6, 7, 8]);
    let labels = [0, 1, 0, 1, 0, 1];

    for task in 0..2usize {
        model.new_task(2).unwrap();
        for expert in ExpertId::all(task + 1) {
            let h = model.hidden_states(&data, expert).unwrap();
            model.observe_task(expert, &h, &labels).unwrap();
        }
    }
    model
}

#[test]
fn test_checkpoint_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let model = trained_model();
    model.save_checkpoint(dir.path()).unwrap();

    assert!(dir.path().join("classifier-0.safetensors").exists());
    assert!(dir.path().join("classifier-1.safetensors").exists());

    let state = ModelState::read(dir.path()).unwrap();
    assert_eq!(state.num_tasks, Some(1));
    assert_eq!(state.head_sizes, vec![2, 2]);
    assert_eq!(state.statistics.len(), 3);

    let restored = EoeModel::restore(dir.path(), StubExtractor::new(4, &Device::Cpu)).unwrap();
    assert_eq!(restored.num_tasks(), Some(1));
    assert_eq!(restored.num_labels(), 4);
    assert_eq!(restored.num_old_labels(), 2);

    for t in 0..2 {
        assert_eq!(
            model.classifiers().get(t).unwrap().weight().to_vec2::<f32>().unwrap(),
            restored.classifiers().get(t).unwrap().weight().to_vec2::<f32>().unwrap()
        );
    }
    for expert in ExpertId::all(2) {
        let a = model.statistics().get(expert).unwrap();
        let b = restored.statistics().get(expert).unwrap();
        assert_eq!(a.class_mean().len(), b.class_mean().len());
        assert_eq!(a.updates(), b.updates());
        assert_eq!(
            a.cov_inv().to_vec2::<f32>().unwrap(),
            b.cov_inv().to_vec2::<f32>().unwrap()
        );
    }

    let queries = batch(&[3, 6, 9]);
    let before = model.predict(&queries, None).unwrap();
    let after = restored.predict(&queries, None).unwrap();
    assert_eq!(before.indices, after.indices);
    assert_eq!(before.preds, after.preds);
}

#[test]
fn test_restore_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let result = EoeModel::restore(&dir.path().join("absent"), StubExtractor::new(4, &Device::Cpu));
    assert!(matches!(result, Err(EoeError::IoError(_))));
}

#[test]
fn test_single_classifier_reload() {
    let dir = tempfile::tempdir().unwrap();
    let model = trained_model();
    model.save_classifier(1, dir.path()).unwrap();

    let other = trained_model();
    other.load_classifier(1, dir.path()).unwrap();
    assert_eq!(
        model.classifiers().get(1).unwrap().bias().to_vec1::<f32>().unwrap(),
        other.classifiers().get(1).unwrap().bias().to_vec1::<f32>().unwrap()
    );
}

#[test]
fn test_backbone_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backbone.safetensors");

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("model.encoder.weight".to_string(), matrix(&[1.0; 4], 2, 2));
    tensors.insert("model.pooler.bias".to_string(), vector(&[0.0, 0.0]));
    tensors.insert(
        "linear.weight".to_string(),
        matrix(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], 4, 2),
    );
    tensors.insert("linear.bias".to_string(), vector(&[0.1, 0.2, 0.3, 0.4]));
    safetensors::save(&tensors, &path).unwrap();

    let mut model = EoeModel::new(config(2, 2, "euclidean"), FixedExtractor::new(2, &[])).unwrap();
    model.new_task(2).unwrap();
    model.load_expert_model(&path).unwrap();

    assert_eq!(
        model.extractor().backbone_keys,
        vec!["encoder.weight".to_string(), "pooler.bias".to_string()]
    );
    let head = model.classifiers().get(0).unwrap();
    assert_eq!(
        head.weight().to_vec2::<f32>().unwrap(),
        vec![vec![1.0, 2.0], vec![3.0, 4.0]]
    );
    assert_eq!(head.bias().to_vec1::<f32>().unwrap(), vec![0.1, 0.2]);
}

#[test]
fn test_backbone_before_first_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backbone.safetensors");
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("linear.weight".to_string(), matrix(&[1.0; 4], 2, 2));
    tensors.insert("linear.bias".to_string(), vector(&[0.0, 0.0]));
    safetensors::save(&tensors, &path).unwrap();

    let mut model = EoeModel::new(config(2, 2, "euclidean"), FixedExtractor::new(2, &[])).unwrap();
    assert!(matches!(
        model.load_expert_model(&path),
        Err(EoeError::CheckpointError { .. })
    ));
}
