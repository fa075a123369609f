//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Device, Tensor};
use eoe_core::{
    Batch, EoeConfig, EoeError, EoeResult, ExtractRequest, FeatureExtractor, QueryMode, TaskKind,
    TrainingExample,
};

/// Extractor returning a fixed embedding per token id.
///
/// The embedding of a row is `table[row[1]]`, identical for every expert, so
/// routing depends only on the recorded statistics.
pub struct FixedExtractor {
    pub table: HashMap<u32, Vec<f32>>,
    pub width: usize,
    pub adapters: BTreeSet<usize>,
    pub backbone_keys: Vec<String>,
}

impl FixedExtractor {
    pub fn new(width: usize, table: &[(u32, &[f32])]) -> Self {
        Self {
            table: table.iter().map(|(k, v)| (*k, v.to_vec())).collect(),
            width,
            adapters: BTreeSet::new(),
            backbone_keys: Vec::new(),
        }
    }
}

impl FeatureExtractor for FixedExtractor {
    fn query_size(&self) -> usize {
        self.width
    }

    fn add_adapter(&mut self, task: usize) -> EoeResult<()> {
        self.adapters.insert(task);
        Ok(())
    }

    fn extract(&self, request: &ExtractRequest<'_>) -> EoeResult<Tensor> {
        let ids = request
            .input_ids
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2::<u32>())
            .map_err(|e| EoeError::TensorError {
                message: e.to_string(),
            })?;
        let mut flat = Vec::new();
        for row in &ids {
            let key = row.get(1).copied().unwrap_or(0);
            let embedding = self
                .table
                .get(&key)
                .cloned()
                .unwrap_or_else(|| vec![0.0; self.width]);
            flat.extend(embedding);
        }
        Tensor::from_vec(flat, (ids.len(), self.width), &Device::Cpu).map_err(|e| {
            EoeError::TensorError {
                message: e.to_string(),
            }
        })
    }

    fn load_backbone(&mut self, tensors: &HashMap<String, Tensor>) -> EoeResult<()> {
        let mut keys: Vec<String> = tensors.keys().cloned().collect();
        keys.sort();
        self.backbone_keys = keys;
        Ok(())
    }
}

/// Text-classification config with `width`-wide embeddings.
pub fn config(width: usize, class_per_task: usize, mode: &str) -> EoeConfig {
    let mut config = EoeConfig::default();
    config.model.task_name = TaskKind::TextClassification;
    config.model.hidden_size = width;
    config.model.class_per_task = class_per_task;
    config.model.query_mode = QueryMode::from(mode);
    config.regularizer.number_description = 1;
    config
}

/// Evaluation example whose embedding key is `token`.
pub fn example(token: u32, label: usize) -> TrainingExample {
    TrainingExample {
        input_ids: vec![101, token, 102],
        input_ids_without_marker: vec![101, token],
        marker_positions: [0, 1],
        entity_positions: [0, 1],
        label,
        descriptions: Vec::new(),
        old_descriptions: Vec::new(),
    }
}

pub fn batch(tokens: &[u32]) -> Batch {
    let examples: Vec<TrainingExample> = tokens.iter().map(|t| example(*t, 0)).collect();
    Batch::collate(&examples, &Device::Cpu).unwrap()
}

pub fn matrix(data: &[f32], rows: usize, cols: usize) -> Tensor {
    Tensor::from_slice(data, (rows, cols), &Device::Cpu).unwrap()
}

pub fn vector(data: &[f32]) -> Tensor {
    Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
}

pub fn identity(d: usize) -> Tensor {
    Tensor::eye(d, DType::F32, &Device::Cpu).unwrap()
}
